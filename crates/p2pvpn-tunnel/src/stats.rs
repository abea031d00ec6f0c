//! Relay counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the inbound handlers and the outbound loop
#[derive(Debug, Default)]
pub struct RelayStats {
    frames_out: AtomicU64,
    bytes_out: AtomicU64,
    frames_in: AtomicU64,
    bytes_in: AtomicU64,
    frames_dropped: AtomicU64,
    streams_opened: AtomicU64,
    streams_rejected: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames relayed device → stream
    pub frames_out: u64,
    pub bytes_out: u64,
    /// Frames relayed stream → device
    pub frames_in: u64,
    pub bytes_in: u64,
    /// Device frames lost because no outbound stream could carry them
    pub frames_dropped: u64,
    /// Outbound streams opened
    pub streams_opened: u64,
    /// Inbound streams refused before relaying
    pub streams_rejected: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_out(&self, size: usize) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_in(&self, size: usize) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.streams_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_rejected: self.streams_rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = RelayStats::new();
        stats.record_out(46);
        stats.record_out(100);
        stats.record_in(10);
        stats.record_dropped();
        stats.record_opened();
        stats.record_rejected();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                frames_out: 2,
                bytes_out: 146,
                frames_in: 1,
                bytes_in: 10,
                frames_dropped: 1,
                streams_opened: 1,
                streams_rejected: 1,
            }
        );
    }
}
