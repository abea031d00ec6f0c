//! Per-stream resource accounting

use crate::{TransportError, TransportResult};
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Budget accounting attached to a single stream
pub trait ResourceScope: Send + Sync + Debug {
    /// Tag the stream with the service that owns it
    fn set_service(&self, service: &str) -> TransportResult<()>;

    /// Service the stream is tagged with, if any
    fn service(&self) -> Option<String>;

    /// Reserve `size` bytes of memory for the stream
    fn reserve_memory(&self, size: usize) -> TransportResult<()>;

    /// Return `size` previously reserved bytes
    fn release_memory(&self, size: usize);
}

/// Shared memory budget that all stream scopes of a host draw from
#[derive(Debug)]
pub struct ResourceManager {
    limit: usize,
    used: AtomicUsize,
}

impl ResourceManager {
    /// Default memory limit for all streams of one host (16MB)
    pub const DEFAULT_LIMIT: usize = 16 * 1024 * 1024;

    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicUsize::new(0),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    fn reserve(&self, size: usize) -> TransportResult<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= self.limit)
            })
            .map(|_| ())
            .map_err(|used| TransportError::ResourceLimitExceeded {
                requested: size,
                available: self.limit.saturating_sub(used),
            })
    }

    fn release(&self, size: usize) {
        // Callers never release more than they reserved.
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(size))
            });
    }
}

/// Scope handed out with each stream
///
/// Anything still reserved when the scope is dropped goes back to the
/// manager, so a stream torn down mid-relay cannot leak budget.
#[derive(Debug)]
pub struct StreamScope {
    manager: Arc<ResourceManager>,
    reserved: AtomicUsize,
    service: Mutex<Option<String>>,
}

impl StreamScope {
    pub fn new(manager: Arc<ResourceManager>) -> Self {
        Self {
            manager,
            reserved: AtomicUsize::new(0),
            service: Mutex::new(None),
        }
    }

    /// Bytes currently reserved by this scope
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }
}

impl ResourceScope for StreamScope {
    fn set_service(&self, service: &str) -> TransportResult<()> {
        let mut current = self
            .service
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match current.as_deref() {
            Some(existing) if existing != service => {
                Err(TransportError::ServiceConflict(existing.to_string()))
            }
            _ => {
                *current = Some(service.to_string());
                Ok(())
            }
        }
    }

    fn service(&self) -> Option<String> {
        self.service
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn reserve_memory(&self, size: usize) -> TransportResult<()> {
        self.manager.reserve(size)?;
        self.reserved.fetch_add(size, Ordering::AcqRel);
        trace!(size, reserved = self.reserved(), "Reserved stream memory");
        Ok(())
    }

    fn release_memory(&self, size: usize) {
        let released = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                Some(reserved.saturating_sub(size))
            })
            .map(|before| before.min(size))
            .unwrap_or(0);

        self.manager.release(released);
        trace!(size = released, "Released stream memory");
    }
}

impl Drop for StreamScope {
    fn drop(&mut self) {
        let leftover = *self.reserved.get_mut();
        if leftover > 0 {
            self.manager.release(leftover);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let manager = ResourceManager::new(4096);
        let scope = StreamScope::new(manager.clone());

        scope.reserve_memory(1566).unwrap();
        assert_eq!(scope.reserved(), 1566);
        assert_eq!(manager.used(), 1566);

        scope.release_memory(1566);
        assert_eq!(scope.reserved(), 0);
        assert_eq!(manager.used(), 0);
    }

    #[test]
    fn test_reserve_over_limit_fails_without_side_effects() {
        let manager = ResourceManager::new(2000);
        let first = StreamScope::new(manager.clone());
        let second = StreamScope::new(manager.clone());

        first.reserve_memory(1566).unwrap();
        let err = second.reserve_memory(1566).unwrap_err();

        assert!(matches!(
            err,
            TransportError::ResourceLimitExceeded {
                requested: 1566,
                available: 434
            }
        ));
        assert_eq!(second.reserved(), 0);
        assert_eq!(manager.used(), 1566);
    }

    #[test]
    fn test_release_never_exceeds_reservation() {
        let manager = ResourceManager::new(4096);
        let other = StreamScope::new(manager.clone());
        other.reserve_memory(1000).unwrap();

        let scope = StreamScope::new(manager.clone());
        scope.reserve_memory(100).unwrap();
        scope.release_memory(500);

        assert_eq!(scope.reserved(), 0);
        assert_eq!(manager.used(), 1000);
    }

    #[test]
    fn test_drop_returns_leftover_budget() {
        let manager = ResourceManager::new(4096);
        {
            let scope = StreamScope::new(manager.clone());
            scope.reserve_memory(1566).unwrap();
            assert_eq!(manager.used(), 1566);
        }
        assert_eq!(manager.used(), 0);
    }

    #[test]
    fn test_service_tagging() {
        let scope = StreamScope::new(ResourceManager::new(1024));
        assert_eq!(scope.service(), None);

        scope.set_service("p2pvpn").unwrap();
        scope.set_service("p2pvpn").unwrap();
        assert_eq!(scope.service().as_deref(), Some("p2pvpn"));

        let err = scope.set_service("other").unwrap_err();
        assert!(matches!(err, TransportError::ServiceConflict(ref s) if s == "p2pvpn"));
    }
}
