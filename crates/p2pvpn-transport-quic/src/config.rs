//! QUIC host configuration

use p2pvpn_transport::{ResourceManager, TransportError, TransportResult};
use quinn::{IdleTimeout, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Settings for a [`crate::QuicHost`]
#[derive(Debug, Clone)]
pub struct QuicHostConfig {
    /// UDP address to listen on (port 0 picks a free port)
    pub listen_addr: SocketAddr,

    /// Keep-alive interval
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout
    pub max_idle_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams per connection
    pub max_concurrent_streams: u64,

    /// Memory budget shared by all streams of the host
    pub stream_memory_limit: usize,
}

impl QuicHostConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            keep_alive_interval: Duration::from_secs(3),
            max_idle_timeout: Duration::from_secs(10),
            max_concurrent_streams: 100,
            stream_memory_limit: ResourceManager::DEFAULT_LIMIT,
        }
    }

    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set custom idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    /// Set maximum concurrent streams
    pub fn with_max_streams(mut self, max: u64) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    /// Set the stream memory budget
    pub fn with_stream_memory_limit(mut self, limit: usize) -> Self {
        self.stream_memory_limit = limit;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }

        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::ConfigurationError(
                "Idle timeout must be at least 2x keep-alive interval".to_string(),
            ));
        }

        if self.max_concurrent_streams == 0 {
            return Err(TransportError::ConfigurationError(
                "At least one concurrent stream is required".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the quinn transport parameters shared by client and server
    pub(crate) fn transport_config(&self) -> TransportResult<Arc<quinn::TransportConfig>> {
        let idle = IdleTimeout::try_from(self.max_idle_timeout)
            .map_err(|e| TransportError::ConfigurationError(format!("Idle timeout: {}", e)))?;
        let streams = VarInt::from_u64(self.max_concurrent_streams)
            .map_err(|e| TransportError::ConfigurationError(format!("Stream limit: {}", e)))?;

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(idle));
        transport.max_concurrent_bidi_streams(streams);
        transport.max_concurrent_uni_streams(VarInt::from_u32(0));

        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QuicHostConfig {
        QuicHostConfig::new("127.0.0.1:0".parse().unwrap())
    }

    #[test]
    fn test_defaults() {
        let config = config();
        assert_eq!(config.keep_alive_interval, Duration::from_secs(3));
        assert_eq!(config.max_idle_timeout, Duration::from_secs(10));
        assert_eq!(config.max_concurrent_streams, 100);
        assert_eq!(config.stream_memory_limit, 16 * 1024 * 1024);
        assert!(config.validate().is_ok());
        assert!(config.transport_config().is_ok());
    }

    #[test]
    fn test_invalid_config_validation() {
        assert!(config()
            .with_idle_timeout(Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(config()
            .with_keep_alive(Duration::ZERO)
            .validate()
            .is_err());
        assert!(config().with_max_streams(0).validate().is_err());
    }
}
