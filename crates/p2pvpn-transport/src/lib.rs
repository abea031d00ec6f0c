//! Transport abstraction layer for tunnel streams
//!
//! The tunnel never dials sockets or performs handshakes itself. It consumes
//! authenticated, ordered, reliable byte streams between named peers through
//! the traits in this crate, so any transport that can name the remote peer
//! of a stream can carry tunnel traffic.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    p2pvpn-tunnel                         │
//! │        (inbound handler, outbound relay loop)            │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │             p2pvpn-transport (this crate)                │
//! │  - StreamHost           - TransportStream                │
//! │  - ResourceScope        - PeerId / PeerAddr              │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌───────────────────────────┬─────────────────────────────┐
//! │ p2pvpn-transport-quic     │ p2pvpn-testing (in-memory)  │
//! └───────────────────────────┴─────────────────────────────┘
//! ```

pub mod peer;
pub mod registry;
pub mod scope;

pub use peer::{PeerAddr, PeerId};
pub use registry::HandlerRegistry;
pub use scope::{ResourceManager, ResourceScope, StreamScope};

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Stream reset")]
    StreamReset,

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(PeerId),

    #[error("Protocol not supported: {0}")]
    ProtocolNotSupported(String),

    #[error("Resource limit exceeded: requested {requested} bytes, {available} available")]
    ResourceLimitExceeded { requested: usize, available: usize },

    #[error("Scope already attached to service {0}")]
    ServiceConflict(String),

    #[error("Peer identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: PeerId, actual: PeerId },

    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("Invalid peer address: {0}")]
    InvalidPeerAddr(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// An authenticated bidirectional byte stream to one remote peer
///
/// Reads and writes go through [`AsyncRead`]/[`AsyncWrite`]; a graceful close
/// is `AsyncWriteExt::shutdown`. [`TransportStream::reset`] aborts the stream
/// in both directions without flushing.
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send + Debug + 'static {
    /// Identity of the peer on the other end, as proven by the transport
    fn remote_peer(&self) -> &PeerId;

    /// Protocol identifier this stream was opened for
    fn protocol(&self) -> &str;

    /// Resource accounting scope owned by this stream
    fn scope(&self) -> &dyn ResourceScope;

    /// Abort the stream abruptly
    fn reset(&mut self);
}

/// Callback invoked once per inbound stream for a registered protocol
pub type StreamHandler<S> = Arc<dyn Fn(S) -> BoxFuture<'static, ()> + Send + Sync>;

/// A local transport endpoint that accepts and opens streams by protocol
#[async_trait]
pub trait StreamHost: Send + Sync {
    /// The stream type produced by this host
    type Stream: TransportStream;

    /// Identity of this host
    fn local_peer(&self) -> &PeerId;

    /// Route inbound streams for `protocol` to `handler`
    ///
    /// Replaces any handler previously registered for the same protocol.
    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler<Self::Stream>);

    /// Stop routing inbound streams for `protocol`
    fn remove_stream_handler(&self, protocol: &str);

    /// Open a new outbound stream to `peer` speaking `protocol`
    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> TransportResult<Self::Stream>;

    /// Establish (or confirm) a connection to a remote peer
    ///
    /// Retrying is left to the caller.
    async fn connect(&self, addr: &PeerAddr) -> TransportResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let peer: PeerId = "abcd".parse().unwrap();
        let err = TransportError::PeerUnreachable(peer);
        assert_eq!(err.to_string(), "Peer unreachable: abcd");

        let err = TransportError::ResourceLimitExceeded {
            requested: 1566,
            available: 10,
        };
        assert!(err.to_string().contains("1566"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: TransportError = io.into();
        assert!(matches!(err, TransportError::IoError(_)));
    }
}
