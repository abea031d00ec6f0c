//! QUIC bidirectional stream adapter

use p2pvpn_transport::{PeerId, ResourceScope, StreamScope};
use quinn::{RecvStream, SendStream, VarInt};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Application error code sent when a stream is aborted
pub(crate) const RESET_CODE: VarInt = VarInt::from_u32(1);

/// Longest protocol id accepted in a stream header
pub(crate) const MAX_PROTOCOL_LEN: usize = u8::MAX as usize;

/// One tunnel stream carried on a QUIC bidirectional stream
#[derive(Debug)]
pub struct QuicVpnStream {
    send: SendStream,
    recv: RecvStream,
    remote_peer: PeerId,
    protocol: String,
    scope: StreamScope,
}

impl QuicVpnStream {
    pub(crate) fn new(
        send: SendStream,
        recv: RecvStream,
        remote_peer: PeerId,
        protocol: String,
        scope: StreamScope,
    ) -> Self {
        Self {
            send,
            recv,
            remote_peer,
            protocol,
            scope,
        }
    }

    /// QUIC stream id of the send half
    pub fn stream_id(&self) -> u64 {
        self.send.id().index()
    }
}

impl p2pvpn_transport::TransportStream for QuicVpnStream {
    fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn scope(&self) -> &dyn ResourceScope {
        &self.scope
    }

    fn reset(&mut self) {
        debug!(
            "Resetting stream {} to peer {}",
            self.stream_id(),
            self.remote_peer.short()
        );
        // Both halves may already be closed; nothing left to abort then.
        let _ = self.send.reset(RESET_CODE);
        let _ = self.recv.stop(RESET_CODE);
    }
}

impl AsyncRead for QuicVpnStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicVpnStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

/// Encode the header that names the protocol of a new stream
pub(crate) fn encode_header(protocol: &str) -> Option<Vec<u8>> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return None;
    }
    let mut header = Vec::with_capacity(1 + protocol.len());
    header.push(protocol.len() as u8);
    header.extend_from_slice(protocol.as_bytes());
    Some(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_header() {
        let header = encode_header("/vpn/tun/1.0.0").unwrap();
        assert_eq!(header[0] as usize, "/vpn/tun/1.0.0".len());
        assert_eq!(&header[1..], b"/vpn/tun/1.0.0");
    }

    #[test]
    fn test_encode_header_rejects_bad_lengths() {
        assert!(encode_header("").is_none());
        assert!(encode_header(&"x".repeat(MAX_PROTOCOL_LEN)).is_some());
        assert!(encode_header(&"x".repeat(MAX_PROTOCOL_LEN + 1)).is_none());
    }
}
