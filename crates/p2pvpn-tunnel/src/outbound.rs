//! Device → stream direction

use crate::{RelayStats, VpnError};
use p2pvpn_device::VirtualInterface;
use p2pvpn_proto::{FrameCodec, MAX_FRAME_SIZE, SERVICE_NAME};
use p2pvpn_transport::{PeerId, StreamHost, TransportStream};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, trace, warn};

/// Relays device frames onto a single, lazily opened outbound stream
///
/// The stream is opened on the first frame, kept while writes succeed and
/// discarded on the first failed write; the next frame opens a new one.
pub struct OutboundRelay<'a, H: StreamHost, D: ?Sized> {
    host: &'a H,
    device: &'a D,
    peer: &'a PeerId,
    protocol: &'static str,
    stats: &'a RelayStats,
    codec: FrameCodec,
    stream: Option<H::Stream>,
}

impl<'a, H, D> OutboundRelay<'a, H, D>
where
    H: StreamHost,
    D: VirtualInterface + ?Sized,
{
    pub fn new(
        host: &'a H,
        device: &'a D,
        peer: &'a PeerId,
        protocol: &'static str,
        stats: &'a RelayStats,
    ) -> Self {
        Self {
            host,
            device,
            peer,
            protocol,
            stats,
            codec: FrameCodec::new(),
            stream: None,
        }
    }

    /// Whether an outbound stream is currently cached
    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// Read and relay frames until the device fails
    ///
    /// Always ends with the device read error.
    pub async fn run(&mut self) -> VpnError {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];

        loop {
            let n = match self.device.read_frame(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    error!("if->p2p: reading from {} failed: {}", self.device.name(), e);
                    self.discard_stream().await;
                    return VpnError::device_io(self.device.name(), e);
                }
            };

            if let Err(e) = self.relay_frame(&buf[..n]).await {
                warn!("if->p2p: dropped {} byte frame: {}", n, e);
            }
        }
    }

    /// Send one frame, opening a stream first if none is cached
    ///
    /// The frame is lost when the open or the write fails.
    pub async fn relay_frame(&mut self, frame: &[u8]) -> Result<(), VpnError> {
        let wire = match self.codec.encode_frame(frame) {
            Ok(wire) => wire,
            Err(e) => {
                self.stats.record_dropped();
                return Err(e.into());
            }
        };

        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => match open(self.host, self.peer, self.protocol, self.stats).await {
                Ok(stream) => stream,
                Err(e) => {
                    self.stats.record_dropped();
                    return Err(e);
                }
            },
        };

        if let Err(e) = stream.write_all(&wire).await {
            self.stats.record_dropped();
            debug!("if->p2p: discarding stream to {}", self.peer.short());
            let _ = stream.shutdown().await;
            return Err(VpnError::StreamIo(e.into()));
        }

        self.stream = Some(stream);
        self.stats.record_out(frame.len());
        trace!(size = frame.len(), "if->p2p");
        Ok(())
    }

    async fn discard_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

/// Open and tag a fresh outbound stream
async fn open<H: StreamHost>(
    host: &H,
    peer: &PeerId,
    protocol: &'static str,
    stats: &RelayStats,
) -> Result<H::Stream, VpnError> {
    let mut stream = host.open_stream(peer, protocol).await?;

    if let Err(e) = stream.scope().set_service(SERVICE_NAME) {
        stream.reset();
        return Err(e.into());
    }

    stats.record_opened();
    info!("if->p2p: opened {} stream to {}", protocol, peer.short());
    Ok(stream)
}
