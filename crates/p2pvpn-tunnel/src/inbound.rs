//! Stream → device direction
//!
//! One handler instance runs per accepted stream:
//!
//! ```text
//! Unauthorized ──(peer matches, tagged, budget reserved)──> Relaying ──> Closed
//!      │                                                       ↑
//!      └──────────────────(any setup failure: reset)───────────┘
//! ```

use crate::{RelayStats, VpnError};
use futures::StreamExt;
use p2pvpn_device::VirtualInterface;
use p2pvpn_proto::{FrameCodec, SERVICE_NAME, STREAM_BUDGET};
use p2pvpn_transport::{PeerId, TransportError, TransportStream};
use std::ops::{Deref, DerefMut};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, trace, warn};

/// A stream together with the memory it holds in its scope
///
/// The reservation is returned exactly once, when the guard is dropped.
struct BudgetGuard<S: TransportStream> {
    stream: S,
    size: usize,
}

impl<S: TransportStream> BudgetGuard<S> {
    fn reserve(stream: S, size: usize) -> Result<Self, (S, TransportError)> {
        match stream.scope().reserve_memory(size) {
            Ok(()) => Ok(Self { stream, size }),
            Err(e) => Err((stream, e)),
        }
    }
}

impl<S: TransportStream> Deref for BudgetGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.stream
    }
}

impl<S: TransportStream> DerefMut for BudgetGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S: TransportStream> Drop for BudgetGuard<S> {
    fn drop(&mut self) {
        self.stream.scope().release_memory(self.size);
    }
}

/// Serve one inbound stream until it closes or fails
pub async fn handle_inbound<S, D>(stream: S, device: &D, authorized: &PeerId, stats: &RelayStats)
where
    S: TransportStream,
    D: VirtualInterface + ?Sized,
{
    let peer = stream.remote_peer().clone();

    match relay_inbound(stream, device, authorized, stats).await {
        Ok(()) => debug!("p2p->if: stream from {} closed", peer.short()),
        Err(e @ VpnError::Authorization { .. }) => error!("p2p->if: {}", e),
        Err(e) => warn!("p2p->if: stream from {} ended: {}", peer.short(), e),
    }
}

async fn relay_inbound<S, D>(
    mut stream: S,
    device: &D,
    authorized: &PeerId,
    stats: &RelayStats,
) -> Result<(), VpnError>
where
    S: TransportStream,
    D: VirtualInterface + ?Sized,
{
    if stream.remote_peer() != authorized {
        let actual = stream.remote_peer().clone();
        stream.reset();
        stats.record_rejected();
        return Err(VpnError::Authorization {
            expected: authorized.clone(),
            actual,
        });
    }

    if let Err(e) = stream.scope().set_service(SERVICE_NAME) {
        stream.reset();
        stats.record_rejected();
        return Err(e.into());
    }

    let mut stream = match BudgetGuard::reserve(stream, STREAM_BUDGET) {
        Ok(guard) => guard,
        Err((mut stream, e)) => {
            stream.reset();
            stats.record_rejected();
            return Err(e.into());
        }
    };

    debug!(
        "p2p->if: relaying stream from {} into {}",
        authorized.short(),
        device.name()
    );

    let result = {
        let mut frames = FramedRead::new(&mut *stream, FrameCodec::new());
        relay_frames(&mut frames, device, stats).await
    };

    if let Err(e) = stream.shutdown().await {
        trace!("p2p->if: close after relay failed: {}", e);
    }

    result
}

async fn relay_frames<R, D>(
    frames: &mut FramedRead<R, FrameCodec>,
    device: &D,
    stats: &RelayStats,
) -> Result<(), VpnError>
where
    R: tokio::io::AsyncRead + Unpin,
    D: VirtualInterface + ?Sized,
{
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        device
            .write_frame(&frame)
            .await
            .map_err(|e| VpnError::device_io(device.name(), e))?;
        stats.record_in(frame.len());
        trace!(size = frame.len(), "p2p->if");
    }
    Ok(())
}
