//! Tunnel endpoint tying one device to one remote peer

use crate::inbound::handle_inbound;
use crate::outbound::OutboundRelay;
use crate::{RelayStats, VpnError};
use futures::FutureExt;
use p2pvpn_device::VirtualInterface;
use p2pvpn_transport::{PeerId, StreamHandler, StreamHost, TransportStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// A point-to-point tunnel between the local device and one peer
pub struct TunnelService<D: ?Sized> {
    device: Arc<D>,
    peer: PeerId,
    stats: Arc<RelayStats>,
    serving: AtomicBool,
}

/// Marks a service as serving until dropped
struct ServingGuard<'a>(&'a AtomicBool);

impl<'a> ServingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ServingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<D> TunnelService<D>
where
    D: VirtualInterface + ?Sized + 'static,
{
    /// Create a service that only talks to `peer`
    pub fn new(device: Arc<D>, peer: PeerId) -> Self {
        Self {
            device,
            peer,
            stats: Arc::new(RelayStats::new()),
            serving: AtomicBool::new(false),
        }
    }

    /// Protocol identifier advertised for this device's link mode
    pub fn protocol(&self) -> &'static str {
        p2pvpn_proto::protocol_id(self.device.is_link_layer())
    }

    /// The only peer allowed to send frames to this device
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Inbound stream handler bound to this service's device and peer
    pub fn handler<S: TransportStream>(&self) -> StreamHandler<S> {
        let device = self.device.clone();
        let peer = self.peer.clone();
        let stats = self.stats.clone();

        Arc::new(move |stream: S| {
            let device = device.clone();
            let peer = peer.clone();
            let stats = stats.clone();
            async move { handle_inbound(stream, &*device, &peer, &stats).await }.boxed()
        })
    }

    /// Route inbound streams for [`Self::protocol`] to this service
    pub fn register<H: StreamHost>(&self, host: &H) {
        host.set_stream_handler(self.protocol(), self.handler());
        info!(
            "Accepting {} streams from {} on {}",
            self.protocol(),
            self.peer.short(),
            self.device.name()
        );
    }

    /// Whether an outbound relay loop is currently running
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::Acquire)
    }

    /// Run the outbound relay loop until the device fails
    ///
    /// Only one loop runs per service; a concurrent call fails with
    /// [`VpnError::AlreadyServing`] without touching the device.
    pub async fn serve<H: StreamHost>(&self, host: &H) -> Result<(), VpnError> {
        let Some(_serving) = ServingGuard::acquire(&self.serving) else {
            warn!("Outbound relay to {} is already running", self.peer.short());
            return Err(VpnError::AlreadyServing(self.peer.clone()));
        };

        info!(
            "Relaying {} (mtu {}) to {}",
            self.device.name(),
            self.device.mtu(),
            self.peer.short()
        );

        let mut relay = OutboundRelay::new(
            host,
            &*self.device,
            &self.peer,
            self.protocol(),
            &self.stats,
        );
        Err(relay.run().await)
    }
}
