//! In-memory stream transport
//!
//! Hosts attached to the same [`MemoryNetwork`] open streams to each other
//! over `tokio::io::duplex` pipes. Every stream carries a
//! [`RecordingScope`] and is recorded on both hosts, so tests can check
//! resets, shutdowns and budget accounting after the fact.

use async_trait::async_trait;
use p2pvpn_transport::{
    HandlerRegistry, PeerAddr, PeerId, ResourceManager, ResourceScope, StreamHandler, StreamHost,
    StreamScope, TransportError, TransportResult, TransportStream,
};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tracing::debug;

const PIPE_CAPACITY: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resource scope that records every call made on it
#[derive(Debug)]
pub struct RecordingScope {
    inner: StreamScope,
    reserve_attempts: Mutex<Vec<usize>>,
    releases: Mutex<Vec<usize>>,
    fail_reserve: bool,
    fail_set_service: bool,
}

impl RecordingScope {
    fn new(manager: Arc<ResourceManager>, fail_reserve: bool, fail_set_service: bool) -> Self {
        Self {
            inner: StreamScope::new(manager),
            reserve_attempts: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
            fail_reserve,
            fail_set_service,
        }
    }

    /// Sizes passed to `reserve_memory`, including failed attempts
    pub fn reserve_attempts(&self) -> Vec<usize> {
        lock(&self.reserve_attempts).clone()
    }

    /// Sizes passed to `release_memory`
    pub fn releases(&self) -> Vec<usize> {
        lock(&self.releases).clone()
    }

    /// Bytes currently held
    pub fn reserved(&self) -> usize {
        self.inner.reserved()
    }
}

impl ResourceScope for RecordingScope {
    fn set_service(&self, service: &str) -> TransportResult<()> {
        if self.fail_set_service {
            return Err(TransportError::ServiceConflict("injected".to_string()));
        }
        self.inner.set_service(service)
    }

    fn service(&self) -> Option<String> {
        self.inner.service()
    }

    fn reserve_memory(&self, size: usize) -> TransportResult<()> {
        lock(&self.reserve_attempts).push(size);
        if self.fail_reserve {
            return Err(TransportError::ResourceLimitExceeded {
                requested: size,
                available: 0,
            });
        }
        self.inner.reserve_memory(size)
    }

    fn release_memory(&self, size: usize) {
        lock(&self.releases).push(size);
        self.inner.release_memory(size);
    }
}

#[derive(Debug, Default)]
struct HalfState {
    reset: AtomicBool,
    shut_down: AtomicBool,
}

/// One end of an in-memory stream
#[derive(Debug)]
pub struct MemoryStream {
    io: Option<DuplexStream>,
    remote_peer: PeerId,
    protocol: String,
    scope: Arc<RecordingScope>,
    local: Arc<HalfState>,
    remote: Arc<HalfState>,
}

impl MemoryStream {
    fn check_reset(&self) -> io::Result<()> {
        if self.local.reset.load(Ordering::SeqCst) || self.remote.reset.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "stream reset"));
        }
        Ok(())
    }

    fn io(&mut self) -> io::Result<&mut DuplexStream> {
        self.check_reset()?;
        self.io
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionReset, "stream reset"))
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let io = match self.io() {
            Ok(io) => io,
            Err(e) => return Poll::Ready(Err(e)),
        };
        let poll = Pin::new(io).poll_read(cx, buf);
        // A peer reset tears down the pipe; report it instead of a clean EOF.
        match poll {
            Poll::Ready(Ok(())) => Poll::Ready(self.check_reset()),
            other => other,
        }
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.io() {
            Ok(io) => Pin::new(io).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.io() {
            Ok(io) => Pin::new(io).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.local.shut_down.store(true, Ordering::SeqCst);
        match self.io.as_mut() {
            Some(io) => Pin::new(io).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl TransportStream for MemoryStream {
    fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn scope(&self) -> &dyn ResourceScope {
        self.scope.as_ref()
    }

    fn reset(&mut self) {
        self.local.reset.store(true, Ordering::SeqCst);
        // Dropping the pipe wakes the peer's pending read.
        self.io = None;
    }
}

/// Observer for one end of a stream, kept by the host that owns that end
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub protocol: String,
    pub remote_peer: PeerId,
    scope: Arc<RecordingScope>,
    local: Arc<HalfState>,
    remote: Arc<HalfState>,
}

impl StreamRecord {
    pub fn scope(&self) -> &RecordingScope {
        &self.scope
    }

    /// Whether this end was reset
    pub fn was_reset(&self) -> bool {
        self.local.reset.load(Ordering::SeqCst)
    }

    /// Whether this end was closed gracefully
    pub fn was_shut_down(&self) -> bool {
        self.local.shut_down.load(Ordering::SeqCst)
    }

    /// Make the stream look reset by the other side
    ///
    /// Subsequent reads and writes on this end fail.
    pub fn reset_from_peer(&self) {
        self.remote.reset.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct HostShared {
    peer: PeerId,
    handlers: HandlerRegistry<MemoryStream>,
    resources: Arc<ResourceManager>,
    reachable: AtomicBool,
    fail_reserve: AtomicBool,
    fail_set_service: AtomicBool,
    failing_opens: AtomicUsize,
    open_calls: AtomicUsize,
    connects: Mutex<Vec<PeerAddr>>,
    inbound: Mutex<Vec<StreamRecord>>,
    outbound: Mutex<Vec<StreamRecord>>,
}

impl HostShared {
    fn scope(&self) -> Arc<RecordingScope> {
        Arc::new(RecordingScope::new(
            self.resources.clone(),
            self.fail_reserve.load(Ordering::SeqCst),
            self.fail_set_service.load(Ordering::SeqCst),
        ))
    }
}

/// A set of hosts that can reach each other
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    hosts: Arc<Mutex<HashMap<PeerId, Arc<HostShared>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a host with the given identity
    pub fn host(&self, peer: &str) -> MemoryHost {
        self.host_with_limit(peer, ResourceManager::DEFAULT_LIMIT)
    }

    /// Attach a host whose streams share a memory budget of `limit` bytes
    pub fn host_with_limit(&self, peer: &str, limit: usize) -> MemoryHost {
        let peer = PeerId::from_certificate_der(peer.as_bytes());
        let shared = Arc::new(HostShared {
            peer: peer.clone(),
            handlers: HandlerRegistry::new(),
            resources: ResourceManager::new(limit),
            reachable: AtomicBool::new(true),
            fail_reserve: AtomicBool::new(false),
            fail_set_service: AtomicBool::new(false),
            failing_opens: AtomicUsize::new(0),
            open_calls: AtomicUsize::new(0),
            connects: Mutex::new(Vec::new()),
            inbound: Mutex::new(Vec::new()),
            outbound: Mutex::new(Vec::new()),
        });
        lock(&self.hosts).insert(peer, shared.clone());

        MemoryHost {
            shared,
            network: self.clone(),
        }
    }

    fn lookup(&self, peer: &PeerId) -> Option<Arc<HostShared>> {
        lock(&self.hosts).get(peer).cloned()
    }
}

/// A host on a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryHost {
    shared: Arc<HostShared>,
    network: MemoryNetwork,
}

impl MemoryHost {
    pub fn peer_id(&self) -> PeerId {
        self.shared.peer.clone()
    }

    /// Address other hosts can `connect` to
    pub fn peer_addr(&self) -> PeerAddr {
        PeerAddr::new(self.shared.peer.clone(), "127.0.0.1:4001")
    }

    /// Toggle whether other hosts can open streams to this one
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make the next `count` calls to `open_stream` on this host fail
    pub fn fail_next_opens(&self, count: usize) {
        self.shared.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Make `reserve_memory` fail on streams created for this host from now on
    pub fn fail_reservations(&self, fail: bool) {
        self.shared.fail_reserve.store(fail, Ordering::SeqCst);
    }

    /// Make `set_service` fail on streams created for this host from now on
    pub fn fail_set_service(&self, fail: bool) {
        self.shared.fail_set_service.store(fail, Ordering::SeqCst);
    }

    /// Number of `open_stream` calls made on this host
    pub fn open_calls(&self) -> usize {
        self.shared.open_calls.load(Ordering::SeqCst)
    }

    /// Addresses passed to `connect`
    pub fn connects(&self) -> Vec<PeerAddr> {
        lock(&self.shared.connects).clone()
    }

    /// Streams accepted by this host, in arrival order
    pub fn inbound_streams(&self) -> Vec<StreamRecord> {
        lock(&self.shared.inbound).clone()
    }

    /// Streams opened by this host, in order
    pub fn outbound_streams(&self) -> Vec<StreamRecord> {
        lock(&self.shared.outbound).clone()
    }

    /// Bytes currently reserved across all of this host's streams
    pub fn memory_in_use(&self) -> usize {
        self.shared.resources.used()
    }

    pub fn has_handler(&self, protocol: &str) -> bool {
        self.shared.handlers.contains(protocol)
    }
}

#[async_trait]
impl StreamHost for MemoryHost {
    type Stream = MemoryStream;

    fn local_peer(&self) -> &PeerId {
        &self.shared.peer
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler<MemoryStream>) {
        self.shared.handlers.insert(protocol, handler);
    }

    fn remove_stream_handler(&self, protocol: &str) {
        self.shared.handlers.remove(protocol);
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> TransportResult<MemoryStream> {
        self.shared.open_calls.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .shared
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::ConnectionError("injected open failure".to_string()));
        }

        let target = self
            .network
            .lookup(peer)
            .filter(|t| t.reachable.load(Ordering::SeqCst))
            .ok_or_else(|| TransportError::PeerUnreachable(peer.clone()))?;

        let handler = target
            .handlers
            .get(protocol)
            .ok_or_else(|| TransportError::ProtocolNotSupported(protocol.to_string()))?;

        let (near_io, far_io) = tokio::io::duplex(PIPE_CAPACITY);
        let near_state = Arc::new(HalfState::default());
        let far_state = Arc::new(HalfState::default());

        let near = MemoryStream {
            io: Some(near_io),
            remote_peer: target.peer.clone(),
            protocol: protocol.to_string(),
            scope: self.shared.scope(),
            local: near_state.clone(),
            remote: far_state.clone(),
        };
        let far = MemoryStream {
            io: Some(far_io),
            remote_peer: self.shared.peer.clone(),
            protocol: protocol.to_string(),
            scope: target.scope(),
            local: far_state.clone(),
            remote: near_state.clone(),
        };

        lock(&self.shared.outbound).push(StreamRecord {
            protocol: protocol.to_string(),
            remote_peer: target.peer.clone(),
            scope: near.scope.clone(),
            local: near_state.clone(),
            remote: far_state.clone(),
        });
        lock(&target.inbound).push(StreamRecord {
            protocol: protocol.to_string(),
            remote_peer: self.shared.peer.clone(),
            scope: far.scope.clone(),
            local: far_state,
            remote: near_state,
        });

        debug!(
            "Memory stream {} -> {} ({})",
            self.shared.peer.short(),
            target.peer.short(),
            protocol
        );
        tokio::spawn(handler(far));

        Ok(near)
    }

    async fn connect(&self, addr: &PeerAddr) -> TransportResult<()> {
        lock(&self.shared.connects).push(addr.clone());

        match self.network.lookup(&addr.peer) {
            Some(target) if target.reachable.load(Ordering::SeqCst) => Ok(()),
            _ => Err(TransportError::PeerUnreachable(addr.peer.clone())),
        }
    }
}
