//! QUIC stream host
//!
//! One UDP endpoint both listens and dials. Every connection, accepted or
//! dialed, is served by the same loop that accepts bidirectional streams and
//! routes them to the handler registered for the protocol named in the stream
//! header. Outbound streams reuse any live connection to the peer, whichever
//! side established it.

use crate::config::QuicHostConfig;
use crate::identity::{Identity, SERVER_NAME};
use crate::stream::{encode_header, QuicVpnStream, RESET_CODE};
use crate::tls;
use async_trait::async_trait;
use p2pvpn_transport::{
    HandlerRegistry, PeerAddr, PeerId, ResourceManager, StreamHandler, StreamHost, StreamScope,
    TransportError, TransportResult,
};
use quinn::{Connection, Endpoint, RecvStream, SendStream, VarInt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a new stream may take to name its protocol
const HEADER_TIMEOUT: Duration = Duration::from_secs(10);

struct HostInner {
    identity: Identity,
    endpoint: Endpoint,
    transport: Arc<quinn::TransportConfig>,
    handlers: HandlerRegistry<QuicVpnStream>,
    connections: Mutex<HashMap<PeerId, Connection>>,
    addresses: Mutex<HashMap<PeerId, String>>,
    resources: Arc<ResourceManager>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HostInner {
    fn remember(&self, peer: PeerId, connection: Connection) {
        lock(&self.connections).insert(peer, connection);
    }

    /// Drop the connection for `peer` if it is still the one identified by `stable_id`
    fn forget(&self, peer: &PeerId, stable_id: usize) {
        let mut connections = lock(&self.connections);
        if connections
            .get(peer)
            .is_some_and(|c| c.stable_id() == stable_id)
        {
            connections.remove(peer);
        }
    }

    fn live_connection(&self, peer: &PeerId) -> Option<Connection> {
        let mut connections = lock(&self.connections);
        match connections.get(peer) {
            Some(connection) if connection.close_reason().is_none() => Some(connection.clone()),
            Some(_) => {
                connections.remove(peer);
                None
            }
            None => None,
        }
    }

    fn address_of(&self, peer: &PeerId) -> Option<String> {
        lock(&self.addresses).get(peer).cloned()
    }
}

impl Drop for HostInner {
    fn drop(&mut self) {
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
    }
}

/// A [`StreamHost`] carrying tunnel streams over QUIC
#[derive(Clone)]
pub struct QuicHost {
    inner: Arc<HostInner>,
}

impl QuicHost {
    /// Bind the UDP endpoint and start accepting connections
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(identity: Identity, config: QuicHostConfig) -> TransportResult<Self> {
        tls::ensure_crypto_provider();
        config.validate()?;

        let transport = config.transport_config()?;
        let server_config = tls::server_config(&identity, transport.clone())?;
        let endpoint = Endpoint::server(server_config, config.listen_addr).map_err(|e| {
            TransportError::ConnectionError(format!(
                "Failed to bind {}: {}",
                config.listen_addr, e
            ))
        })?;

        info!(
            "QUIC host {} listening on {}",
            identity.peer_id(),
            endpoint.local_addr()?
        );

        let inner = Arc::new(HostInner {
            identity,
            endpoint: endpoint.clone(),
            transport,
            handlers: HandlerRegistry::new(),
            connections: Mutex::new(HashMap::new()),
            addresses: Mutex::new(HashMap::new()),
            resources: ResourceManager::new(config.stream_memory_limit),
        });

        tokio::spawn(accept_loop(endpoint, Arc::downgrade(&inner)));

        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.inner.endpoint.local_addr()?)
    }

    /// Address other peers can use to reach this host
    pub fn peer_addr(&self) -> TransportResult<PeerAddr> {
        Ok(PeerAddr::new(
            self.inner.identity.peer_id().clone(),
            self.local_addr()?.to_string(),
        ))
    }

    /// Memory budget shared by this host's streams
    pub fn resources(&self) -> &ResourceManager {
        &self.inner.resources
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.live_connection(peer).is_some()
    }

    /// Close every connection and wait until the endpoint is idle
    pub async fn close(&self) {
        info!("Closing QUIC host");
        self.inner.endpoint.close(VarInt::from_u32(0), b"shutdown");
        self.inner.endpoint.wait_idle().await;
    }

    async fn connection_to(&self, peer: &PeerId) -> TransportResult<Connection> {
        if let Some(connection) = self.inner.live_connection(peer) {
            return Ok(connection);
        }

        let address = self
            .inner
            .address_of(peer)
            .ok_or_else(|| TransportError::PeerUnreachable(peer.clone()))?;
        self.dial(peer, &address).await
    }

    async fn dial(&self, peer: &PeerId, address: &str) -> TransportResult<Connection> {
        let remote_addr = tokio::net::lookup_host(address)
            .await
            .map_err(|e| {
                TransportError::ConnectionError(format!("Failed to resolve {}: {}", address, e))
            })?
            .next()
            .ok_or_else(|| {
                TransportError::ConnectionError(format!("No address found for {}", address))
            })?;

        debug!("Dialing peer {} at {}", peer.short(), remote_addr);

        let client_config =
            tls::client_config(&self.inner.identity, peer, self.inner.transport.clone())?;
        let connection = self
            .inner
            .endpoint
            .connect_with(client_config, remote_addr, SERVER_NAME)
            .map_err(|e| TransportError::ConnectionError(format!("Failed to connect: {}", e)))?
            .await
            .map_err(|e| {
                TransportError::ConnectionError(format!(
                    "Handshake with {} failed: {}",
                    remote_addr, e
                ))
            })?;

        let actual = tls::remote_peer_id(&connection)?;
        if &actual != peer {
            connection.close(RESET_CODE, b"identity mismatch");
            return Err(TransportError::IdentityMismatch {
                expected: peer.clone(),
                actual,
            });
        }

        info!("Connected to peer {} at {}", peer.short(), remote_addr);
        self.inner.remember(peer.clone(), connection.clone());
        tokio::spawn(serve_connection(
            Arc::downgrade(&self.inner),
            connection.clone(),
        ));

        Ok(connection)
    }
}

impl std::fmt::Debug for QuicHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicHost")
            .field("peer_id", self.inner.identity.peer_id())
            .field("handlers", &self.inner.handlers)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StreamHost for QuicHost {
    type Stream = QuicVpnStream;

    fn local_peer(&self) -> &PeerId {
        self.inner.identity.peer_id()
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler<QuicVpnStream>) {
        debug!("Registered handler for {}", protocol);
        self.inner.handlers.insert(protocol, handler);
    }

    fn remove_stream_handler(&self, protocol: &str) {
        self.inner.handlers.remove(protocol);
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> TransportResult<QuicVpnStream> {
        let header = encode_header(protocol)
            .ok_or_else(|| TransportError::ProtocolNotSupported(protocol.to_string()))?;

        let connection = self.connection_to(peer).await?;
        let (mut send, recv) = connection.open_bi().await.map_err(|e| {
            self.inner.forget(peer, connection.stable_id());
            TransportError::ConnectionError(format!("Failed to open stream: {}", e))
        })?;

        send.write_all(&header)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("Failed to send header: {}", e)))?;

        Ok(QuicVpnStream::new(
            send,
            recv,
            peer.clone(),
            protocol.to_string(),
            StreamScope::new(self.inner.resources.clone()),
        ))
    }

    async fn connect(&self, addr: &PeerAddr) -> TransportResult<()> {
        if &addr.peer == self.local_peer() {
            return Err(TransportError::ConfigurationError(
                "Refusing to connect to self".to_string(),
            ));
        }

        lock(&self.inner.addresses).insert(addr.peer.clone(), addr.address.clone());

        if self.inner.live_connection(&addr.peer).is_some() {
            return Ok(());
        }
        self.dial(&addr.peer, &addr.address).await.map(|_| ())
    }
}

async fn accept_loop(endpoint: Endpoint, host: Weak<HostInner>) {
    while let Some(incoming) = endpoint.accept().await {
        if host.strong_count() == 0 {
            break;
        }

        let host = host.clone();
        tokio::spawn(async move {
            let remote_addr = incoming.remote_address();
            match incoming.await {
                Ok(connection) => serve_connection(host, connection).await,
                Err(e) => debug!("Incoming connection from {} failed: {}", remote_addr, e),
            }
        });
    }
    debug!("Accept loop stopped");
}

async fn serve_connection(host: Weak<HostInner>, connection: Connection) {
    let remote = match tls::remote_peer_id(&connection) {
        Ok(remote) => remote,
        Err(e) => {
            warn!(
                "Rejecting connection from {}: {}",
                connection.remote_address(),
                e
            );
            connection.close(RESET_CODE, b"no identity");
            return;
        }
    };

    match host.upgrade() {
        Some(inner) => inner.remember(remote.clone(), connection.clone()),
        None => return,
    }

    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                debug!("Connection with peer {} ended: {}", remote.short(), e);
                break;
            }
        };
        tokio::spawn(dispatch(host.clone(), send, recv, remote.clone()));
    }

    if let Some(inner) = host.upgrade() {
        inner.forget(&remote, connection.stable_id());
    }
}

/// Read the stream header and hand the stream to its protocol handler
async fn dispatch(host: Weak<HostInner>, mut send: SendStream, mut recv: RecvStream, remote: PeerId) {
    let protocol = match tokio::time::timeout(HEADER_TIMEOUT, read_header(&mut recv)).await {
        Ok(Ok(protocol)) => protocol,
        Ok(Err(e)) => {
            debug!("Bad stream header from peer {}: {}", remote.short(), e);
            abort(&mut send, &mut recv);
            return;
        }
        Err(_) => {
            debug!("Peer {} never named a stream protocol", remote.short());
            abort(&mut send, &mut recv);
            return;
        }
    };

    let Some(inner) = host.upgrade() else {
        abort(&mut send, &mut recv);
        return;
    };
    let handler = inner.handlers.get(&protocol);
    let resources = inner.resources.clone();
    drop(inner);

    let Some(handler) = handler else {
        debug!(
            "No handler for protocol {} from peer {}, resetting stream",
            protocol,
            remote.short()
        );
        abort(&mut send, &mut recv);
        return;
    };

    let stream = QuicVpnStream::new(send, recv, remote, protocol, StreamScope::new(resources));
    handler(stream).await;
}

async fn read_header(recv: &mut RecvStream) -> TransportResult<String> {
    let mut len = [0u8; 1];
    recv.read_exact(&mut len)
        .await
        .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
    if len[0] == 0 {
        return Err(TransportError::ProtocolNotSupported(
            "empty protocol id".to_string(),
        ));
    }

    let mut protocol = vec![0u8; usize::from(len[0])];
    recv.read_exact(&mut protocol)
        .await
        .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

    String::from_utf8(protocol)
        .map_err(|_| TransportError::ProtocolNotSupported("non UTF-8 protocol id".to_string()))
}

fn abort(send: &mut SendStream, recv: &mut RecvStream) {
    let _ = send.reset(RESET_CODE);
    let _ = recv.stop(RESET_CODE);
}
