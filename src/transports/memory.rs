//! In-process loopback transport.
//!
//! A [`MemoryNetwork`] hub routes datagrams between [`MemoryTransport`]
//! endpoints bound to synthetic socket addresses. Delivery is lossless and
//! ordered regardless of channel, which is exactly what the integration
//! tests want: the channel value is carried through so handlers still see
//! the discipline a payload was sent on.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;
use crate::transport::{
    Channel, Connection, ConnectionId, NatAddressType, Transport, TransportEvent, TransportOptions,
};

// ── Hub ─────────────────────────────────────────────────────────────

/// What one endpoint delivers into another endpoint's inbox.
enum Inbound {
    ConnectRequest(Arc<LinkShared>),
    /// Client side surfacing its own outbound connection on the next poll.
    SelfConnected(Arc<MemoryConnection>),
    Payload {
        link_id: ConnectionId,
        payload: Vec<u8>,
        channel: Channel,
    },
    Disconnect {
        link_id: ConnectionId,
        reason: Option<Vec<u8>>,
    },
    Unconnected {
        from: SocketAddr,
        payload: Vec<u8>,
    },
    PunchSuccess {
        target: SocketAddr,
        address_type: NatAddressType,
        token: String,
    },
}

/// Shared state of one client↔server link.
struct LinkShared {
    id: ConnectionId,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    client_inbox: mpsc::UnboundedSender<Inbound>,
    server_inbox: mpsc::UnboundedSender<Inbound>,
    open: AtomicBool,
}

struct HubInner {
    binds: HashMap<SocketAddr, mpsc::UnboundedSender<Inbound>>,
    punch_targets: HashMap<String, (SocketAddr, NatAddressType)>,
}

/// An in-process network that [`MemoryTransport`]s attach to.
///
/// Clone-cheap handle; all endpoints of one test share a hub.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<HubInner>>,
    next_link_id: Arc<AtomicU64>,
    next_ephemeral: Arc<AtomicU64>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                binds: HashMap::new(),
                punch_targets: HashMap::new(),
            })),
            next_link_id: Arc::new(AtomicU64::new(1)),
            next_ephemeral: Arc::new(AtomicU64::new(49152)),
        }
    }

    /// Create an unbound transport attached to this hub.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            state: None,
        }
    }

    /// Register a punch token so that [`Transport::nat_introduce`] with that
    /// token reports success against `target`. Test hook standing in for the
    /// punch server's UDP side.
    pub fn register_punch_target(
        &self,
        token: impl Into<String>,
        target: SocketAddr,
        address_type: NatAddressType,
    ) {
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .punch_targets
                .insert(token.into(), (target, address_type));
        }
    }

    fn bind(
        &self,
        addr: SocketAddr,
        tx: mpsc::UnboundedSender<Inbound>,
    ) -> Result<(), TransportError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| TransportError::Bind("hub lock poisoned".into()))?;
        if inner.binds.contains_key(&addr) {
            return Err(TransportError::Bind(format!("address in use: {addr}")));
        }
        inner.binds.insert(addr, tx);
        Ok(())
    }

    fn unbind(&self, addr: SocketAddr) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.binds.remove(&addr);
        }
    }

    fn lookup(&self, addr: SocketAddr) -> Option<mpsc::UnboundedSender<Inbound>> {
        self.inner.lock().ok()?.binds.get(&addr).cloned()
    }

    fn deliver_unconnected(&self, from: SocketAddr, target: SocketAddr, payload: &[u8]) {
        let Ok(inner) = self.inner.lock() else {
            return;
        };
        if target.ip() == IpAddr::V4(Ipv4Addr::BROADCAST) {
            for (addr, tx) in &inner.binds {
                if *addr != from && addr.port() == target.port() {
                    let _ = tx.send(Inbound::Unconnected {
                        from,
                        payload: payload.to_vec(),
                    });
                }
            }
        } else if let Some(tx) = inner.binds.get(&target) {
            let _ = tx.send(Inbound::Unconnected {
                from,
                payload: payload.to_vec(),
            });
        }
    }

    fn punch_target(&self, token: &str) -> Option<(SocketAddr, NatAddressType)> {
        self.inner.lock().ok()?.punch_targets.get(token).copied()
    }

    fn alloc_link_id(&self) -> ConnectionId {
        self.next_link_id.fetch_add(1, Ordering::Relaxed)
    }

    fn alloc_ephemeral_port(&self) -> u16 {
        (self.next_ephemeral.fetch_add(1, Ordering::Relaxed) % u64::from(u16::MAX)) as u16
    }
}

// ── Connection ──────────────────────────────────────────────────────

/// Which end of a link a connection object represents.
#[derive(Clone, Copy)]
enum Side {
    Client,
    Server,
}

/// One endpoint's handle to a link, presented as the remote peer.
struct MemoryConnection {
    shared: Arc<LinkShared>,
    side: Side,
}

impl MemoryConnection {
    fn peer_inbox(&self) -> &mpsc::UnboundedSender<Inbound> {
        match self.side {
            Side::Client => &self.shared.server_inbox,
            Side::Server => &self.shared.client_inbox,
        }
    }

    fn own_inbox(&self) -> &mpsc::UnboundedSender<Inbound> {
        match self.side {
            Side::Client => &self.shared.client_inbox,
            Side::Server => &self.shared.server_inbox,
        }
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.shared.id)
            .field("remote", &self.remote_addr())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.shared.id
    }

    fn remote_addr(&self) -> SocketAddr {
        match self.side {
            Side::Client => self.shared.server_addr,
            Side::Server => self.shared.client_addr,
        }
    }

    fn send(&self, payload: &[u8], channel: Channel) -> Result<(), TransportError> {
        if !self.shared.open.load(Ordering::Acquire) {
            // Sending on a closed connection is a no-op.
            return Ok(());
        }
        let _ = self.peer_inbox().send(Inbound::Payload {
            link_id: self.shared.id,
            payload: payload.to_vec(),
            channel,
        });
        Ok(())
    }

    fn disconnect(&self, reason: Option<&[u8]>) {
        if !self.shared.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let reason = reason.map(<[u8]>::to_vec);
        let _ = self.peer_inbox().send(Inbound::Disconnect {
            link_id: self.shared.id,
            reason: reason.clone(),
        });
        let _ = self.own_inbox().send(Inbound::Disconnect {
            link_id: self.shared.id,
            reason,
        });
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }
}

// ── Transport ───────────────────────────────────────────────────────

struct BoundState {
    addr: SocketAddr,
    inbox_rx: mpsc::UnboundedReceiver<Inbound>,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    /// Connections by link id; touched only on the poll thread.
    connections: HashMap<ConnectionId, Arc<MemoryConnection>>,
}

/// A [`Transport`] endpoint attached to a [`MemoryNetwork`].
pub struct MemoryTransport {
    hub: MemoryNetwork,
    state: Option<BoundState>,
}

impl MemoryTransport {
    fn handle_inbound(state: &mut BoundState, inbound: Inbound) -> Option<TransportEvent> {
        match inbound {
            Inbound::ConnectRequest(shared) => {
                let conn = Arc::new(MemoryConnection {
                    shared,
                    side: Side::Server,
                });
                state.connections.insert(conn.id(), Arc::clone(&conn));
                Some(TransportEvent::PeerConnected(conn))
            }
            Inbound::SelfConnected(conn) => Some(TransportEvent::PeerConnected(conn)),
            Inbound::Payload {
                link_id,
                payload,
                channel,
            } => {
                let connection = state.connections.get(&link_id)?;
                Some(TransportEvent::PayloadReceived {
                    connection: Arc::clone(connection) as Arc<dyn Connection>,
                    payload,
                    channel,
                })
            }
            Inbound::Disconnect { link_id, reason } => {
                let connection = state.connections.remove(&link_id)?;
                connection.shared.open.store(false, Ordering::Release);
                Some(TransportEvent::PeerDisconnected {
                    connection: connection as Arc<dyn Connection>,
                    reason,
                })
            }
            Inbound::Unconnected { from, payload } => {
                Some(TransportEvent::UnconnectedMessage {
                    remote: from,
                    payload,
                })
            }
            Inbound::PunchSuccess {
                target,
                address_type,
                token,
            } => Some(TransportEvent::NatPunchSuccess {
                target,
                address_type,
                token,
            }),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn start(&mut self, options: TransportOptions) -> Result<(), TransportError> {
        if self.state.is_some() {
            return Err(TransportError::AlreadyRunning);
        }
        let ip: IpAddr = options
            .address
            .parse()
            .map_err(|_| TransportError::Bind(format!("unparseable address: {}", options.address)))?;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let mut state = BoundState {
            addr: SocketAddr::new(ip, options.port),
            inbox_rx,
            inbox_tx,
            connections: HashMap::new(),
        };

        if options.is_server {
            self.hub.bind(state.addr, state.inbox_tx.clone())?;
        } else {
            // Clients bind an ephemeral local address so unconnected replies
            // (discovery responses) can reach them.
            let local = SocketAddr::new(ip, self.hub.alloc_ephemeral_port());
            let server_addr = state.addr;
            state.addr = local;
            self.hub.bind(local, state.inbox_tx.clone())?;

            let Some(server_inbox) = self.hub.lookup(server_addr) else {
                self.hub.unbind(local);
                return Err(TransportError::Bind(format!(
                    "no listener at {server_addr}"
                )));
            };
            let shared = Arc::new(LinkShared {
                id: self.hub.alloc_link_id(),
                client_addr: local,
                server_addr,
                client_inbox: state.inbox_tx.clone(),
                server_inbox: server_inbox.clone(),
                open: AtomicBool::new(true),
            });
            let conn = Arc::new(MemoryConnection {
                shared: Arc::clone(&shared),
                side: Side::Client,
            });
            state.connections.insert(conn.id(), Arc::clone(&conn));
            let _ = server_inbox.send(Inbound::ConnectRequest(shared));
            // Surface our own PeerConnected on the next poll.
            let _ = state.inbox_tx.send(Inbound::SelfConnected(conn));
        }

        debug!(addr = %state.addr, is_server = options.is_server, "memory transport bound");
        self.state = Some(state);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        let Some(state) = self.state.as_mut() else {
            return events;
        };

        if timeout > Duration::ZERO {
            let first = tokio::time::timeout(timeout, state.inbox_rx.recv()).await;
            if let Ok(Some(inbound)) = first {
                if let Some(event) = Self::handle_inbound(state, inbound) {
                    events.push(event);
                }
            }
        }
        while let Ok(inbound) = state.inbox_rx.try_recv() {
            if let Some(event) = Self::handle_inbound(state, inbound) {
                events.push(event);
            }
        }
        events
    }

    fn shutdown(&mut self, reason: Option<&[u8]>) {
        let Some(state) = self.state.take() else {
            return;
        };
        for connection in state.connections.values() {
            connection.disconnect(reason);
        }
        self.hub.unbind(state.addr);
        debug!(addr = %state.addr, "memory transport shut down");
    }

    fn is_running(&self) -> bool {
        self.state.is_some()
    }

    fn send_unconnected(&self, target: SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
        let state = self.state.as_ref().ok_or(TransportError::NotRunning)?;
        self.hub.deliver_unconnected(state.addr, target, payload);
        Ok(())
    }

    fn nat_introduce(&self, _punch_server: SocketAddr, token: &str) -> Result<(), TransportError> {
        let state = self.state.as_ref().ok_or(TransportError::NotRunning)?;
        if let Some((target, address_type)) = self.hub.punch_target(token) {
            let _ = state.inbox_tx.send(Inbound::PunchSuccess {
                target,
                address_type,
                token: token.to_string(),
            });
        }
        Ok(())
    }
}
