//! Channel-typed datagram transport abstraction.
//!
//! The [`Transport`] trait turns an unreliable datagram backend into the
//! three delivery disciplines the protocol needs, plus peer lifecycle and
//! unconnected-message events for LAN discovery. The underlying datagram
//! library is an external collaborator — this crate ships only the
//! in-process [`MemoryTransport`](crate::transports::MemoryTransport) (and
//! the relay presents itself through the same seam).
//!
//! Events are *returned* from [`poll`](Transport::poll) rather than delivered
//! through callbacks: the runtime drains them on its poll loop, which is the
//! single thread all handlers run on.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

// ── Channels ────────────────────────────────────────────────────────

/// Delivery discipline for an outgoing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Every payload arrives, in send order. Lobby state and handshake.
    ReliableOrdered,
    /// Latest-wins: stale payloads may be dropped, never reordered. Gameplay
    /// state frames.
    ReliableSequenced,
    /// Fire-and-forget. Telemetry.
    Unreliable,
}

// ── Connections ─────────────────────────────────────────────────────

/// Stable identity of a peer connection, unique per peer-lifetime.
pub type ConnectionId = u64;

/// An opaque peer handle owned by the transport and referenced by sessions.
///
/// `send` on a closed connection is a no-op (`Ok`); peers vanishing is
/// reported through [`TransportEvent::PeerDisconnected`], not through send
/// errors.
pub trait Connection: Send + Sync + fmt::Debug {
    /// Stable identity for this peer-lifetime.
    fn id(&self) -> ConnectionId;

    /// Printable remote endpoint.
    fn remote_addr(&self) -> SocketAddr;

    /// Queue a payload on the given channel.
    fn send(&self, payload: &[u8], channel: Channel) -> Result<(), TransportError>;

    /// Disconnect the peer, optionally with UTF-8 reason bytes delivered in
    /// its disconnect event.
    fn disconnect(&self, reason: Option<&[u8]>);

    /// Whether the connection is still open.
    fn is_open(&self) -> bool;
}

// ── Options & events ────────────────────────────────────────────────

/// Options for [`Transport::start`].
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Port to bind (server) or connect to (client).
    pub port: u16,
    /// Address to bind (server) or connect to (client).
    pub address: String,
    /// Server mode listens; client mode initiates one outbound connection.
    pub is_server: bool,
    /// Ask the backend to cooperate with NAT punch-through introduce
    /// requests.
    pub enable_nat_punch_through: bool,
}

impl TransportOptions {
    /// Server-mode options listening on `address:port`.
    pub fn server(address: impl Into<String>, port: u16) -> Self {
        Self {
            port,
            address: address.into(),
            is_server: true,
            enable_nat_punch_through: false,
        }
    }

    /// Client-mode options connecting out to `address:port`.
    pub fn client(address: impl Into<String>, port: u16) -> Self {
        Self {
            port,
            address: address.into(),
            is_server: false,
            enable_nat_punch_through: false,
        }
    }

    /// Enable NAT punch-through cooperation.
    #[must_use]
    pub fn with_nat_punch_through(mut self) -> Self {
        self.enable_nat_punch_through = true;
        self
    }
}

/// Where a punched endpoint lives relative to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatAddressType {
    /// Same NAT; connect to the peer's internal endpoint.
    Internal,
    /// Different NAT; connect to the peer's external endpoint.
    External,
}

/// Events drained from [`Transport::poll`], in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer finished connecting (server: inbound accept; client: the
    /// initiated outbound connection).
    PeerConnected(Arc<dyn Connection>),
    /// A peer went away; `reason` carries its disconnect bytes when present.
    PeerDisconnected {
        connection: Arc<dyn Connection>,
        reason: Option<Vec<u8>>,
    },
    /// A payload arrived from a connected peer.
    PayloadReceived {
        connection: Arc<dyn Connection>,
        payload: Vec<u8>,
        channel: Channel,
    },
    /// A datagram arrived outside any connection (LAN discovery traffic).
    UnconnectedMessage {
        remote: SocketAddr,
        payload: Vec<u8>,
    },
    /// Round-trip estimate update for a peer.
    LatencyUpdate {
        connection: Arc<dyn Connection>,
        millis: u32,
    },
    /// A NAT punch coordinated via [`Transport::nat_introduce`] succeeded;
    /// connect normally to `target`.
    NatPunchSuccess {
        target: SocketAddr,
        address_type: NatAddressType,
        token: String,
    },
}

// ── Transport ───────────────────────────────────────────────────────

/// A channel-typed datagram transport.
///
/// Socket errors on an individual peer surface as `PeerDisconnected` events
/// and never tear down the transport itself. Unknown or corrupt unconnected
/// datagrams are dropped by implementations without an event.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Bind the socket and (in client mode) initiate the outbound connection.
    ///
    /// # Errors
    ///
    /// [`TransportError::AlreadyRunning`] when already started,
    /// [`TransportError::Bind`] when the socket cannot be bound.
    fn start(&mut self, options: TransportOptions) -> Result<(), TransportError>;

    /// Drain all pending network events, waiting at most `timeout` for the
    /// first one. A zero timeout drains what is already queued and returns.
    async fn poll(&mut self, timeout: Duration) -> Vec<TransportEvent>;

    /// Gracefully disconnect all peers (optionally with UTF-8 reason bytes)
    /// and release the socket. Idempotent.
    fn shutdown(&mut self, reason: Option<&[u8]>);

    /// Whether the transport is currently bound.
    fn is_running(&self) -> bool;

    /// Send a datagram outside any connection (LAN discovery).
    fn send_unconnected(&self, target: SocketAddr, payload: &[u8]) -> Result<(), TransportError>;

    /// Ask the backend to send a NAT-introduce request to the punch server.
    /// Success is reported via [`TransportEvent::NatPunchSuccess`].
    fn nat_introduce(&self, punch_server: SocketAddr, token: &str) -> Result<(), TransportError>;
}
