#![cfg_attr(docsrs, feature(doc_auto_cfg))]
//! # yargnet
//!
//! Authoritative, lobby-oriented multiplayer networking core for real-time
//! rhythm-game sessions.
//!
//! The crate turns an unreliable datagram transport into a typed packet
//! protocol with an authoritative lobby:
//!
//! - **Transport abstraction** — reliable-ordered / reliable-sequenced /
//!   unreliable channels behind the [`Transport`] trait; bring your own
//!   datagram backend, or use the built-in in-process
//!   [`MemoryTransport`](transports::MemoryTransport) and the
//!   [`RelayTransport`](relay::RelayTransport) fallback.
//! - **Typed envelopes + dispatcher** — every packet is a
//!   `(type, version, payload)` JSON envelope routed by [`PacketDispatcher`].
//! - **Handshake & sessions** — protocol-version, name and password gating;
//!   accepted peers get a session and a lobby seat.
//! - **Authoritative lobby** — membership, host promotion, readiness, song
//!   selection; every change broadcast exactly once as an immutable
//!   snapshot.
//! - **Rendezvous plane** — LAN discovery beacons, HTTP directory
//!   advertisement/polling, lobby codes, NAT punch signaling and relay
//!   fallback.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tokio_util::sync::CancellationToken;
//! use yargnet::transports::MemoryNetwork;
//! use yargnet::{ClientConfig, ClientEvent, ClientRuntime, ServerConfig, ServerRuntime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = MemoryNetwork::new();
//!
//!     // 1. Host a lobby.
//!     let mut server = ServerRuntime::new(network.transport());
//!     server.configure(ServerConfig::default().with_lobby_name("Friday Night"))?;
//!     server.start().await?;
//!
//!     // 2. Join it.
//!     let mut client = ClientRuntime::new(network.transport(), ClientConfig::new("Alice"));
//!     let mut events = client
//!         .connect("127.0.0.1", 7777, CancellationToken::new())
//!         .await?;
//!
//!     // 3. React to lobby state.
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             ClientEvent::HandshakeAccepted { session_id } => {
//!                 println!("in the lobby as {session_id}");
//!                 client.set_ready(true)?;
//!             }
//!             ClientEvent::GameplayStarted { song_id } => {
//!                 println!("playing {song_id}");
//!             }
//!             ClientEvent::Disconnected { .. } => break,
//!             _ => {}
//!         }
//!     }
//!
//!     client.disconnect(None).await;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod coordinator;
pub mod directory;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod handshake;
pub mod lobby;
pub mod lobby_client;
pub mod protocol;
pub mod punch;
pub mod relay;
pub mod serializer;
pub mod server;
pub mod session;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use client::{ClientConfig, ClientRuntime};
pub use dispatcher::{DispatchOutcome, EndpointRole, HandlerContext, PacketDispatcher};
pub use error::{
    ClientError, DirectoryError, HandshakeError, LobbyError, PunchError, RelayError, SessionError,
    TransportError,
};
pub use event::ClientEvent;
pub use protocol::{
    LobbyStateSnapshot, LobbyStatus, PacketEnvelope, PacketType, PlayerRole, SessionId,
    PROTOCOL_VERSION,
};
pub use server::{ServerConfig, ServerRuntime};
pub use transport::{Channel, Connection, Transport, TransportEvent, TransportOptions};
