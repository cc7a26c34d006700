//! Client-side lobby plumbing.
//!
//! [`ClientLobbyStateHandler`] caches the last lobby snapshot and reports
//! only genuine changes. [`ClientLobbyCommandSender`] writes ready toggles
//! and song selections, resolving the session id from the shared
//! [`ClientSessionContext`] (or an explicit id).

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::dispatcher::{EndpointRole, HandlerContext};
use crate::error::ClientError;
use crate::protocol::{
    LobbyReadyState, LobbyStateSnapshot, PacketEnvelope, PacketType, SessionId, SongSelection,
    SongSelectionState,
};
use crate::serializer;
use crate::session::ClientSessionContext;
use crate::transport::{Channel, Connection};

// ── Inbound snapshots ───────────────────────────────────────────────

/// Caches lobby snapshots and suppresses duplicates.
#[derive(Default)]
pub struct ClientLobbyStateHandler {
    last: Mutex<Option<LobbyStateSnapshot>>,
}

impl ClientLobbyStateHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Digest an inbound snapshot. Returns it when it differs from the
    /// cached one; dispatches on a non-client role are ignored outright.
    pub fn handle(
        &self,
        ctx: &HandlerContext,
        snapshot: LobbyStateSnapshot,
    ) -> Option<LobbyStateSnapshot> {
        if ctx.role != EndpointRole::Client {
            debug!("ignoring lobby state dispatched on non-client role");
            return None;
        }
        let Ok(mut last) = self.last.lock() else {
            return None;
        };
        if last.as_ref() == Some(&snapshot) {
            return None;
        }
        *last = Some(snapshot.clone());
        Some(snapshot)
    }

    /// The most recently seen snapshot, if any.
    pub fn latest(&self) -> Option<LobbyStateSnapshot> {
        self.last.lock().ok().and_then(|last| last.clone())
    }

    /// Drop the cache (used on disconnect).
    pub fn reset(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = None;
        }
    }
}

// ── Outbound commands ───────────────────────────────────────────────

/// Writes lobby commands on behalf of the local player.
pub struct ClientLobbyCommandSender {
    context: Arc<ClientSessionContext>,
}

impl ClientLobbyCommandSender {
    pub fn new(context: Arc<ClientSessionContext>) -> Self {
        Self { context }
    }

    /// Send a ready toggle for the active session.
    ///
    /// # Errors
    ///
    /// [`ClientError::NoActiveSession`] when no handshake has been accepted.
    pub fn send_ready(
        &self,
        connection: &dyn Connection,
        is_ready: bool,
    ) -> Result<(), ClientError> {
        let session_id = self.context.session_id().ok_or(ClientError::NoActiveSession)?;
        self.send_ready_as(connection, session_id, is_ready)
    }

    /// Send a ready toggle for an explicit session id.
    pub fn send_ready_as(
        &self,
        connection: &dyn Connection,
        session_id: SessionId,
        is_ready: bool,
    ) -> Result<(), ClientError> {
        let envelope = PacketEnvelope::new(
            PacketType::LobbyReadyState,
            LobbyReadyState {
                session_id,
                is_ready,
            },
        );
        let bytes = serializer::encode(&envelope)?;
        connection.send(&bytes, Channel::ReliableOrdered)?;
        Ok(())
    }

    /// Send a song selection for the active session (host only, enforced
    /// server-side).
    pub fn send_song_selection(
        &self,
        connection: &dyn Connection,
        state: SongSelectionState,
    ) -> Result<(), ClientError> {
        let session_id = self.context.session_id().ok_or(ClientError::NoActiveSession)?;
        self.send_song_selection_as(connection, session_id, state)
    }

    /// Send a song selection for an explicit session id.
    pub fn send_song_selection_as(
        &self,
        connection: &dyn Connection,
        session_id: SessionId,
        state: SongSelectionState,
    ) -> Result<(), ClientError> {
        let envelope =
            PacketEnvelope::new(PacketType::SongSelection, SongSelection { session_id, state });
        let bytes = serializer::encode(&envelope)?;
        connection.send(&bytes, Channel::ReliableOrdered)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::protocol::{LobbyStatus, PlayerRole};
    use std::net::SocketAddr;

    #[derive(Debug)]
    struct SinkConnection(Mutex<Vec<Vec<u8>>>);

    impl Connection for SinkConnection {
        fn id(&self) -> u64 {
            1
        }
        fn remote_addr(&self) -> SocketAddr {
            "127.0.0.1:7777".parse().unwrap()
        }
        fn send(&self, payload: &[u8], _channel: Channel) -> Result<(), TransportError> {
            self.0.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
        fn disconnect(&self, _reason: Option<&[u8]>) {}
        fn is_open(&self) -> bool {
            true
        }
    }

    fn snapshot(status: LobbyStatus) -> LobbyStateSnapshot {
        LobbyStateSnapshot {
            lobby_id: uuid::Uuid::nil(),
            players: vec![crate::protocol::LobbyPlayer {
                player_id: uuid::Uuid::from_u128(1),
                display_name: "a".into(),
                role: PlayerRole::Host,
                is_ready: false,
            }],
            status,
            selection: None,
        }
    }

    fn client_ctx() -> HandlerContext {
        HandlerContext {
            connection: Arc::new(SinkConnection(Mutex::new(Vec::new()))),
            channel: Channel::ReliableOrdered,
            role: EndpointRole::Client,
        }
    }

    #[test]
    fn duplicate_snapshots_are_suppressed() {
        let handler = ClientLobbyStateHandler::new();
        let ctx = client_ctx();
        assert!(handler.handle(&ctx, snapshot(LobbyStatus::Idle)).is_some());
        assert!(handler.handle(&ctx, snapshot(LobbyStatus::Idle)).is_none());
        assert!(handler
            .handle(&ctx, snapshot(LobbyStatus::SelectingSong))
            .is_some());
    }

    #[test]
    fn server_role_dispatch_is_ignored() {
        let handler = ClientLobbyStateHandler::new();
        let mut ctx = client_ctx();
        ctx.role = EndpointRole::Server;
        assert!(handler.handle(&ctx, snapshot(LobbyStatus::Idle)).is_none());
        assert!(handler.latest().is_none());
    }

    #[test]
    fn commands_require_an_active_session() {
        let sender = ClientLobbyCommandSender::new(Arc::new(ClientSessionContext::new()));
        let conn = SinkConnection(Mutex::new(Vec::new()));
        let result = sender.send_ready(&conn, true);
        assert!(matches!(result, Err(ClientError::NoActiveSession)));
        assert!(conn.0.lock().unwrap().is_empty());
    }

    #[test]
    fn ready_command_carries_session_id() {
        let context = Arc::new(ClientSessionContext::new());
        let session_id = uuid::Uuid::new_v4();
        context.set(session_id);
        let sender = ClientLobbyCommandSender::new(context);
        let conn = SinkConnection(Mutex::new(Vec::new()));
        sender.send_ready(&conn, true).unwrap();

        let sent = conn.0.lock().unwrap();
        let envelope = serializer::decode::<LobbyReadyState>(&sent[0]).unwrap();
        assert_eq!(envelope.packet_type, PacketType::LobbyReadyState);
        assert_eq!(envelope.payload.session_id, session_id);
        assert!(envelope.payload.is_ready);
    }
}
