//! Turning lobby mutations into reliable broadcasts.
//!
//! [`LobbyCoordinator`] sits between the session/lobby managers and the
//! transport: after every state-mutating event it rebuilds the snapshot and,
//! only when it structurally differs from the last one sent, fans it out
//! reliable-ordered to every session. It also owns the ready-to-play
//! countdown and the gameplay phase transitions around it.
//!
//! [`ServerLobbyCommandHandler`] validates inbound lobby commands (owner-only
//! readiness, host-only selection/invite/gameplay control) and silently drops
//! anything invalid.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dispatcher::HandlerContext;
use crate::lobby::{GamePhase, LobbyManager};
use crate::protocol::{
    GameplayCountdown, GameplayStart, LobbyInvite, LobbyReadyState, LobbyStateSnapshot,
    LobbyStatus, PacketEnvelope, PacketType, SongSelection,
};
use crate::serializer;
use crate::session::SessionManager;
use crate::transport::{Channel, ConnectionId};

/// Seconds the countdown starts from.
const COUNTDOWN_START: u8 = 5;

/// Countdown progress, driven by [`LobbyCoordinator::tick`].
enum CountdownState {
    /// Not armed.
    Idle,
    /// Status is ReadyToPlay; waiting out the configured hold.
    Holding { since: Instant },
    /// Emitting one tick per second, `remaining` → 0.
    Counting { next_tick: Instant, remaining: u8 },
}

/// Wires session events to lobby mutations and lobby mutations to
/// broadcasts.
pub struct LobbyCoordinator {
    lobby: Arc<LobbyManager>,
    sessions: Arc<SessionManager>,
    last_broadcast: Mutex<Option<LobbyStateSnapshot>>,
    countdown: Mutex<CountdownState>,
    /// How long ReadyToPlay must hold before the countdown starts.
    hold: Duration,
}

impl LobbyCoordinator {
    pub fn new(lobby: Arc<LobbyManager>, sessions: Arc<SessionManager>, hold: Duration) -> Self {
        Self {
            lobby,
            sessions,
            last_broadcast: Mutex::new(None),
            countdown: Mutex::new(CountdownState::Idle),
            hold,
        }
    }

    /// An accepted handshake: add the player and broadcast.
    pub fn on_session_accepted(&self, session: &crate::session::SessionRecord) {
        use crate::protocol::PlayerRole;
        if let Err(error) = self.lobby.try_add_player(
            session.session_id,
            session.player_name.clone(),
            PlayerRole::Member,
        ) {
            warn!(session_id = %session.session_id, %error, "could not seat session in lobby");
        }
        self.broadcast_if_changed();
    }

    /// A peer went away: drop its session and lobby seat, broadcast.
    pub fn on_peer_disconnected(&self, connection_id: ConnectionId) {
        if let Some(record) = self.sessions.try_remove_session(connection_id) {
            debug!(session_id = %record.session_id, "session removed on disconnect");
            let _ = self.lobby.try_remove_player(record.session_id);
        }
        self.broadcast_if_changed();
    }

    /// Rebuild the snapshot and fan it out iff it differs from the last one
    /// broadcast. Also arms/disarms the countdown off the derived status.
    pub fn broadcast_if_changed(&self) {
        let snapshot = self.lobby.build_snapshot();
        {
            let Ok(mut last) = self.last_broadcast.lock() else {
                return;
            };
            if last.as_ref() == Some(&snapshot) {
                return;
            }
            *last = Some(snapshot.clone());
        }
        debug!(status = ?snapshot.status, players = snapshot.players.len(), "broadcasting lobby state");
        self.send_to_all(PacketType::LobbyState, &snapshot);
    }

    /// Advance timers: the ready-hold and the per-second countdown.
    /// Called every frame by the server poll loop.
    pub fn tick(&self, now: Instant) {
        let status = self.lobby.status();
        let Ok(mut countdown) = self.countdown.lock() else {
            return;
        };
        match &mut *countdown {
            CountdownState::Idle => {
                if status == LobbyStatus::ReadyToPlay {
                    *countdown = CountdownState::Holding { since: now };
                }
            }
            CountdownState::Holding { since } => {
                if status != LobbyStatus::ReadyToPlay {
                    *countdown = CountdownState::Idle;
                } else if now.duration_since(*since) >= self.hold {
                    info!("lobby ready, starting countdown");
                    *countdown = CountdownState::Counting {
                        next_tick: now,
                        remaining: COUNTDOWN_START,
                    };
                    self.lobby.set_phase(GamePhase::Countdown);
                }
            }
            CountdownState::Counting {
                next_tick,
                remaining,
            } => {
                if !self.lobby.all_members_ready() {
                    info!("countdown cancelled, a player un-readied");
                    *countdown = CountdownState::Idle;
                    self.lobby.set_phase(GamePhase::Lobby);
                    return;
                }
                while now >= *next_tick {
                    self.send_to_all(
                        PacketType::GameplayCountdown,
                        &GameplayCountdown {
                            seconds_remaining: *remaining,
                        },
                    );
                    if *remaining == 0 {
                        let song_id = self
                            .lobby
                            .build_snapshot()
                            .selection
                            .map(|s| s.song_id)
                            .unwrap_or_default();
                        info!(%song_id, "countdown complete, starting gameplay");
                        self.lobby.set_phase(GamePhase::InGame);
                        self.send_to_all(PacketType::GameplayStart, &GameplayStart { song_id });
                        *countdown = CountdownState::Idle;
                        break;
                    }
                    *remaining -= 1;
                    *next_tick += Duration::from_secs(1);
                }
            }
        }
    }

    /// Encode one envelope and send it reliable-ordered to every session.
    fn send_to_all<T: Serialize>(&self, packet_type: PacketType, payload: &T) {
        let envelope = PacketEnvelope::new(packet_type, payload);
        let bytes = match serializer::encode(&envelope) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, ?packet_type, "failed to encode broadcast");
                return;
            }
        };
        for session in self.sessions.sessions() {
            if let Err(error) = session.connection.send(&bytes, Channel::ReliableOrdered) {
                warn!(session_id = %session.session_id, %error, "broadcast send failed");
            }
        }
    }

    /// Re-encode an envelope and forward it to every session except the
    /// originating connection, preserving the arrival channel.
    pub fn relay_to_others<T: Serialize>(
        &self,
        from: ConnectionId,
        packet_type: PacketType,
        payload: &T,
        channel: Channel,
    ) {
        let envelope = PacketEnvelope::new(packet_type, payload);
        let bytes = match serializer::encode(&envelope) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, ?packet_type, "failed to encode relay");
                return;
            }
        };
        for session in self.sessions.sessions() {
            if session.connection_id == from {
                continue;
            }
            if let Err(error) = session.connection.send(&bytes, channel) {
                warn!(session_id = %session.session_id, %error, "relay send failed");
            }
        }
    }

    /// End-of-song: back to the lobby (selection and readiness cleared).
    pub fn on_game_ended(&self) {
        self.lobby.set_phase(GamePhase::Lobby);
        self.broadcast_if_changed();
    }
}

// ── Inbound command validation ──────────────────────────────────────

/// Server-side validator for lobby commands arriving off the wire.
///
/// Invalid commands (wrong owner, non-host selection, unknown player) are
/// dropped without a reply.
pub struct ServerLobbyCommandHandler {
    lobby: Arc<LobbyManager>,
    sessions: Arc<SessionManager>,
}

impl ServerLobbyCommandHandler {
    pub fn new(lobby: Arc<LobbyManager>, sessions: Arc<SessionManager>) -> Self {
        Self { lobby, sessions }
    }

    /// Ready toggles are only honored from the session-owning connection.
    pub fn handle_ready_state(&self, ctx: &HandlerContext, command: &LobbyReadyState) {
        let Some(session) = self.sessions.get_by_connection(ctx.connection.id()) else {
            debug!("dropping ready toggle from connection without session");
            return;
        };
        if session.session_id != command.session_id {
            debug!(
                claimed = %command.session_id,
                actual = %session.session_id,
                "dropping ready toggle with mismatched session id"
            );
            return;
        }
        if let Err(error) = self.lobby.try_set_ready(command.session_id, command.is_ready) {
            debug!(%error, "dropping invalid ready toggle");
        }
    }

    /// Song selections are only honored from the current host.
    pub fn handle_song_selection(&self, ctx: &HandlerContext, command: &SongSelection) {
        if !self.is_host_connection(ctx.connection.id(), command.session_id) {
            debug!("dropping song selection from non-host");
            return;
        }
        if let Err(error) = self.lobby.try_apply_song_selection(command.state.clone()) {
            debug!(%error, "dropping invalid song selection");
        }
    }

    /// Invites are host-only and forwarded to the targeted session.
    pub fn handle_invite(&self, ctx: &HandlerContext, invite: &LobbyInvite) {
        let Some(sender) = self.sessions.get_by_connection(ctx.connection.id()) else {
            return;
        };
        if !self.is_host_connection(ctx.connection.id(), sender.session_id) {
            debug!("dropping invite from non-host");
            return;
        }
        let Some(target) = self.sessions.get_by_session(invite.target_session_id) else {
            debug!(target = %invite.target_session_id, "dropping invite to unknown session");
            return;
        };
        let envelope = PacketEnvelope::new(PacketType::LobbyInvite, invite);
        match serializer::encode(&envelope) {
            Ok(bytes) => {
                if let Err(error) = target.connection.send(&bytes, Channel::ReliableOrdered) {
                    warn!(%error, "invite forward failed");
                }
            }
            Err(error) => warn!(%error, "failed to encode invite"),
        }
    }

    /// True when `connection_id` owns `session_id` and that player is the
    /// current host.
    pub fn is_host_connection(
        &self,
        connection_id: ConnectionId,
        session_id: crate::protocol::SessionId,
    ) -> bool {
        let owns = self
            .sessions
            .get_by_connection(connection_id)
            .is_some_and(|s| s.session_id == session_id);
        owns
            && self
                .lobby
                .host()
                .is_some_and(|host| host.player_id == session_id)
    }
}
