//! Authoritative lobby state.
//!
//! [`LobbyManager`] owns membership, roles, readiness and the current song
//! selection, and derives the lobby status from them. Everything mutating
//! goes through the `try_*` operations, which keep the structural invariants:
//! exactly one host while the lobby has a non-spectator, no assignment
//! referring to a non-member or duplicating `(player, instrument)`, and
//! readiness zeroed whenever a new song id is applied.
//!
//! The manager is silent about *when* snapshots go out — the coordinator
//! subscribes to the changed signal and owns broadcasting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

use crate::error::LobbyError;
use crate::protocol::{
    InstrumentAssignment, LobbyId, LobbyPlayer, LobbyStateSnapshot, LobbyStatus, PlayerRole,
    SessionId, SongSelectionState,
};

/// Gameplay phase imposed on the lobby by the coordinator.
///
/// `Lobby` means the status is derived from selection/readiness; the other
/// two override it while a countdown or a song is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamePhase {
    Lobby,
    Countdown,
    InGame,
}

struct LobbyInner {
    players: HashMap<SessionId, LobbyPlayer>,
    /// Join order; drives host promotion and snapshot ordering.
    join_order: Vec<SessionId>,
    selection: Option<SongSelectionState>,
    phase: GamePhase,
}

type ChangedListener = Arc<dyn Fn() + Send + Sync>;

/// Server-side lobby membership, roles, readiness and song selection.
pub struct LobbyManager {
    inner: Mutex<LobbyInner>,
    listeners: Mutex<Vec<ChangedListener>>,
    lobby_id: LobbyId,
    max_players: usize,
}

impl LobbyManager {
    /// Create an empty lobby capped at `max_players` (clamped to ≥ 1), with a
    /// freshly minted lobby id stable for this lobby's lifetime.
    pub fn new(max_players: usize) -> Self {
        Self {
            inner: Mutex::new(LobbyInner {
                players: HashMap::new(),
                join_order: Vec::new(),
                selection: None,
                phase: GamePhase::Lobby,
            }),
            listeners: Mutex::new(Vec::new()),
            lobby_id: Uuid::new_v4(),
            max_players: max_players.max(1),
        }
    }

    pub fn lobby_id(&self) -> LobbyId {
        self.lobby_id
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }

    /// Register a callback fired after every state-mutating operation.
    /// Fan-out happens with no lobby lock held.
    pub fn register_changed_listener(&self, listener: ChangedListener) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
    }

    fn notify_changed(&self) {
        let listeners = match self.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for listener in listeners {
            listener();
        }
    }

    // ── Membership ──────────────────────────────────────────────────

    /// Add a player. The first player becomes Host regardless of the
    /// requested role; later joiners keep their requested role except that a
    /// second Host is coerced to Member.
    pub fn try_add_player(
        &self,
        session_id: SessionId,
        display_name: impl Into<String>,
        requested_role: PlayerRole,
    ) -> Result<LobbyPlayer, LobbyError> {
        let player = {
            let mut inner = lock(&self.inner);
            if inner.players.contains_key(&session_id) {
                return Err(LobbyError::AlreadyMember);
            }
            if inner.players.len() >= self.max_players {
                return Err(LobbyError::LobbyFull);
            }

            let role = if inner.players.is_empty() {
                PlayerRole::Host
            } else if requested_role == PlayerRole::Host {
                PlayerRole::Member
            } else {
                requested_role
            };

            let player = LobbyPlayer {
                player_id: session_id,
                display_name: display_name.into(),
                role,
                is_ready: false,
            };
            inner.players.insert(session_id, player.clone());
            inner.join_order.push(session_id);
            inner.refresh_all_ready();
            player
        };
        debug!(player_id = %player.player_id, role = ?player.role, "lobby player added");
        self.notify_changed();
        Ok(player)
    }

    /// Remove a player. Removing the Host promotes the earliest-joined
    /// remaining Member; with no Members left the selection is cleared.
    pub fn try_remove_player(&self, session_id: SessionId) -> Result<LobbyPlayer, LobbyError> {
        let removed = {
            let mut inner = lock(&self.inner);
            let removed = inner
                .players
                .remove(&session_id)
                .ok_or(LobbyError::PlayerUnknown)?;
            inner.join_order.retain(|id| *id != session_id);

            if removed.role == PlayerRole::Host {
                let next_host = inner
                    .join_order
                    .iter()
                    .copied()
                    .find(|id| {
                        inner
                            .players
                            .get(id)
                            .is_some_and(|p| p.role == PlayerRole::Member)
                    });
                if let Some(id) = next_host {
                    if let Some(player) = inner.players.get_mut(&id) {
                        player.role = PlayerRole::Host;
                    }
                }
            }

            let has_members = inner
                .players
                .values()
                .any(|p| p.role != PlayerRole::Spectator);
            if !has_members {
                inner.selection = None;
            }
            inner.prune_assignments();
            inner.refresh_all_ready();
            removed
        };
        debug!(player_id = %removed.player_id, "lobby player removed");
        self.notify_changed();
        Ok(removed)
    }

    // ── Readiness ───────────────────────────────────────────────────

    /// Toggle a member's readiness. No-op (and no changed signal) when the
    /// player is already in the requested state.
    pub fn try_set_ready(
        &self,
        session_id: SessionId,
        ready: bool,
    ) -> Result<LobbyPlayer, LobbyError> {
        let (player, changed) = {
            let mut inner = lock(&self.inner);
            let player = inner
                .players
                .get_mut(&session_id)
                .ok_or(LobbyError::PlayerUnknown)?;
            if player.role == PlayerRole::Spectator {
                return Err(LobbyError::SpectatorCannotReady);
            }
            if player.is_ready == ready {
                (player.clone(), false)
            } else {
                player.is_ready = ready;
                let player = player.clone();
                inner.refresh_all_ready();
                (player, true)
            }
        };
        if changed {
            self.notify_changed();
        }
        Ok(player)
    }

    // ── Song selection ──────────────────────────────────────────────

    /// Apply a song selection after normalizing it:
    /// trim the song id (reject empty), trim instrument/difficulty, drop
    /// assignments emptied by trimming, drop assignments for players that are
    /// not current non-spectator members, drop `(player, instrument)`
    /// duplicates keeping the first, preserve relative order. Applying a new
    /// song id clears readiness for every non-spectator.
    pub fn try_apply_song_selection(
        &self,
        state: SongSelectionState,
    ) -> Result<SongSelectionState, LobbyError> {
        let applied = {
            let mut inner = lock(&self.inner);

            let song_id = state.song_id.trim().to_string();
            if song_id.is_empty() {
                return Err(LobbyError::EmptySongId);
            }

            let mut seen = std::collections::HashSet::new();
            let mut assignments = Vec::new();
            for assignment in state.assignments {
                let instrument = assignment.instrument.trim().to_string();
                let difficulty = assignment.difficulty.trim().to_string();
                if instrument.is_empty() || difficulty.is_empty() {
                    continue;
                }
                let is_member = inner
                    .players
                    .get(&assignment.player_id)
                    .is_some_and(|p| p.role != PlayerRole::Spectator);
                if !is_member {
                    continue;
                }
                if !seen.insert((assignment.player_id, instrument.clone())) {
                    continue;
                }
                assignments.push(InstrumentAssignment {
                    player_id: assignment.player_id,
                    instrument,
                    difficulty,
                });
            }

            let is_new_song = inner
                .selection
                .as_ref()
                .map_or(true, |current| current.song_id != song_id);
            if is_new_song {
                for player in inner.players.values_mut() {
                    if player.role != PlayerRole::Spectator {
                        player.is_ready = false;
                    }
                }
            }

            let all_ready = inner.members_all_ready();
            let applied = SongSelectionState {
                song_id,
                assignments,
                all_ready,
            };
            inner.selection = Some(applied.clone());
            applied
        };
        debug!(song_id = %applied.song_id, assignments = applied.assignments.len(), "song selection applied");
        self.notify_changed();
        Ok(applied)
    }

    // ── Phase & snapshots ───────────────────────────────────────────

    /// Impose a gameplay phase. Returning to `Lobby` from `InGame` clears the
    /// selection and everyone's readiness (the song is over).
    pub fn set_phase(&self, phase: GamePhase) {
        {
            let mut inner = lock(&self.inner);
            if inner.phase == phase {
                return;
            }
            let leaving_game = inner.phase == GamePhase::InGame && phase == GamePhase::Lobby;
            inner.phase = phase;
            if leaving_game {
                inner.selection = None;
                for player in inner.players.values_mut() {
                    player.is_ready = false;
                }
            }
        }
        self.notify_changed();
    }

    pub fn phase(&self) -> GamePhase {
        lock(&self.inner).phase
    }

    /// Current status, derived from phase, selection and readiness.
    pub fn status(&self) -> LobbyStatus {
        lock(&self.inner).derive_status()
    }

    /// True when the lobby has at least one non-spectator and every
    /// non-spectator is ready.
    pub fn all_members_ready(&self) -> bool {
        lock(&self.inner).members_all_ready()
    }

    /// The current host, while the lobby has one.
    pub fn host(&self) -> Option<LobbyPlayer> {
        lock(&self.inner)
            .players
            .values()
            .find(|p| p.role == PlayerRole::Host)
            .cloned()
    }

    pub fn player(&self, session_id: SessionId) -> Option<LobbyPlayer> {
        lock(&self.inner).players.get(&session_id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the immutable snapshot broadcast to members. Players appear in
    /// join order; equality across snapshots is structural.
    pub fn build_snapshot(&self) -> LobbyStateSnapshot {
        let inner = lock(&self.inner);
        let players = inner
            .join_order
            .iter()
            .filter_map(|id| inner.players.get(id).cloned())
            .collect();
        LobbyStateSnapshot {
            lobby_id: self.lobby_id,
            players,
            status: inner.derive_status(),
            selection: inner.selection.clone(),
        }
    }
}

impl LobbyInner {
    fn members_all_ready(&self) -> bool {
        let mut any = false;
        for player in self.players.values() {
            if player.role == PlayerRole::Spectator {
                continue;
            }
            any = true;
            if !player.is_ready {
                return false;
            }
        }
        any
    }

    fn derive_status(&self) -> LobbyStatus {
        match self.phase {
            GamePhase::Countdown => LobbyStatus::Countdown,
            GamePhase::InGame => LobbyStatus::InGame,
            GamePhase::Lobby => match &self.selection {
                None => LobbyStatus::Idle,
                Some(_) if self.members_all_ready() => LobbyStatus::ReadyToPlay,
                Some(_) => LobbyStatus::SelectingSong,
            },
        }
    }

    /// Drop assignments that no longer refer to a non-spectator member.
    fn prune_assignments(&mut self) {
        let players = &self.players;
        if let Some(selection) = self.selection.as_mut() {
            selection.assignments.retain(|assignment| {
                players
                    .get(&assignment.player_id)
                    .is_some_and(|p| p.role != PlayerRole::Spectator)
            });
        }
    }

    fn refresh_all_ready(&mut self) {
        let all_ready = self.members_all_ready();
        if let Some(selection) = self.selection.as_mut() {
            selection.all_ready = all_ready;
        }
    }
}

fn lock(mutex: &Mutex<LobbyInner>) -> std::sync::MutexGuard<'_, LobbyInner> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
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

    fn id(n: u128) -> SessionId {
        Uuid::from_u128(n)
    }

    #[test]
    fn first_player_becomes_host_even_as_spectator() {
        let lobby = LobbyManager::new(8);
        let player = lobby
            .try_add_player(id(1), "a", PlayerRole::Spectator)
            .unwrap();
        assert_eq!(player.role, PlayerRole::Host);
    }

    #[test]
    fn second_host_request_is_coerced_to_member() {
        let lobby = LobbyManager::new(8);
        lobby.try_add_player(id(1), "a", PlayerRole::Host).unwrap();
        let second = lobby.try_add_player(id(2), "b", PlayerRole::Host).unwrap();
        assert_eq!(second.role, PlayerRole::Member);
    }

    #[test]
    fn changed_listener_fires_on_mutation() {
        let lobby = LobbyManager::new(8);
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        lobby.register_changed_listener(Arc::new(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));
        lobby.try_add_player(id(1), "a", PlayerRole::Member).unwrap();
        assert_eq!(fired.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn redundant_ready_toggle_is_silent() {
        let lobby = LobbyManager::new(8);
        lobby.try_add_player(id(1), "a", PlayerRole::Member).unwrap();
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        lobby.register_changed_listener(Arc::new(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));
        lobby.try_set_ready(id(1), false).unwrap();
        assert_eq!(fired.load(std::sync::atomic::Ordering::Relaxed), 0);
        lobby.try_set_ready(id(1), true).unwrap();
        assert_eq!(fired.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn game_end_returns_lobby_to_idle() {
        let lobby = LobbyManager::new(8);
        lobby.try_add_player(id(1), "a", PlayerRole::Member).unwrap();
        lobby
            .try_apply_song_selection(SongSelectionState {
                song_id: "song:x".into(),
                assignments: vec![],
                all_ready: false,
            })
            .unwrap();
        lobby.try_set_ready(id(1), true).unwrap();
        lobby.set_phase(GamePhase::InGame);
        assert_eq!(lobby.status(), LobbyStatus::InGame);

        lobby.set_phase(GamePhase::Lobby);
        let snapshot = lobby.build_snapshot();
        assert_eq!(snapshot.status, LobbyStatus::Idle);
        assert!(snapshot.selection.is_none());
        assert!(snapshot.players.iter().all(|p| !p.is_ready));
    }
}
