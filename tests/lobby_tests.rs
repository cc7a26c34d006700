#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Lobby state machine tests: host promotion, selection normalization,
//! readiness transitions, broadcast suppression and the countdown.

mod common;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{connect_client, start_server, wait_for_session};
use yargnet::coordinator::LobbyCoordinator;
use yargnet::error::{LobbyError, TransportError};
use yargnet::event::ClientEvent;
use yargnet::lobby::LobbyManager;
use yargnet::protocol::{
    GameplayCountdown, InstrumentAssignment, LobbyStateSnapshot, PacketType, PlayerRole,
    SessionId, SongSelectionState,
};
use yargnet::serializer;
use yargnet::server::ServerConfig;
use yargnet::session::SessionManager;
use yargnet::transport::{Channel, Connection, ConnectionId};
use yargnet::transports::MemoryNetwork;
use yargnet::LobbyStatus;

// ── Recording connection ────────────────────────────────────────────

#[derive(Debug)]
struct RecordingConnection {
    id: ConnectionId,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl RecordingConnection {
    fn new(id: ConnectionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Statuses of every LobbyState broadcast this connection received.
    fn snapshot_statuses(&self) -> Vec<LobbyStatus> {
        self.decode_lobby_states()
            .into_iter()
            .map(|s| s.status)
            .collect()
    }

    fn decode_lobby_states(&self) -> Vec<LobbyStateSnapshot> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|bytes| serializer::peek_type(bytes) == Some(PacketType::LobbyState))
            .map(|bytes| {
                serializer::decode::<LobbyStateSnapshot>(bytes)
                    .unwrap()
                    .payload
            })
            .collect()
    }

    fn countdown_ticks(&self) -> Vec<u8> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|bytes| serializer::peek_type(bytes) == Some(PacketType::GameplayCountdown))
            .map(|bytes| {
                serializer::decode::<GameplayCountdown>(bytes)
                    .unwrap()
                    .payload
                    .seconds_remaining
            })
            .collect()
    }

    fn saw_packet(&self, packet_type: PacketType) -> bool {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .any(|bytes| serializer::peek_type(bytes) == Some(packet_type))
    }
}

impl Connection for RecordingConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }
    fn remote_addr(&self) -> SocketAddr {
        "127.0.0.1:7777".parse().unwrap()
    }
    fn send(&self, payload: &[u8], _channel: Channel) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
    fn disconnect(&self, _reason: Option<&[u8]>) {}
    fn is_open(&self) -> bool {
        true
    }
}

/// A lobby with two seated members (plus their recording connections).
struct Rig {
    lobby: Arc<LobbyManager>,
    coordinator: LobbyCoordinator,
    a: SessionId,
    b: SessionId,
    conn_a: Arc<RecordingConnection>,
    conn_b: Arc<RecordingConnection>,
}

fn two_member_rig() -> Rig {
    let sessions = Arc::new(SessionManager::new(8));
    let lobby = Arc::new(LobbyManager::new(8));
    let coordinator = LobbyCoordinator::new(Arc::clone(&lobby), Arc::clone(&sessions), Duration::ZERO);

    let conn_a = RecordingConnection::new(1);
    let conn_b = RecordingConnection::new(2);
    let a = sessions
        .try_create_session(Arc::clone(&conn_a) as Arc<dyn Connection>, "A")
        .unwrap();
    let b = sessions
        .try_create_session(Arc::clone(&conn_b) as Arc<dyn Connection>, "B")
        .unwrap();
    coordinator.on_session_accepted(&a);
    coordinator.on_session_accepted(&b);

    Rig {
        lobby,
        coordinator,
        a: a.session_id,
        b: b.session_id,
        conn_a,
        conn_b,
    }
}

fn selection(song_id: &str, assignments: Vec<(SessionId, &str, &str)>) -> SongSelectionState {
    SongSelectionState {
        song_id: song_id.to_string(),
        assignments: assignments
            .into_iter()
            .map(|(player_id, instrument, difficulty)| InstrumentAssignment {
                player_id,
                instrument: instrument.to_string(),
                difficulty: difficulty.to_string(),
            })
            .collect(),
        all_ready: false,
    }
}

// ── Host promotion (unit) ───────────────────────────────────────────

#[test]
fn removing_the_host_promotes_the_earliest_member() {
    let rig = two_member_rig();
    assert_eq!(rig.lobby.host().unwrap().player_id, rig.a);

    rig.lobby.try_remove_player(rig.a).unwrap();
    let host = rig.lobby.host().unwrap();
    assert_eq!(host.player_id, rig.b);
    assert_eq!(host.role, PlayerRole::Host);
}

#[test]
fn selection_clears_when_only_spectators_remain() {
    let lobby = LobbyManager::new(8);
    let host = SessionId::from_u128(1);
    let spectator = SessionId::from_u128(2);
    lobby.try_add_player(host, "h", PlayerRole::Member).unwrap();
    lobby
        .try_add_player(spectator, "s", PlayerRole::Spectator)
        .unwrap();
    lobby
        .try_apply_song_selection(selection("song:x", vec![]))
        .unwrap();

    lobby.try_remove_player(host).unwrap();
    let snapshot = lobby.build_snapshot();
    assert!(snapshot.selection.is_none());
    assert_eq!(snapshot.status, LobbyStatus::Idle);
}

// ── Selection normalization (scenario D) ────────────────────────────

#[test]
fn song_selection_is_normalized_and_readiness_cleared() {
    let lobby = LobbyManager::new(8);
    let a = SessionId::from_u128(1);
    let b = SessionId::from_u128(2);
    let spectator = SessionId::from_u128(3);
    let unknown = SessionId::from_u128(99);
    lobby.try_add_player(a, "A", PlayerRole::Member).unwrap();
    lobby.try_add_player(b, "B", PlayerRole::Member).unwrap();
    lobby
        .try_add_player(spectator, "S", PlayerRole::Spectator)
        .unwrap();
    lobby.try_set_ready(a, true).unwrap();
    lobby.try_set_ready(b, true).unwrap();

    let applied = lobby
        .try_apply_song_selection(selection(
            "  song:alpha  ",
            vec![
                (a, "Guitar", "Expert"),
                (a, "Guitar", "Medium"), // duplicate (player, instrument): dropped
                (unknown, "Bass", "Hard"),
                (b, "Bass", "Hard"),
                (spectator, "Vocals", "Easy"),
                (b, "Bass", "  "), // empty difficulty after trim: dropped
            ],
        ))
        .unwrap();

    assert_eq!(applied.song_id, "song:alpha");
    assert_eq!(applied.assignments.len(), 2);
    assert_eq!(applied.assignments[0].player_id, a);
    assert_eq!(applied.assignments[0].instrument, "Guitar");
    assert_eq!(applied.assignments[0].difficulty, "Expert");
    assert_eq!(applied.assignments[1].player_id, b);
    assert_eq!(applied.assignments[1].instrument, "Bass");

    // A new song id zeroes everyone's readiness.
    let snapshot = lobby.build_snapshot();
    assert!(snapshot.players.iter().all(|p| !p.is_ready));
    assert_eq!(snapshot.status, LobbyStatus::SelectingSong);
}

#[test]
fn reapplying_the_same_song_keeps_readiness() {
    let lobby = LobbyManager::new(8);
    let a = SessionId::from_u128(1);
    lobby.try_add_player(a, "A", PlayerRole::Member).unwrap();
    lobby
        .try_apply_song_selection(selection("song:x", vec![]))
        .unwrap();
    lobby.try_set_ready(a, true).unwrap();

    // Same song id, new assignments: readiness survives.
    lobby
        .try_apply_song_selection(selection("song:x", vec![(a, "Guitar", "Expert")]))
        .unwrap();
    assert!(lobby.player(a).unwrap().is_ready);

    // Different song id: readiness cleared.
    lobby
        .try_apply_song_selection(selection("song:y", vec![]))
        .unwrap();
    assert!(!lobby.player(a).unwrap().is_ready);
}

#[test]
fn empty_song_id_is_rejected() {
    let lobby = LobbyManager::new(8);
    let a = SessionId::from_u128(1);
    lobby.try_add_player(a, "A", PlayerRole::Member).unwrap();
    let result = lobby.try_apply_song_selection(selection("   ", vec![]));
    assert!(matches!(result, Err(LobbyError::EmptySongId)));
}

#[test]
fn spectators_cannot_set_readiness() {
    let lobby = LobbyManager::new(8);
    lobby
        .try_add_player(SessionId::from_u128(1), "h", PlayerRole::Member)
        .unwrap();
    let spectator = SessionId::from_u128(2);
    lobby
        .try_add_player(spectator, "s", PlayerRole::Spectator)
        .unwrap();
    assert!(matches!(
        lobby.try_set_ready(spectator, true),
        Err(LobbyError::SpectatorCannotReady)
    ));
}

// ── Broadcast suppression & status transitions (scenario E) ─────────

#[test]
fn ready_transitions_produce_three_distinct_broadcasts() {
    let rig = two_member_rig();
    rig.lobby
        .try_apply_song_selection(selection("song:x", vec![]))
        .unwrap();
    rig.coordinator.broadcast_if_changed();

    let baseline = rig.conn_b.snapshot_statuses().len();

    rig.lobby.try_set_ready(rig.a, true).unwrap();
    rig.coordinator.broadcast_if_changed();
    rig.lobby.try_set_ready(rig.b, true).unwrap();
    rig.coordinator.broadcast_if_changed();
    rig.lobby.try_set_ready(rig.a, false).unwrap();
    rig.coordinator.broadcast_if_changed();

    let statuses = rig.conn_b.snapshot_statuses();
    assert_eq!(
        &statuses[baseline..],
        &[
            LobbyStatus::SelectingSong, // A ready, B not
            LobbyStatus::ReadyToPlay,   // both ready
            LobbyStatus::SelectingSong, // A un-readied
        ]
    );

    // Consecutive broadcasts are pairwise distinct.
    let snapshots = rig.conn_b.decode_lobby_states();
    for pair in snapshots.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }
}

#[test]
fn identical_snapshots_are_not_rebroadcast() {
    let rig = two_member_rig();
    rig.coordinator.broadcast_if_changed();
    let count = rig.conn_a.decode_lobby_states().len();

    // Nothing changed: nothing goes out.
    rig.coordinator.broadcast_if_changed();
    rig.coordinator.broadcast_if_changed();
    assert_eq!(rig.conn_a.decode_lobby_states().len(), count);

    // A no-op ready toggle changes nothing either.
    rig.lobby.try_set_ready(rig.a, false).unwrap();
    rig.coordinator.broadcast_if_changed();
    assert_eq!(rig.conn_a.decode_lobby_states().len(), count);
}

// ── Countdown ───────────────────────────────────────────────────────

fn make_ready(rig: &Rig) {
    rig.lobby
        .try_apply_song_selection(selection("song:x", vec![]))
        .unwrap();
    rig.lobby.try_set_ready(rig.a, true).unwrap();
    rig.lobby.try_set_ready(rig.b, true).unwrap();
    assert_eq!(rig.lobby.status(), LobbyStatus::ReadyToPlay);
}

#[test]
fn countdown_ticks_from_five_to_zero_then_starts_gameplay() {
    let rig = two_member_rig();
    make_ready(&rig);

    let t0 = Instant::now();
    rig.coordinator.tick(t0); // arms the hold
    rig.coordinator.tick(t0); // hold elapsed (zero), enters Countdown
    assert_eq!(rig.lobby.status(), LobbyStatus::Countdown);

    for second in 0..=5u64 {
        rig.coordinator.tick(t0 + Duration::from_secs(second) + Duration::from_millis(10));
    }

    assert_eq!(rig.conn_a.countdown_ticks(), vec![5, 4, 3, 2, 1, 0]);
    assert!(rig.conn_a.saw_packet(PacketType::GameplayStart));
    assert_eq!(rig.lobby.status(), LobbyStatus::InGame);
}

#[test]
fn unreadying_cancels_the_countdown() {
    let rig = two_member_rig();
    make_ready(&rig);

    let t0 = Instant::now();
    rig.coordinator.tick(t0);
    rig.coordinator.tick(t0);
    rig.coordinator
        .tick(t0 + Duration::from_millis(10)); // first tick (5) goes out
    assert_eq!(rig.lobby.status(), LobbyStatus::Countdown);

    rig.lobby.try_set_ready(rig.b, false).unwrap();
    rig.coordinator.tick(t0 + Duration::from_millis(500));

    assert_eq!(rig.lobby.status(), LobbyStatus::SelectingSong);
    assert!(!rig.conn_a.saw_packet(PacketType::GameplayStart));
    // No further ticks after the cancellation.
    let ticks = rig.conn_a.countdown_ticks();
    rig.coordinator.tick(t0 + Duration::from_secs(2));
    assert_eq!(rig.conn_a.countdown_ticks(), ticks);
}

// ── Host promotion broadcast sequence (scenario C, end to end) ──────

#[tokio::test]
async fn host_promotion_is_broadcast_end_to_end() {
    let network = MemoryNetwork::new();
    let mut server = start_server(&network, ServerConfig::default()).await;

    let (mut alice, mut alice_events) = connect_client(&network, "Alice").await;
    let alice_id = wait_for_session(&mut alice_events).await;

    let (mut bob, mut bob_events) = connect_client(&network, "Bob").await;
    let bob_id = wait_for_session(&mut bob_events).await;

    // Bob's first snapshot shows Alice hosting and Bob as member.
    let snapshot = match common::wait_for(&mut bob_events, |e| {
        matches!(e, ClientEvent::LobbyUpdated(s) if s.players.len() == 2)
    })
    .await
    {
        ClientEvent::LobbyUpdated(snapshot) => snapshot,
        _ => unreachable!(),
    };
    assert_eq!(snapshot.players[0].player_id, alice_id);
    assert_eq!(snapshot.players[0].role, PlayerRole::Host);
    assert_eq!(snapshot.players[1].player_id, bob_id);
    assert_eq!(snapshot.players[1].role, PlayerRole::Member);

    alice.disconnect(None).await;

    // Bob is promoted once Alice is gone.
    let snapshot = match common::wait_for(&mut bob_events, |e| {
        matches!(e, ClientEvent::LobbyUpdated(s) if s.players.len() == 1)
    })
    .await
    {
        ClientEvent::LobbyUpdated(snapshot) => snapshot,
        _ => unreachable!(),
    };
    assert_eq!(snapshot.players[0].player_id, bob_id);
    assert_eq!(snapshot.players[0].role, PlayerRole::Host);

    bob.disconnect(None).await;
    server.stop().await;
}

// ── Command gating end to end ───────────────────────────────────────

#[tokio::test]
async fn non_host_song_selection_is_silently_dropped() {
    let network = MemoryNetwork::new();
    let mut server = start_server(&network, ServerConfig::default()).await;

    let (mut alice, mut alice_events) = connect_client(&network, "Alice").await;
    wait_for_session(&mut alice_events).await;
    let (mut bob, mut bob_events) = connect_client(&network, "Bob").await;
    wait_for_session(&mut bob_events).await;

    // Bob (member) tries to pick a song; nothing happens.
    bob.select_song(selection("song:forbidden", vec![])).unwrap();
    // Alice (host) picks one; everyone sees it.
    alice.select_song(selection("song:alpha", vec![])).unwrap();

    let snapshot = match common::wait_for(&mut bob_events, |e| {
        matches!(e, ClientEvent::LobbyUpdated(s) if s.selection.is_some())
    })
    .await
    {
        ClientEvent::LobbyUpdated(snapshot) => snapshot,
        _ => unreachable!(),
    };
    assert_eq!(snapshot.selection.unwrap().song_id, "song:alpha");

    alice.disconnect(None).await;
    bob.disconnect(None).await;
    server.stop().await;
}
