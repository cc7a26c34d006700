#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire-format tests for the packet protocol: round-trip serialization of
//! every envelope payload, camelCase property names, enums as strings and
//! omitted nulls.

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;
use yargnet::protocol::{
    GameplayCountdown, GameplayEnd, GameplayPause, GameplayStart, GameplayState, GameplayTimeSync,
    HandshakeRequest, HandshakeResponse, Heartbeat, InstrumentAssignment, LobbyInvite,
    LobbyPlayer, LobbyReadyState, LobbyStateSnapshot, LobbyStatus, PacketEnvelope, PacketType,
    PlayerRole, ReplaySyncComplete, ReplaySyncData, ReplaySyncRequest, SongSelection,
    SongSelectionState, PROTOCOL_VERSION,
};
use yargnet::serializer;

/// Encode an envelope, peek its tag, decode it back and return the payload.
fn round_trip<T>(packet_type: PacketType, payload: T) -> T
where
    T: Serialize + DeserializeOwned + PartialEq + std::fmt::Debug + Clone,
{
    let envelope = PacketEnvelope::new(packet_type, payload.clone());
    let bytes = serializer::encode(&envelope).expect("encode");

    assert_eq!(serializer::peek_type(&bytes), Some(packet_type));

    let decoded: PacketEnvelope<T> = serializer::decode(&bytes).expect("decode");
    assert_eq!(decoded.packet_type, packet_type);
    assert_eq!(decoded.version, PROTOCOL_VERSION);
    assert_eq!(decoded.payload, payload);
    decoded.payload
}

fn sample_snapshot() -> LobbyStateSnapshot {
    LobbyStateSnapshot {
        lobby_id: Uuid::from_u128(7),
        players: vec![
            LobbyPlayer {
                player_id: Uuid::from_u128(1),
                display_name: "Alice".into(),
                role: PlayerRole::Host,
                is_ready: true,
            },
            LobbyPlayer {
                player_id: Uuid::from_u128(2),
                display_name: "Bob".into(),
                role: PlayerRole::Spectator,
                is_ready: false,
            },
        ],
        status: LobbyStatus::SelectingSong,
        selection: Some(SongSelectionState {
            song_id: "song:alpha".into(),
            assignments: vec![InstrumentAssignment {
                player_id: Uuid::from_u128(1),
                instrument: "Guitar".into(),
                difficulty: "Expert".into(),
            }],
            all_ready: false,
        }),
    }
}

#[test]
fn handshake_request_round_trip() {
    round_trip(
        PacketType::HandshakeRequest,
        HandshakeRequest {
            client_version: PROTOCOL_VERSION.into(),
            player_name: "Alice".into(),
            password: Some("hunter2".into()),
        },
    );
}

#[test]
fn handshake_response_round_trip() {
    round_trip(
        PacketType::HandshakeResponse,
        HandshakeResponse {
            accepted: true,
            session_id: Some(Uuid::from_u128(42)),
            reason: None,
        },
    );
    round_trip(
        PacketType::HandshakeResponse,
        HandshakeResponse {
            accepted: false,
            session_id: None,
            reason: Some("Server is full.".into()),
        },
    );
}

#[test]
fn heartbeat_round_trip() {
    round_trip(
        PacketType::Heartbeat,
        Heartbeat {
            client_time_millis: 123_456,
        },
    );
}

#[test]
fn lobby_state_round_trip() {
    round_trip(PacketType::LobbyState, sample_snapshot());
}

#[test]
fn lobby_invite_round_trip() {
    round_trip(
        PacketType::LobbyInvite,
        LobbyInvite {
            lobby_id: Uuid::from_u128(7),
            target_session_id: Uuid::from_u128(2),
            inviter_name: "Alice".into(),
            address: "203.0.113.9".into(),
            port: 7777,
            code: Some("A1B2C3".into()),
        },
    );
}

#[test]
fn lobby_commands_round_trip() {
    round_trip(
        PacketType::LobbyReadyState,
        LobbyReadyState {
            session_id: Uuid::from_u128(1),
            is_ready: true,
        },
    );
    round_trip(
        PacketType::SongSelection,
        SongSelection {
            session_id: Uuid::from_u128(1),
            state: SongSelectionState {
                song_id: "song:beta".into(),
                assignments: vec![],
                all_ready: false,
            },
        },
    );
}

#[test]
fn gameplay_payloads_round_trip() {
    round_trip(
        PacketType::GameplayCountdown,
        GameplayCountdown {
            seconds_remaining: 3,
        },
    );
    round_trip(
        PacketType::GameplayStart,
        GameplayStart {
            song_id: "song:alpha".into(),
        },
    );
    round_trip(
        PacketType::GameplayState,
        GameplayState {
            session_id: Uuid::from_u128(1),
            frame: vec![0, 1, 2, 255, 254],
        },
    );
    round_trip(
        PacketType::GameplayTimeSync,
        GameplayTimeSync {
            session_id: Uuid::from_u128(1),
            song_time_millis: 93_500,
        },
    );
    round_trip(
        PacketType::GameplayPause,
        GameplayPause {
            session_id: Uuid::from_u128(1),
            paused: true,
            song_time_millis: 41_000,
        },
    );
    round_trip(
        PacketType::GameplayEnd,
        GameplayEnd {
            session_id: Uuid::from_u128(1),
            aborted: false,
        },
    );
}

#[test]
fn replay_sync_payloads_round_trip() {
    round_trip(
        PacketType::ReplaySyncRequest,
        ReplaySyncRequest {
            session_id: Uuid::from_u128(1),
        },
    );
    round_trip(
        PacketType::ReplaySyncData,
        ReplaySyncData {
            session_id: Uuid::from_u128(1),
            chunk_index: 4,
            data: vec![9; 1024],
        },
    );
    round_trip(
        PacketType::ReplaySyncComplete,
        ReplaySyncComplete {
            session_id: Uuid::from_u128(1),
            chunk_count: 5,
        },
    );
}

// ── JSON shape fixtures ─────────────────────────────────────────────

#[test]
fn envelope_properties_are_camel_case_with_type_tag() {
    let envelope = PacketEnvelope::new(
        PacketType::LobbyReadyState,
        LobbyReadyState {
            session_id: Uuid::from_u128(1),
            is_ready: true,
        },
    );
    let json: serde_json::Value =
        serde_json::from_slice(&serializer::encode(&envelope).unwrap()).unwrap();

    assert_eq!(json["type"], "LobbyReadyState");
    assert_eq!(json["version"], PROTOCOL_VERSION);
    assert_eq!(json["payload"]["isReady"], true);
    assert!(json["payload"].get("sessionId").is_some());
    assert!(json["payload"].get("session_id").is_none());
}

#[test]
fn enums_serialize_as_strings() {
    let json = serde_json::to_value(sample_snapshot()).unwrap();
    assert_eq!(json["status"], "SelectingSong");
    assert_eq!(json["players"][0]["role"], "Host");
    assert_eq!(json["players"][1]["role"], "Spectator");
}

#[test]
fn none_fields_are_omitted() {
    let response = HandshakeResponse {
        accepted: true,
        session_id: Some(Uuid::from_u128(42)),
        reason: None,
    };
    let json = serde_json::to_value(&response).unwrap();
    assert!(json.get("reason").is_none());

    let snapshot = LobbyStateSnapshot {
        selection: None,
        ..sample_snapshot()
    };
    let json = serde_json::to_value(&snapshot).unwrap();
    assert!(json.get("selection").is_none());
}

#[test]
fn snapshot_equality_is_structural() {
    assert_eq!(sample_snapshot(), sample_snapshot());

    let mut changed = sample_snapshot();
    changed.players[0].is_ready = false;
    assert_ne!(sample_snapshot(), changed);
}
