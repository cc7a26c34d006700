#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! LAN discovery tests: wire codec round-trips (including trailing-field
//! backward compatibility), the client-side cache, and a host answering a
//! beacon end to end.

mod common;

use std::time::{Duration, Instant};

use common::start_server;
use yargnet::discovery::{
    encode_request, encode_response, parse_request, parse_response, send_request,
    DiscoveredLobbyInfo, DiscoveryEvent, DiscoveryManager, DiscoveryResponder, DISCOVERY_MAGIC,
};
use yargnet::server::ServerConfig;
use yargnet::transport::{Transport, TransportEvent, TransportOptions};
use yargnet::transports::MemoryNetwork;

fn full_info() -> DiscoveredLobbyInfo {
    DiscoveredLobbyInfo {
        lobby_id: "lobby-42".into(),
        lobby_name: "Friday Night".into(),
        host_name: "Alice".into(),
        current_players: 3,
        max_players: 8,
        has_password: true,
        privacy_mode: 1,
        port: 7777,
        public_port: 17777,
        public_address: "203.0.113.9".into(),
        transport_id: "udp".into(),
        player_names: vec!["Alice".into(), "Bob".into(), "Cleo".into()],
        player_instruments: vec![0, 2, 5],
        no_fail_mode: true,
        shared_songs_only: false,
        band_size: 4,
        allowed_game_modes: vec![1, 3],
        session_type: 1,
        is_dedicated_server: true,
    }
}

#[test]
fn request_has_magic_and_type_byte() {
    let bytes = encode_request();
    assert_eq!(bytes.len(), 9);
    assert_eq!(&bytes[..8], &DISCOVERY_MAGIC.to_be_bytes());
    assert_eq!(bytes[8], 0x01);
    assert!(parse_request(&bytes).is_some());
}

#[test]
fn response_round_trips_field_by_field() {
    let info = full_info();
    let parsed = parse_response(&encode_response(&info)).unwrap();
    assert_eq!(parsed, info);
}

#[test]
fn absent_trailing_fields_fall_back_to_defaults() {
    let info = full_info();
    let bytes = encode_response(&info);

    // Truncate at the trailing-extension boundary: drop everything from
    // noFailMode on (2 bools + bandSize + mode list + sessionType + bool).
    let trailing_len = 1 + 1 + 4 + (4 + 4 * info.allowed_game_modes.len()) + 4 + 1;
    let legacy = &bytes[..bytes.len() - trailing_len];

    let parsed = parse_response(legacy).unwrap();
    let expected = DiscoveredLobbyInfo {
        no_fail_mode: false,
        shared_songs_only: false,
        band_size: 0,
        allowed_game_modes: vec![],
        session_type: 0,
        is_dedicated_server: false,
        ..info
    };
    assert_eq!(parsed, expected);
}

#[test]
fn corrupt_datagrams_are_rejected() {
    assert!(parse_request(b"tiny").is_none());
    assert!(parse_response(b"tiny").is_none());

    // Right length, wrong magic.
    let mut bytes = encode_request();
    bytes[0] ^= 0xFF;
    assert!(parse_request(&bytes).is_none());

    // A response truncated mid-field fails rather than misparsing.
    let full = encode_response(&full_info());
    assert!(parse_response(&full[..20]).is_none());

    // A request is not a response and vice versa.
    assert!(parse_response(&encode_request()).is_none());
    assert!(parse_request(&encode_response(&full_info())).is_none());
}

#[test]
fn negative_lengths_are_rejected() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&DISCOVERY_MAGIC.to_be_bytes());
    bytes.push(0x02);
    bytes.extend_from_slice(&(-5i32).to_be_bytes()); // lobbyId length
    assert!(parse_response(&bytes).is_none());
}

// ── Discovery cache ─────────────────────────────────────────────────

#[test]
fn cache_reports_discovered_updated_and_lost() {
    let manager = DiscoveryManager::new(Duration::from_secs(5));
    let t0 = Instant::now();
    let info = full_info();

    assert_eq!(
        manager.observe(info.clone(), t0),
        Some(DiscoveryEvent::Discovered(info.clone()))
    );
    // Same contents again: just a freshness bump.
    assert_eq!(manager.observe(info.clone(), t0 + Duration::from_secs(1)), None);

    let mut updated = info.clone();
    updated.current_players = 4;
    assert_eq!(
        manager.observe(updated.clone(), t0 + Duration::from_secs(2)),
        Some(DiscoveryEvent::Updated(updated))
    );

    assert_eq!(manager.lobbies(t0 + Duration::from_secs(3)).len(), 1);

    let lost = manager.evict_expired(t0 + Duration::from_secs(8));
    assert_eq!(
        lost,
        vec![DiscoveryEvent::Lost {
            lobby_id: "lobby-42".into()
        }]
    );
    assert!(manager.lobbies(t0 + Duration::from_secs(8)).is_empty());
}

#[test]
fn stale_entries_are_excluded_from_listing_before_eviction() {
    let manager = DiscoveryManager::new(Duration::from_secs(5));
    let t0 = Instant::now();
    manager.observe(full_info(), t0);
    assert_eq!(manager.lobbies(t0 + Duration::from_secs(4)).len(), 1);
    assert!(manager.lobbies(t0 + Duration::from_secs(6)).is_empty());
}

// ── Responder ───────────────────────────────────────────────────────

#[test]
fn responder_answers_requests_and_ignores_noise() {
    let responder = DiscoveryResponder::new(Box::new(full_info));

    let response = responder.respond(&encode_request()).unwrap();
    assert_eq!(parse_response(&response).unwrap(), full_info());

    assert!(responder.respond(b"not a beacon").is_none());
    // A response datagram is not a request either.
    assert!(responder.respond(&encode_response(&full_info())).is_none());
}

// ── Host answers a beacon end to end ────────────────────────────────

#[tokio::test]
async fn host_answers_discovery_requests() {
    let network = MemoryNetwork::new();
    let mut server = start_server(
        &network,
        ServerConfig::default()
            .with_lobby_name("Friday Night")
            .with_password("secret"),
    )
    .await;

    // A scanner only needs a bound socket, not a connection.
    let mut scanner = network.transport();
    scanner
        .start(TransportOptions::server("127.0.0.1", 9998))
        .unwrap();

    // Broadcast the beacon; the host should answer with its descriptor.
    send_request(
        &scanner,
        format!("255.255.255.255:{}", common::SERVER_PORT).parse().unwrap(),
    )
    .unwrap();

    let mut found = None;
    for _ in 0..200 {
        for event in scanner.poll(Duration::from_millis(25)).await {
            if let TransportEvent::UnconnectedMessage { payload, .. } = event {
                if let Some(info) = parse_response(&payload) {
                    found = Some(info);
                }
            }
        }
        if found.is_some() {
            break;
        }
    }

    let info = found.expect("no discovery response received");
    assert_eq!(info.lobby_name, "Friday Night");
    assert!(info.has_password);
    assert_eq!(info.max_players, 8);
    assert_eq!(info.port, i32::from(common::SERVER_PORT));

    let manager = DiscoveryManager::new(Duration::from_secs(5));
    assert!(matches!(
        manager.observe(info, Instant::now()),
        Some(DiscoveryEvent::Discovered(_))
    ));

    scanner.shutdown(None);
    server.stop().await;
}
