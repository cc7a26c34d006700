#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Rendezvous-plane tests: the directory, punch and relay clients against
//! loopback HTTP servers, and the relay tunnel against a miniature UDP
//! forwarder.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tokio::net::UdpSocket;
use uuid::Uuid;
use yargnet::directory::{
    LobbyAdvertisementRequest, LobbyAdvertiser, LobbyCodeRegistration, LobbyDirectoryClient,
    LobbyDirectoryEntry,
};
use yargnet::error::PunchError;
use yargnet::punch::{NatPunchClient, PunchRegisterRequest, PunchRequest};
use yargnet::relay::{
    encode_frame, parse_frame, RelayAllocation, RelayClient, RelayFrame, RelayTransport,
};
use yargnet::transport::{Channel, Transport, TransportEvent, TransportOptions};

// ── Loopback directory server ───────────────────────────────────────

type DirectoryState = Arc<Mutex<HashMap<String, LobbyDirectoryEntry>>>;

async fn spawn_directory(state: DirectoryState) -> String {
    let app = Router::new()
        .route(
            "/lobbies",
            get(|State(state): State<DirectoryState>| async move {
                let entries: Vec<LobbyDirectoryEntry> =
                    state.lock().unwrap().values().cloned().collect();
                Json(entries)
            })
            .post(
                |State(state): State<DirectoryState>, Json(req): Json<LobbyAdvertisementRequest>| async move {
                    let entry = LobbyDirectoryEntry {
                        lobby_id: req.lobby_id.clone(),
                        lobby_name: req.lobby_name,
                        host_name: req.host_name,
                        address: req.address,
                        port: req.port,
                        current_players: req.current_players,
                        max_players: req.max_players,
                        has_password: req.has_password,
                        version: req.version,
                        last_heartbeat_utc: Utc::now(),
                    };
                    state.lock().unwrap().insert(req.lobby_id, entry);
                },
            ),
        )
        .route(
            "/lobbies/{id}",
            axum::routing::delete(
                |State(state): State<DirectoryState>, Path(id): Path<String>| async move {
                    state.lock().unwrap().remove(&id);
                },
            ),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn advertisement(lobby_id: &str) -> LobbyAdvertisementRequest {
    LobbyAdvertisementRequest {
        lobby_id: lobby_id.into(),
        lobby_name: "Friday Night".into(),
        host_name: "Alice".into(),
        address: "203.0.113.9".into(),
        port: 7777,
        current_players: 1,
        max_players: 8,
        has_password: false,
        version: "0.1.0".into(),
    }
}

#[tokio::test]
async fn advertise_then_poll_then_withdraw() {
    let state: DirectoryState = Arc::new(Mutex::new(HashMap::new()));
    let base = spawn_directory(Arc::clone(&state)).await;

    let advertiser = LobbyAdvertiser::new(&base);
    advertiser.advertise(&advertisement("lob-1")).await.unwrap();

    let client = LobbyDirectoryClient::new(&base, Duration::from_secs(30));
    let entries = client.fetch().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].lobby_id, "lob-1");
    assert_eq!(entries[0].lobby_name, "Friday Night");

    advertiser.withdraw("lob-1").await;
    assert!(client.fetch().await.unwrap().is_empty());
}

#[tokio::test]
async fn refresh_reports_only_structural_changes() {
    let state: DirectoryState = Arc::new(Mutex::new(HashMap::new()));
    let base = spawn_directory(Arc::clone(&state)).await;
    let client = LobbyDirectoryClient::new(&base, Duration::from_secs(30));

    // Empty list is itself a change from "never fetched".
    assert_eq!(client.refresh().await.unwrap(), Some(vec![]));
    assert_eq!(client.refresh().await.unwrap(), None);

    LobbyAdvertiser::new(&base)
        .advertise(&advertisement("lob-1"))
        .await
        .unwrap();
    assert!(client.refresh().await.unwrap().is_some());
    assert_eq!(client.refresh().await.unwrap(), None);
}

#[tokio::test]
async fn stale_directory_entries_are_filtered() {
    let state: DirectoryState = Arc::new(Mutex::new(HashMap::new()));
    let base = spawn_directory(Arc::clone(&state)).await;

    // Plant one fresh and one stale entry directly.
    {
        let mut entries = state.lock().unwrap();
        let mut fresh = LobbyDirectoryEntry {
            lobby_id: "fresh".into(),
            lobby_name: "Fresh".into(),
            host_name: "a".into(),
            address: "203.0.113.9".into(),
            port: 7777,
            current_players: 1,
            max_players: 8,
            has_password: false,
            version: "0.1.0".into(),
            last_heartbeat_utc: Utc::now(),
        };
        entries.insert("fresh".into(), fresh.clone());
        fresh.lobby_id = "stale".into();
        fresh.last_heartbeat_utc = Utc::now() - chrono::Duration::seconds(120);
        entries.insert("stale".into(), fresh);
    }

    let client = LobbyDirectoryClient::new(&base, Duration::from_secs(30));
    let listed = client.fetch().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].lobby_id, "fresh");
}

// ── Loopback punch server ───────────────────────────────────────────

#[tokio::test]
async fn punch_signaling_yields_a_ticket() {
    let registrations: Arc<Mutex<Vec<PunchRegisterRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let reg_state = Arc::clone(&registrations);

    let app = Router::new()
        .route(
            "/api/punch/info",
            get(|| async {
                Json(serde_json::json!({
                    "available": true,
                    "address": "127.0.0.1",
                    "port": 3478,
                }))
            }),
        )
        .route(
            "/api/punch/register",
            post(move |Json(req): Json<PunchRegisterRequest>| {
                let reg_state = Arc::clone(&reg_state);
                async move {
                    reg_state.lock().unwrap().push(req);
                }
            }),
        )
        .route(
            "/api/punch/request",
            post(|Json(_req): Json<PunchRequest>| async {
                Json(serde_json::json!({
                    "success": true,
                    "punchToken": "tok-123",
                }))
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let punch = NatPunchClient::new(format!("http://{addr}"));
    punch
        .register_host(&PunchRegisterRequest {
            lobby_id: "lob-1".into(),
            internal_endpoint: "192.168.1.4:7777".into(),
            external_port: 17777,
        })
        .await
        .unwrap();
    assert_eq!(registrations.lock().unwrap().len(), 1);

    let ticket = punch
        .acquire_ticket(&PunchRequest {
            lobby_id: "lob-1".into(),
            client_internal_endpoint: "192.168.1.9:50000".into(),
            client_port: 50000,
            client_token: None,
        })
        .await
        .unwrap();
    assert_eq!(ticket.token, "tok-123");
    assert_eq!(ticket.punch_server, "127.0.0.1:3478".parse::<SocketAddr>().unwrap());
}

#[tokio::test]
async fn unavailable_punch_server_is_an_error() {
    let app = Router::new().route(
        "/api/punch/info",
        get(|| async {
            Json(serde_json::json!({
                "available": false,
                "address": "",
                "port": 0,
                "message": "maintenance",
            }))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let punch = NatPunchClient::new(format!("http://{addr}"));
    match punch.info().await {
        Err(PunchError::Unavailable(message)) => assert_eq!(message, "maintenance"),
        other => panic!("expected Unavailable, got {other:?}"),
    }
}

// ── Lobby codes ─────────────────────────────────────────────────────

#[tokio::test]
async fn lobby_codes_mint_register_resolve_release() {
    type Codes = Arc<Mutex<HashMap<String, LobbyDirectoryEntry>>>;
    let codes: Codes = Arc::new(Mutex::new(HashMap::new()));

    let mint = post(|Json(body): Json<serde_json::Value>| async move {
        Json(serde_json::json!({
            "code": "A1B2C3",
            "lobbyId": body["lobbyId"],
        }))
    });
    let register = {
        let codes = Arc::clone(&codes);
        post(move |Json(req): Json<LobbyCodeRegistration>| {
            let codes = Arc::clone(&codes);
            async move {
                codes.lock().unwrap().insert(
                    req.code.clone(),
                    LobbyDirectoryEntry {
                        lobby_id: req.lobby_id,
                        lobby_name: "Coded".into(),
                        host_name: "Alice".into(),
                        address: req.host_address,
                        port: req.host_port,
                        current_players: 1,
                        max_players: 8,
                        has_password: false,
                        version: "0.1.0".into(),
                        last_heartbeat_utc: Utc::now(),
                    },
                );
            }
        })
    };
    let lookup = {
        let codes = Arc::clone(&codes);
        get(move |Path(code): Path<String>| {
            let codes = Arc::clone(&codes);
            async move {
                match codes.lock().unwrap().get(&code) {
                    Some(entry) => Json(entry.clone()).into_response(),
                    None => axum::http::StatusCode::NOT_FOUND.into_response(),
                }
            }
        })
    };

    let app = Router::new()
        .route("/api/lobbies/code", mint)
        .route("/api/lobbies/code/register", register)
        .route("/api/lobbies/code/{code}", lookup);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let client = LobbyDirectoryClient::new(format!("http://{addr}"), Duration::from_secs(30));
    let minted = client.mint_code("lob-1").await.unwrap();
    assert_eq!(minted.code, "A1B2C3");
    assert_eq!(minted.lobby_id, "lob-1");

    client
        .register_code(&LobbyCodeRegistration {
            code: minted.code.clone(),
            lobby_id: minted.lobby_id.clone(),
            host_address: "203.0.113.9".into(),
            host_port: 7777,
        })
        .await
        .unwrap();

    let resolved = client.resolve_code("A1B2C3").await.unwrap().unwrap();
    assert_eq!(resolved.lobby_id, "lob-1");
    assert_eq!(resolved.port, 7777);

    assert!(client.resolve_code("FFFFFF").await.unwrap().is_none());
}

// ── Relay: allocation + tunnel ──────────────────────────────────────

/// A miniature relay: ACKs registrations, pairs one host with one client per
/// session and forwards data frames between them.
async fn spawn_mini_relay() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut host: Option<SocketAddr> = None;
        let mut client: Option<SocketAddr> = None;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let Ok(frame) = parse_frame(&buf[..len]) else {
                continue;
            };
            match frame {
                RelayFrame::HostRegister { .. } => {
                    host = Some(from);
                    let ack = encode_frame(&RelayFrame::Ack {
                        status: 0,
                        message: None,
                    });
                    let _ = socket.send_to(&ack, from).await;
                }
                RelayFrame::ClientRegister { session_id } => {
                    client = Some(from);
                    let ack = encode_frame(&RelayFrame::Ack {
                        status: 0,
                        message: None,
                    });
                    let _ = socket.send_to(&ack, from).await;
                    if let Some(host) = host {
                        let notice = encode_frame(&RelayFrame::PeerConnected { session_id });
                        let _ = socket.send_to(&notice, host).await;
                    }
                }
                RelayFrame::Data { .. } => {
                    let other = if Some(from) == host { client } else { host };
                    if let Some(other) = other {
                        let _ = socket.send_to(&buf[..len], other).await;
                    }
                }
                RelayFrame::Disconnect { session_id } => {
                    let other = if Some(from) == host { client } else { host };
                    if let Some(other) = other {
                        let notice = encode_frame(&RelayFrame::PeerDisconnected { session_id });
                        let _ = socket.send_to(&notice, other).await;
                    }
                }
                _ => {}
            }
        }
    });
    addr
}

/// Drive a transport until `predicate` yields, or fail.
async fn poll_until<T, F, R>(transport: &mut T, mut predicate: F) -> R
where
    T: Transport,
    F: FnMut(TransportEvent) -> Option<R>,
{
    for _ in 0..200 {
        for event in transport.poll(Duration::from_millis(25)).await {
            if let Some(result) = predicate(event) {
                return result;
            }
        }
    }
    panic!("transport never produced the expected event");
}

#[tokio::test]
async fn relay_tunnel_forwards_data_both_ways() {
    let relay_addr = spawn_mini_relay().await;
    let session_id = Uuid::new_v4();
    let allocation = RelayAllocation {
        session_id,
        relay_address: relay_addr.ip().to_string(),
        relay_port: relay_addr.port(),
    };

    let mut host = RelayTransport::new(allocation.clone());
    host.start(TransportOptions::server("0.0.0.0", 0)).unwrap();

    let mut client = RelayTransport::new(allocation);
    client.start(TransportOptions::client("0.0.0.0", 0)).unwrap();

    // The client's ACK and the host's peer notice both come up.
    let client_conn = poll_until(&mut client, |event| match event {
        TransportEvent::PeerConnected(conn) => Some(conn),
        _ => None,
    })
    .await;
    let host_conn = poll_until(&mut host, |event| match event {
        TransportEvent::PeerConnected(conn) => Some(conn),
        _ => None,
    })
    .await;

    client_conn
        .send(b"hello from client", Channel::ReliableOrdered)
        .unwrap();
    let payload = poll_until(&mut host, |event| match event {
        TransportEvent::PayloadReceived { payload, .. } => Some(payload),
        _ => None,
    })
    .await;
    assert_eq!(payload, b"hello from client");

    host_conn
        .send(b"hello from host", Channel::ReliableOrdered)
        .unwrap();
    let payload = poll_until(&mut client, |event| match event {
        TransportEvent::PayloadReceived { payload, .. } => Some(payload),
        _ => None,
    })
    .await;
    assert_eq!(payload, b"hello from host");

    // Client hangs up; the host observes it.
    client_conn.disconnect(None);
    poll_until(&mut host, |event| match event {
        TransportEvent::PeerDisconnected { .. } => Some(()),
        _ => None,
    })
    .await;

    client.shutdown(None);
    host.shutdown(None);
}

#[tokio::test]
async fn relay_allocation_round_trips_over_http() {
    let session_id = Uuid::new_v4();
    let app = Router::new().route(
        "/api/relay/allocate",
        post(move |Json(body): Json<serde_json::Value>| async move {
            assert_eq!(body["lobbyId"], "lob-1");
            Json(serde_json::json!({
                "success": true,
                "sessionId": session_id,
                "relayAddress": "127.0.0.1",
                "relayPort": 40000,
            }))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let relay = RelayClient::new(format!("http://{addr}"));
    let allocation = relay.allocate("lob-1").await.unwrap();
    assert_eq!(allocation.session_id, session_id);
    assert_eq!(allocation.relay_port, 40000);
    assert_eq!(
        allocation.socket_addr(),
        Some("127.0.0.1:40000".parse().unwrap())
    );
}
