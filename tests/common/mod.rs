#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Shared utilities for yargnet integration tests.
//!
//! Spins up server/client runtimes over an in-process [`MemoryNetwork`] and
//! provides event-stream helpers with hard timeouts so a wedged runtime
//! fails the test instead of hanging it.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use yargnet::client::{ClientConfig, ClientRuntime};
use yargnet::event::ClientEvent;
use yargnet::server::{ServerConfig, ServerRuntime};
use yargnet::transports::{MemoryNetwork, MemoryTransport};

/// Upper bound for any single event wait.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Server bound on the hub's default port.
pub const SERVER_PORT: u16 = 7777;

/// Start a server runtime on `127.0.0.1:7777` with the given config.
pub async fn start_server(
    network: &MemoryNetwork,
    config: ServerConfig,
) -> ServerRuntime<MemoryTransport> {
    let mut server = ServerRuntime::new(network.transport());
    server
        .configure(config.with_address("127.0.0.1").with_port(SERVER_PORT))
        .expect("configure before start");
    server.start().await.expect("server start");
    server
}

/// Connect a client with the given display name, returning the runtime and
/// its event stream.
pub async fn connect_client(
    network: &MemoryNetwork,
    player_name: &str,
) -> (ClientRuntime<MemoryTransport>, mpsc::Receiver<ClientEvent>) {
    connect_client_with(network, ClientConfig::new(player_name)).await
}

/// Connect a client with a fully custom config.
pub async fn connect_client_with(
    network: &MemoryNetwork,
    config: ClientConfig,
) -> (ClientRuntime<MemoryTransport>, mpsc::Receiver<ClientEvent>) {
    let mut client = ClientRuntime::new(network.transport(), config);
    let events = client
        .connect("127.0.0.1", SERVER_PORT, CancellationToken::new())
        .await
        .expect("client connect");
    (client, events)
}

/// Receive the next event or fail the test.
pub async fn recv_event(events: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("event channel closed")
}

/// Skip events until `predicate` matches, returning the matching event.
pub async fn wait_for<F>(events: &mut mpsc::Receiver<ClientEvent>, mut predicate: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    loop {
        let event = recv_event(events).await;
        if predicate(&event) {
            return event;
        }
    }
}

/// Wait until the handshake is accepted, returning the granted session id.
pub async fn wait_for_session(events: &mut mpsc::Receiver<ClientEvent>) -> yargnet::SessionId {
    match wait_for(events, |e| matches!(e, ClientEvent::HandshakeAccepted { .. })).await {
        ClientEvent::HandshakeAccepted { session_id } => session_id,
        _ => unreachable!(),
    }
}
