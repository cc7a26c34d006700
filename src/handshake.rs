//! Handshake gate on both ends of a connection.
//!
//! Server side: a connecting peer must present a valid `HandshakeRequest`
//! within the hello window. Checks run in a fixed order — protocol version,
//! player name, capacity, password (constant-time), duplicate registration —
//! and the peer gets exactly one `HandshakeResponse`: accepted with a fresh
//! session id, or rejected with a reason followed by a disconnect.
//!
//! Client side: the hello is written the moment the transport connects, then
//! the client waits (bounded) for the response and records the granted
//! session id into the shared [`ClientSessionContext`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::error::{HandshakeError, SessionError};
use crate::protocol::{
    HandshakeRequest, HandshakeResponse, PacketEnvelope, PacketType, SessionId, PROTOCOL_VERSION,
};
use crate::serializer;
use crate::session::{validate_player_name, ClientSessionContext, SessionManager, SessionRecord};
use crate::transport::{Channel, Connection, ConnectionId};

/// How long a connected peer may stay silent before its hello times out.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the client waits for the server's handshake response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

// ── Server ──────────────────────────────────────────────────────────

/// Server-side handshake validator and responder.
pub struct ServerHandshake {
    sessions: Arc<SessionManager>,
    password: Option<String>,
    /// Peers connected but not yet past the handshake, by connect time.
    pending: Mutex<HashMap<ConnectionId, Instant>>,
}

impl ServerHandshake {
    pub fn new(sessions: Arc<SessionManager>, password: Option<String>) -> Self {
        Self {
            sessions,
            password,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Track a freshly connected peer awaiting its hello.
    pub fn note_connected(&self, connection_id: ConnectionId, now: Instant) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(connection_id, now);
        }
    }

    /// Stop tracking a peer (handshake done or peer gone).
    pub fn note_disconnected(&self, connection_id: ConnectionId) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&connection_id);
        }
    }

    /// Drain peers whose hello window has elapsed; the caller disconnects
    /// them.
    pub fn expired(&self, now: Instant) -> Vec<ConnectionId> {
        let Ok(mut pending) = self.pending.lock() else {
            return Vec::new();
        };
        let expired: Vec<ConnectionId> = pending
            .iter()
            .filter(|(_, since)| now.duration_since(**since) >= HELLO_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            pending.remove(id);
        }
        expired
    }

    /// Validate a hello and, on success, mint the session.
    ///
    /// Side effects either way: the peer receives exactly one
    /// `HandshakeResponse` on the reliable-ordered channel, and a rejected
    /// peer is disconnected with the reason bytes.
    pub fn process(
        &self,
        connection: Arc<dyn Connection>,
        request: &HandshakeRequest,
    ) -> Result<SessionRecord, HandshakeError> {
        self.note_disconnected(connection.id());
        match self.validate(Arc::clone(&connection), request) {
            Ok(record) => {
                info!(
                    session_id = %record.session_id,
                    player = %record.player_name,
                    remote = %connection.remote_addr(),
                    "handshake accepted"
                );
                respond(
                    connection.as_ref(),
                    HandshakeResponse {
                        accepted: true,
                        session_id: Some(record.session_id),
                        reason: None,
                    },
                );
                Ok(record)
            }
            Err(error) => {
                let reason = error.reject_reason();
                warn!(remote = %connection.remote_addr(), %error, "handshake rejected");
                respond(
                    connection.as_ref(),
                    HandshakeResponse {
                        accepted: false,
                        session_id: None,
                        reason: Some(reason.clone()),
                    },
                );
                connection.disconnect(Some(reason.as_bytes()));
                Err(error)
            }
        }
    }

    fn validate(
        &self,
        connection: Arc<dyn Connection>,
        request: &HandshakeRequest,
    ) -> Result<SessionRecord, HandshakeError> {
        if request.client_version != PROTOCOL_VERSION {
            return Err(HandshakeError::ProtocolMismatch {
                client_version: request.client_version.clone(),
            });
        }
        let player_name =
            validate_player_name(&request.player_name).ok_or(HandshakeError::InvalidPlayerName)?;
        if self.sessions.len() >= self.sessions.capacity() {
            return Err(HandshakeError::ServerFull);
        }
        if let Some(expected) = &self.password {
            let provided = request.password.as_deref().unwrap_or("");
            let matches: bool = expected
                .as_bytes()
                .ct_eq(provided.as_bytes())
                .into();
            if !matches {
                return Err(HandshakeError::InvalidPassword);
            }
        }
        self.sessions
            .try_create_session(connection, &player_name)
            .map_err(|error| match error {
                SessionError::AlreadyRegistered => HandshakeError::AlreadyRegistered,
                SessionError::CapacityExceeded => HandshakeError::ServerFull,
                SessionError::InvalidName | SessionError::Unknown => {
                    HandshakeError::InvalidPlayerName
                }
            })
    }
}

fn respond(connection: &dyn Connection, response: HandshakeResponse) {
    let envelope = PacketEnvelope::new(PacketType::HandshakeResponse, response);
    match serializer::encode(&envelope) {
        Ok(bytes) => {
            if let Err(error) = connection.send(&bytes, Channel::ReliableOrdered) {
                warn!(%error, "failed to send handshake response");
            }
        }
        Err(error) => warn!(%error, "failed to encode handshake response"),
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// What the server's response meant for this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientHandshakeOutcome {
    Accepted { session_id: SessionId },
    Rejected { reason: String },
}

/// Client-side hello writer and response tracker.
pub struct ClientHandshake {
    context: Arc<ClientSessionContext>,
    player_name: String,
    password: Option<String>,
    awaiting_since: Mutex<Option<Instant>>,
}

impl ClientHandshake {
    pub fn new(
        context: Arc<ClientSessionContext>,
        player_name: impl Into<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            context,
            player_name: player_name.into(),
            password,
            awaiting_since: Mutex::new(None),
        }
    }

    /// Write the hello; called the moment the transport reports connected.
    pub fn on_connected(&self, connection: &dyn Connection, now: Instant) {
        let envelope = PacketEnvelope::new(
            PacketType::HandshakeRequest,
            HandshakeRequest {
                client_version: PROTOCOL_VERSION.to_string(),
                player_name: self.player_name.clone(),
                password: self.password.clone(),
            },
        );
        match serializer::encode(&envelope) {
            Ok(bytes) => {
                debug!(player = %self.player_name, "sending handshake request");
                if let Err(error) = connection.send(&bytes, Channel::ReliableOrdered) {
                    warn!(%error, "failed to send handshake request");
                    return;
                }
                if let Ok(mut since) = self.awaiting_since.lock() {
                    *since = Some(now);
                }
            }
            Err(error) => warn!(%error, "failed to encode handshake request"),
        }
    }

    /// Digest the server's response, updating the shared session context.
    pub fn handle_response(&self, response: &HandshakeResponse) -> ClientHandshakeOutcome {
        if let Ok(mut since) = self.awaiting_since.lock() {
            *since = None;
        }
        match (response.accepted, response.session_id) {
            (true, Some(session_id)) => {
                self.context.set(session_id);
                ClientHandshakeOutcome::Accepted { session_id }
            }
            _ => {
                self.context.clear();
                ClientHandshakeOutcome::Rejected {
                    reason: response
                        .reason
                        .clone()
                        .unwrap_or_else(|| "Handshake rejected.".to_string()),
                }
            }
        }
    }

    /// Whether the response window has elapsed with no answer.
    pub fn timed_out(&self, now: Instant) -> bool {
        self.awaiting_since
            .lock()
            .ok()
            .and_then(|since| *since)
            .is_some_and(|since| now.duration_since(since) >= RESPONSE_TIMEOUT)
    }

    /// Forget any in-flight hello (peer went away).
    pub fn reset(&self) {
        if let Ok(mut since) = self.awaiting_since.lock() {
            *since = None;
        }
        self.context.clear();
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
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct RecordingConnection {
        id: ConnectionId,
        sent: Mutex<Vec<Vec<u8>>>,
        disconnected: AtomicBool,
    }

    impl RecordingConnection {
        fn new(id: ConnectionId) -> Arc<Self> {
            Arc::new(Self {
                id,
                sent: Mutex::new(Vec::new()),
                disconnected: AtomicBool::new(false),
            })
        }

        fn last_response(&self) -> HandshakeResponse {
            let sent = self.sent.lock().unwrap();
            let bytes = sent.last().unwrap();
            serializer::decode::<HandshakeResponse>(bytes).unwrap().payload
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
        fn disconnect(&self, _reason: Option<&[u8]>) {
            self.disconnected.store(true, Ordering::Relaxed);
        }
        fn is_open(&self) -> bool {
            !self.disconnected.load(Ordering::Relaxed)
        }
    }

    fn request(name: &str) -> HandshakeRequest {
        HandshakeRequest {
            client_version: PROTOCOL_VERSION.into(),
            player_name: name.into(),
            password: None,
        }
    }

    fn handshake(capacity: usize, password: Option<&str>) -> ServerHandshake {
        ServerHandshake::new(
            Arc::new(SessionManager::new(capacity)),
            password.map(str::to_string),
        )
    }

    #[test]
    fn accepted_handshake_sends_session_id() {
        let server = handshake(4, None);
        let conn = RecordingConnection::new(1);
        let record = server.process(Arc::clone(&conn) as _, &request("Host")).unwrap();

        let response = conn.last_response();
        assert!(response.accepted);
        assert_eq!(response.session_id, Some(record.session_id));
        assert!(conn.is_open());
    }

    #[test]
    fn version_mismatch_rejects_with_expected_version() {
        let server = handshake(4, None);
        let conn = RecordingConnection::new(1);
        let mut req = request("Host");
        req.client_version = "0.0.1".into();

        let error = server.process(Arc::clone(&conn) as _, &req).unwrap_err();
        assert!(matches!(error, HandshakeError::ProtocolMismatch { .. }));

        let response = conn.last_response();
        assert!(!response.accepted);
        assert_eq!(
            response.reason.as_deref(),
            Some(format!("Protocol mismatch: expected {PROTOCOL_VERSION}").as_str())
        );
        assert!(!conn.is_open());
    }

    #[test]
    fn wrong_password_rejects() {
        let server = handshake(4, Some("hunter2"));
        let conn = RecordingConnection::new(1);
        let mut req = request("Host");
        req.password = Some("wrong".into());

        let error = server.process(Arc::clone(&conn) as _, &req).unwrap_err();
        assert_eq!(error, HandshakeError::InvalidPassword);
        assert_eq!(conn.last_response().reason.as_deref(), Some("Invalid password."));
    }

    #[test]
    fn missing_password_rejects_when_one_is_set() {
        let server = handshake(4, Some("hunter2"));
        let conn = RecordingConnection::new(1);
        let error = server.process(Arc::clone(&conn) as _, &request("Host")).unwrap_err();
        assert_eq!(error, HandshakeError::InvalidPassword);
    }

    #[test]
    fn capacity_overflow_rejects_with_server_full() {
        let server = handshake(1, None);
        let first = RecordingConnection::new(1);
        server.process(Arc::clone(&first) as _, &request("A")).unwrap();

        let second = RecordingConnection::new(2);
        let error = server.process(Arc::clone(&second) as _, &request("B")).unwrap_err();
        assert_eq!(error, HandshakeError::ServerFull);
        assert_eq!(second.last_response().reason.as_deref(), Some("Server is full."));
    }

    #[test]
    fn hello_timeout_expires_pending_peers() {
        let server = handshake(4, None);
        let start = Instant::now();
        server.note_connected(9, start);
        assert!(server.expired(start + Duration::from_secs(1)).is_empty());
        assert_eq!(server.expired(start + HELLO_TIMEOUT), vec![9]);
        // Already drained.
        assert!(server.expired(start + HELLO_TIMEOUT).is_empty());
    }

    #[test]
    fn client_records_session_on_accept() {
        let context = Arc::new(ClientSessionContext::new());
        let client = ClientHandshake::new(Arc::clone(&context), "Alice", None);
        let session_id = uuid::Uuid::new_v4();
        let outcome = client.handle_response(&HandshakeResponse {
            accepted: true,
            session_id: Some(session_id),
            reason: None,
        });
        assert_eq!(outcome, ClientHandshakeOutcome::Accepted { session_id });
        assert_eq!(context.session_id(), Some(session_id));
    }

    #[test]
    fn client_clears_session_on_reject() {
        let context = Arc::new(ClientSessionContext::new());
        context.set(uuid::Uuid::new_v4());
        let client = ClientHandshake::new(Arc::clone(&context), "Alice", None);
        let outcome = client.handle_response(&HandshakeResponse {
            accepted: false,
            session_id: None,
            reason: Some("Server is full.".into()),
        });
        assert_eq!(
            outcome,
            ClientHandshakeOutcome::Rejected {
                reason: "Server is full.".into()
            }
        );
        assert_eq!(context.session_id(), None);
    }
}
