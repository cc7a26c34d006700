//! Connection↔session bookkeeping.
//!
//! A session is the post-handshake binding of a [`Connection`] to a player
//! identity. The [`SessionManager`] owns the records; removal releases the
//! connection reference without disconnecting it — hanging up is the
//! runtime's call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::SessionError;
use crate::protocol::SessionId;
use crate::transport::{Connection, ConnectionId};

/// Display-name length bounds after trimming.
const PLAYER_NAME_MIN: usize = 1;
const PLAYER_NAME_MAX: usize = 24;

/// Validate and normalize a requested player name.
///
/// Returns the trimmed name, or `None` when it is empty or longer than 24
/// characters after trimming.
pub fn validate_player_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let len = trimmed.chars().count();
    if (PLAYER_NAME_MIN..=PLAYER_NAME_MAX).contains(&len) {
        Some(trimmed.to_string())
    } else {
        None
    }
}

/// One accepted session.
#[derive(Clone)]
pub struct SessionRecord {
    /// Freshly minted at handshake acceptance; unique across the manager's
    /// lifetime.
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    /// Trimmed display name.
    pub player_name: String,
    pub connection: Arc<dyn Connection>,
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("session_id", &self.session_id)
            .field("connection_id", &self.connection_id)
            .field("player_name", &self.player_name)
            .finish()
    }
}

struct Inner {
    by_connection: HashMap<ConnectionId, SessionRecord>,
    by_session: HashMap<SessionId, ConnectionId>,
    /// Every id ever minted; duplicates are skipped, making ids unique for
    /// the manager's lifetime.
    minted: std::collections::HashSet<SessionId>,
}

/// Capacity-bounded map of connections to sessions.
pub struct SessionManager {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl SessionManager {
    /// Create a manager bounded to `capacity` concurrent sessions.
    /// A zero capacity is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_connection: HashMap::new(),
                by_session: HashMap::new(),
                minted: std::collections::HashSet::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mint a session for `connection`, validating the name and capacity.
    pub fn try_create_session(
        &self,
        connection: Arc<dyn Connection>,
        player_name: &str,
    ) -> Result<SessionRecord, SessionError> {
        let player_name = validate_player_name(player_name).ok_or(SessionError::InvalidName)?;
        let mut inner = lock(&self.inner);
        if inner.by_connection.contains_key(&connection.id()) {
            return Err(SessionError::AlreadyRegistered);
        }
        if inner.by_connection.len() >= self.capacity {
            return Err(SessionError::CapacityExceeded);
        }

        let mut session_id = Uuid::new_v4();
        while !inner.minted.insert(session_id) {
            session_id = Uuid::new_v4();
        }

        let record = SessionRecord {
            session_id,
            connection_id: connection.id(),
            player_name,
            connection,
        };
        inner.by_session.insert(session_id, record.connection_id);
        inner.by_connection.insert(record.connection_id, record.clone());
        Ok(record)
    }

    /// Remove the session bound to `connection_id`, returning it.
    ///
    /// Releases the connection reference; does not disconnect the peer.
    pub fn try_remove_session(&self, connection_id: ConnectionId) -> Option<SessionRecord> {
        let mut inner = lock(&self.inner);
        let record = inner.by_connection.remove(&connection_id)?;
        inner.by_session.remove(&record.session_id);
        Some(record)
    }

    pub fn get_by_connection(&self, connection_id: ConnectionId) -> Option<SessionRecord> {
        lock(&self.inner).by_connection.get(&connection_id).cloned()
    }

    pub fn get_by_session(&self, session_id: SessionId) -> Option<SessionRecord> {
        let inner = lock(&self.inner);
        let connection_id = inner.by_session.get(&session_id)?;
        inner.by_connection.get(connection_id).cloned()
    }

    /// Snapshot of all current sessions, in no particular order.
    pub fn sessions(&self) -> Vec<SessionRecord> {
        lock(&self.inner).by_connection.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).by_connection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Recover from a poisoned mutex: session state has no invalid intermediate
/// states, so the data is still usable.
fn lock(mutex: &Mutex<Inner>) -> std::sync::MutexGuard<'_, Inner> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Client session context ──────────────────────────────────────────

/// The client's view of its own session, shared between the runtime, the
/// handshake handler and command senders.
#[derive(Debug, Default)]
pub struct ClientSessionContext {
    session_id: Mutex<Option<SessionId>>,
}

impl ClientSessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the session id granted by an accepted handshake.
    pub fn set(&self, session_id: SessionId) {
        if let Ok(mut slot) = self.session_id.lock() {
            *slot = Some(session_id);
        }
    }

    /// Forget the session (rejection or disconnect).
    pub fn clear(&self) {
        if let Ok(mut slot) = self.session_id.lock() {
            *slot = None;
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.lock().ok().and_then(|slot| *slot)
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
    use crate::transport::Channel;
    use std::net::SocketAddr;

    #[derive(Debug)]
    struct FakeConnection(ConnectionId);

    impl Connection for FakeConnection {
        fn id(&self) -> ConnectionId {
            self.0
        }
        fn remote_addr(&self) -> SocketAddr {
            "127.0.0.1:7777".parse().unwrap()
        }
        fn send(&self, _payload: &[u8], _channel: Channel) -> Result<(), TransportError> {
            Ok(())
        }
        fn disconnect(&self, _reason: Option<&[u8]>) {}
        fn is_open(&self) -> bool {
            true
        }
    }

    fn conn(id: ConnectionId) -> Arc<dyn Connection> {
        Arc::new(FakeConnection(id))
    }

    #[test]
    fn name_validation_trims_and_bounds() {
        assert_eq!(validate_player_name("  Alice  ").as_deref(), Some("Alice"));
        assert_eq!(validate_player_name(""), None);
        assert_eq!(validate_player_name("   "), None);
        assert_eq!(validate_player_name(&"x".repeat(24)).as_deref(), Some("x".repeat(24).as_str()));
        assert_eq!(validate_player_name(&"x".repeat(25)), None);
    }

    #[test]
    fn capacity_is_enforced() {
        let manager = SessionManager::new(2);
        manager.try_create_session(conn(1), "a").unwrap();
        manager.try_create_session(conn(2), "b").unwrap();
        assert_eq!(
            manager.try_create_session(conn(3), "c").unwrap_err(),
            SessionError::CapacityExceeded
        );
    }

    #[test]
    fn one_session_per_connection() {
        let manager = SessionManager::new(8);
        manager.try_create_session(conn(1), "a").unwrap();
        assert_eq!(
            manager.try_create_session(conn(1), "again").unwrap_err(),
            SessionError::AlreadyRegistered
        );
    }

    #[test]
    fn removal_frees_capacity_and_lookup() {
        let manager = SessionManager::new(1);
        let record = manager.try_create_session(conn(1), "a").unwrap();
        assert!(manager.get_by_session(record.session_id).is_some());

        let removed = manager.try_remove_session(1).unwrap();
        assert_eq!(removed.session_id, record.session_id);
        assert!(manager.get_by_session(record.session_id).is_none());
        assert!(manager.try_create_session(conn(2), "b").is_ok());
    }

    #[test]
    fn session_ids_stay_unique_across_lifetime() {
        let manager = SessionManager::new(4);
        let mut seen = std::collections::HashSet::new();
        for id in 0..20u64 {
            let record = manager.try_create_session(conn(id), "p").unwrap();
            assert!(seen.insert(record.session_id));
            manager.try_remove_session(id);
        }
    }

    #[test]
    fn client_context_set_and_clear() {
        let ctx = ClientSessionContext::new();
        assert_eq!(ctx.session_id(), None);
        let id = Uuid::new_v4();
        ctx.set(id);
        assert_eq!(ctx.session_id(), Some(id));
        ctx.clear();
        assert_eq!(ctx.session_id(), None);
    }
}
