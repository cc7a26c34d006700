//! Error types for the yargnet networking core.
//!
//! Each subsystem owns its own error enum rather than sharing one crate-wide
//! type: transport failures, handshake rejections, session/lobby rule
//! violations and rendezvous-plane failures propagate differently (§ error
//! handling in the crate docs), so collapsing them would lose that policy.

use thiserror::Error;

use crate::protocol::PROTOCOL_VERSION;

/// Errors raised by a [`Transport`](crate::transport::Transport)
/// implementation or by code driving one.
#[derive(Debug, Error)]
pub enum TransportError {
    /// `start` was called on a transport that is already bound.
    #[error("transport is already running")]
    AlreadyRunning,

    /// The underlying socket could not be bound.
    #[error("failed to bind transport socket: {0}")]
    Bind(String),

    /// An operation that requires a bound transport was invoked before
    /// `start` (or after `shutdown`).
    #[error("transport is not running")]
    NotRunning,

    /// A payload could not be handed to the underlying socket.
    #[error("transport send error: {0}")]
    Send(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a server rejects a handshake.
///
/// The [`reject_reason`](HandshakeError::reject_reason) string is what goes
/// on the wire inside the `HandshakeResponse` envelope; the `Display` form is
/// for logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The client speaks a different protocol version.
    #[error("protocol mismatch: client sent {client_version:?}")]
    ProtocolMismatch {
        /// Version string the client presented.
        client_version: String,
    },

    /// The player name failed validation (empty after trim, or too long).
    #[error("invalid player name")]
    InvalidPlayerName,

    /// The session manager is at capacity.
    #[error("server is full")]
    ServerFull,

    /// The supplied password did not match the configured one.
    #[error("invalid password")]
    InvalidPassword,

    /// A session already exists for this connection.
    #[error("connection already registered")]
    AlreadyRegistered,

    /// The peer never sent a `HandshakeRequest` within the hello window.
    #[error("handshake timed out")]
    Timeout,
}

impl HandshakeError {
    /// The human-readable reason carried in the reject envelope.
    pub fn reject_reason(&self) -> String {
        match self {
            Self::ProtocolMismatch { .. } => {
                format!("Protocol mismatch: expected {PROTOCOL_VERSION}")
            }
            Self::InvalidPlayerName => "Invalid player name.".to_string(),
            Self::ServerFull => "Server is full.".to_string(),
            Self::InvalidPassword => "Invalid password.".to_string(),
            Self::AlreadyRegistered => "Connection already registered.".to_string(),
            Self::Timeout => "Handshake timed out.".to_string(),
        }
    }
}

/// Errors from [`SessionManager`](crate::session::SessionManager) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The configured session capacity has been reached.
    #[error("session capacity exceeded")]
    CapacityExceeded,

    /// A session already exists for this connection.
    #[error("connection already has a session")]
    AlreadyRegistered,

    /// The player name failed validation.
    #[error("invalid player name")]
    InvalidName,

    /// No session exists for the given id.
    #[error("unknown session")]
    Unknown,
}

/// Errors from [`LobbyManager`](crate::lobby::LobbyManager) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LobbyError {
    /// The lobby has reached its configured player cap.
    #[error("lobby is full")]
    LobbyFull,

    /// The referenced session is not known to the session manager.
    #[error("unknown session")]
    SessionUnknown,

    /// The session already has a lobby membership.
    #[error("player is already a lobby member")]
    AlreadyMember,

    /// The referenced player is not in the lobby.
    #[error("unknown player")]
    PlayerUnknown,

    /// Spectators have no readiness state.
    #[error("spectators cannot set readiness")]
    SpectatorCannotReady,

    /// The song id was empty after trimming.
    #[error("empty song id")]
    EmptySongId,
}

/// Errors from the HTTP lobby directory client.
///
/// Transient variants are logged and retried by the heartbeat/poll loops and
/// never surface past them.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The HTTP request itself failed (connect, timeout, body).
    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The directory answered with a non-success status.
    #[error("directory returned HTTP {0}")]
    Status(u16),
}

/// Errors from the NAT punch-through client.
#[derive(Debug, Error)]
pub enum PunchError {
    /// The punch server reports itself unavailable.
    #[error("punch server unavailable: {0}")]
    Unavailable(String),

    /// The HTTP signaling request failed.
    #[error("punch request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The punch server refused the request.
    #[error("punch request rejected: {0}")]
    Rejected(String),
}

/// Errors from the relay fallback client.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay server reports itself unavailable.
    #[error("relay server unavailable: {0}")]
    Unavailable(String),

    /// The allocation HTTP call failed.
    #[error("relay allocation failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The relay refused the allocation.
    #[error("relay allocation rejected: {0}")]
    AllocateRejected(String),

    /// The relay NAKed (or never ACKed) the UDP registration.
    #[error("relay registration failed: {0}")]
    Registration(String),

    /// A malformed relay frame was received.
    #[error("malformed relay frame")]
    MalformedFrame,

    /// The relay connection is closed.
    #[error("relay connection closed")]
    Closed,

    /// An I/O error occurred on the relay socket.
    #[error("relay I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the client runtime.
#[derive(Debug, Error)]
pub enum ClientError {
    /// `connect` was called while another connect attempt is in flight.
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,

    /// The client is already connected.
    #[error("already connected")]
    AlreadyConnected,

    /// The connection attempt did not complete within the deadline.
    #[error("connection attempt timed out")]
    Timeout,

    /// The connection closed before the attempt completed.
    #[error("connection closed during connect")]
    ConnectFailed,

    /// The connection attempt was cancelled.
    #[error("connection attempt cancelled")]
    Cancelled,

    /// No active session; the command requires an accepted handshake.
    #[error("no active session")]
    NoActiveSession,

    /// A transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
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

    #[test]
    fn reject_reason_names_expected_version() {
        let err = HandshakeError::ProtocolMismatch {
            client_version: "0.0.1".into(),
        };
        assert_eq!(
            err.reject_reason(),
            format!("Protocol mismatch: expected {PROTOCOL_VERSION}")
        );
    }

    #[test]
    fn reject_reasons_are_wire_stable() {
        assert_eq!(HandshakeError::ServerFull.reject_reason(), "Server is full.");
        assert_eq!(
            HandshakeError::InvalidPassword.reject_reason(),
            "Invalid password."
        );
        assert_eq!(
            HandshakeError::AlreadyRegistered.reject_reason(),
            "Connection already registered."
        );
    }
}
