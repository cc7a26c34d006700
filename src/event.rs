//! Events surfaced by the client runtime.
//!
//! The embedding UI consumes these from the receiver returned by
//! [`ClientRuntime::connect`](crate::client::ClientRuntime::connect); they
//! are the only way user-visible failures and lobby changes leave the
//! networking core.

use crate::protocol::{LobbyInvite, LobbyStateSnapshot, SessionId};

/// Typed event stream from the client runtime to the embedding application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The transport-level connection to the server is up; the handshake is
    /// in flight.
    Connected,
    /// The server accepted the handshake and granted a session.
    HandshakeAccepted { session_id: SessionId },
    /// The server rejected the handshake; the connection is going away.
    HandshakeRejected { reason: String },
    /// A lobby snapshot that differs from the previously seen one.
    LobbyUpdated(LobbyStateSnapshot),
    /// The server forwarded an invite to this client.
    InviteReceived(LobbyInvite),
    /// Pre-game countdown tick (5 → 0).
    CountdownTick { seconds_remaining: u8 },
    /// Countdown finished; start playing `song_id`.
    GameplayStarted { song_id: String },
    /// Another player's gameplay state frame.
    GameplayStateReceived { session_id: SessionId, frame: Vec<u8> },
    /// Another player's song-clock sample.
    TimeSyncReceived {
        session_id: SessionId,
        song_time_millis: u64,
    },
    /// The host paused or resumed the song.
    GameplayPaused {
        paused: bool,
        song_time_millis: u64,
    },
    /// The song ended.
    GameplayEnded { aborted: bool },
    /// A peer asked this client to stream its replay data.
    ReplaySyncRequested { session_id: SessionId },
    /// A replay chunk from a peer.
    ReplayChunkReceived {
        session_id: SessionId,
        chunk_index: u32,
        data: Vec<u8>,
    },
    /// A peer finished streaming replay data.
    ReplaySyncCompleted {
        session_id: SessionId,
        chunk_count: u32,
    },
    /// Updated round-trip estimate to the server.
    LatencyUpdated { millis: u32 },
    /// The connection is gone; always the final event.
    Disconnected { reason: Option<String> },
}
