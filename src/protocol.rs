//! Wire types for the yargnet packet protocol.
//!
//! Every packet on the wire is a [`PacketEnvelope`] — a `(type, version,
//! payload)` triple serialized as JSON with camelCase property names, enums
//! as strings and `null` fields omitted. The `type` tag is always readable
//! before the payload is bound, which is what lets the dispatcher peek it.
//!
//! Binary blobs (gameplay frames, replay chunks) ride inside the JSON as
//! `serde_bytes` fields; the envelope itself stays text.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Type aliases ────────────────────────────────────────────────────

/// Unique identifier for sessions (and lobby players — a lobby player id *is*
/// its session id).
pub type SessionId = Uuid;

/// Unique identifier for lobbies, stable per lobby lifetime.
pub type LobbyId = Uuid;

/// The protocol version compared verbatim during handshake.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

// ── Packet types ────────────────────────────────────────────────────

/// Closed enumeration of every packet the dispatcher can route.
///
/// Serialized as the variant name string (e.g. `"HandshakeRequest"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    HandshakeRequest,
    HandshakeResponse,
    Heartbeat,
    LobbyState,
    LobbyInvite,
    LobbyReadyState,
    SongSelection,
    GameplayCountdown,
    GameplayStart,
    GameplayState,
    GameplayTimeSync,
    GameplayPause,
    GameplayEnd,
    ReplaySyncRequest,
    ReplaySyncData,
    ReplaySyncComplete,
}

// ── Envelope ────────────────────────────────────────────────────────

/// A single packet: type tag, protocol version and typed payload.
///
/// Construct with [`PacketEnvelope::new`], which stamps the current
/// [`PROTOCOL_VERSION`]; the type tag must equal the handler key the payload
/// type was registered under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketEnvelope<T> {
    /// Packet type tag, used by the dispatcher to pick a handler.
    #[serde(rename = "type")]
    pub packet_type: PacketType,
    /// Protocol version of the sender.
    pub version: String,
    /// The typed payload.
    pub payload: T,
}

impl<T> PacketEnvelope<T> {
    /// Wrap `payload` in an envelope stamped with the current protocol version.
    pub fn new(packet_type: PacketType, payload: T) -> Self {
        Self {
            packet_type,
            version: PROTOCOL_VERSION.to_string(),
            payload,
        }
    }
}

// ── Handshake payloads ──────────────────────────────────────────────

/// First packet a client sends after the transport connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    /// Client's protocol version, compared verbatim against [`PROTOCOL_VERSION`].
    pub client_version: String,
    /// Requested display name, trimmed and length-checked by the server.
    pub player_name: String,
    /// Lobby password, required when the server has one configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Server's answer to a [`HandshakeRequest`].
///
/// Exactly one response is sent per handshake: accepted with a session id, or
/// rejected with a reason followed by a disconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Keep-alive exchanged while a session is idle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Sender's monotonic-ish clock, echoed back for RTT estimation.
    pub client_time_millis: u64,
}

// ── Lobby wire types ────────────────────────────────────────────────

/// Role of a player inside a lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerRole {
    /// The member with authority to pick a song and start the game.
    Host,
    /// An ordinary playing member.
    Member,
    /// A non-playing observer; never ready, never assigned an instrument.
    Spectator,
}

/// A player as seen in a lobby snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyPlayer {
    /// Equal to the player's session id.
    pub player_id: SessionId,
    pub display_name: String,
    pub role: PlayerRole,
    pub is_ready: bool,
}

/// One instrument/difficulty pick inside a song selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentAssignment {
    pub player_id: SessionId,
    pub instrument: String,
    pub difficulty: String,
}

/// The host's current song pick plus per-player instrument assignments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongSelectionState {
    /// Trimmed, non-empty song identifier.
    pub song_id: String,
    /// Ordered assignments; no duplicate `(playerId, instrument)` pairs, no
    /// spectators, no unknown players.
    pub assignments: Vec<InstrumentAssignment>,
    /// True when every non-spectator member is ready.
    pub all_ready: bool,
}

/// Lobby lifecycle status, derived from membership/selection/readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LobbyStatus {
    /// No song selection exists.
    Idle,
    /// A selection exists but not all members are ready.
    SelectingSong,
    /// Every non-spectator member is ready.
    ReadyToPlay,
    /// The coordinator is counting down to game start.
    Countdown,
    /// Gameplay is in progress.
    InGame,
}

/// Immutable view of the lobby, broadcast to every member.
///
/// Structural equality is load-bearing: the coordinator compares consecutive
/// snapshots to suppress duplicate broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyStateSnapshot {
    pub lobby_id: LobbyId,
    /// Players ordered by join time.
    pub players: Vec<LobbyPlayer>,
    pub status: LobbyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<SongSelectionState>,
}

/// Invitation to join a lobby, forwarded by the server to a target session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyInvite {
    pub lobby_id: LobbyId,
    pub target_session_id: SessionId,
    pub inviter_name: String,
    /// Address the invited client should connect to.
    pub address: String,
    pub port: u16,
    /// Introducer lobby code, when the host has minted one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// A client toggling its own readiness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyReadyState {
    pub session_id: SessionId,
    pub is_ready: bool,
}

/// The host submitting a new song selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongSelection {
    pub session_id: SessionId,
    pub state: SongSelectionState,
}

// ── Gameplay payloads ───────────────────────────────────────────────

/// One tick of the pre-game countdown, emitted by the server at 1 Hz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameplayCountdown {
    pub seconds_remaining: u8,
}

/// The countdown reached zero; everyone starts the selected song.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameplayStart {
    pub song_id: String,
}

/// An opaque gameplay state frame, relayed to every other session on the
/// reliable-sequenced channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameplayState {
    pub session_id: SessionId,
    /// Engine-defined frame blob; the core never inspects it.
    #[serde(with = "serde_bytes")]
    pub frame: Vec<u8>,
}

/// Song-clock synchronization sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameplayTimeSync {
    pub session_id: SessionId,
    pub song_time_millis: u64,
}

/// Host pausing or resuming the song.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameplayPause {
    pub session_id: SessionId,
    pub paused: bool,
    pub song_time_millis: u64,
}

/// Host ending the song (completed or aborted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameplayEnd {
    pub session_id: SessionId,
    pub aborted: bool,
}

// ── Replay sync payloads ────────────────────────────────────────────

/// Ask a peer to stream its replay data for the finished song.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySyncRequest {
    pub session_id: SessionId,
}

/// One chunk of replay data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySyncData {
    pub session_id: SessionId,
    pub chunk_index: u32,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Replay stream finished; `chunk_count` chunks were sent in total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySyncComplete {
    pub session_id: SessionId,
    pub chunk_count: u32,
}
