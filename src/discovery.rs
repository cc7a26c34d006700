//! LAN discovery: advertise and find lobbies on the local network.
//!
//! Requests and responses ride as unconnected UDP datagrams. Both start with
//! the 8-byte magic `"YARGNET!"` and a message type byte; a response then
//! carries the lobby description as big-endian, length-prefixed fields.
//! Fields past `playerInstruments` are optional trailing extensions: old
//! peers simply stop writing, new parsers read them iff bytes remain.
//!
//! Hosts answer requests inside the server poll loop; clients feed responses
//! into a [`DiscoveryManager`], which tracks last-seen times and reports
//! discovered/updated/lost transitions against a TTL.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use crate::error::TransportError;
use crate::transport::Transport;

/// `"YARGNET!"` in big-endian.
pub const DISCOVERY_MAGIC: u64 = 0x5941_5247_4E45_5421;

const MSG_REQUEST: u8 = 0x01;
const MSG_RESPONSE: u8 = 0x02;

// ── Wire descriptor ─────────────────────────────────────────────────

/// A lobby as described on the discovery wire.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DiscoveredLobbyInfo {
    pub lobby_id: String,
    pub lobby_name: String,
    pub host_name: String,
    pub current_players: i32,
    pub max_players: i32,
    pub has_password: bool,
    pub privacy_mode: i32,
    pub port: i32,
    pub public_port: i32,
    pub public_address: String,
    pub transport_id: String,
    pub player_names: Vec<String>,
    pub player_instruments: Vec<i32>,
    // Trailing extension fields; defaults apply when an older host omits
    // them.
    pub no_fail_mode: bool,
    pub shared_songs_only: bool,
    pub band_size: i32,
    pub allowed_game_modes: Vec<i32>,
    pub session_type: i32,
    pub is_dedicated_server: bool,
}

// ── Encoding ────────────────────────────────────────────────────────

fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_i32(value.len() as i32);
    buf.put_slice(value.as_bytes());
}

fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Build a discovery request datagram.
pub fn encode_request() -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u64(DISCOVERY_MAGIC);
    buf.put_u8(MSG_REQUEST);
    buf.to_vec()
}

/// Build a discovery response datagram for `info`, trailing fields included.
pub fn encode_response(info: &DiscoveredLobbyInfo) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_u64(DISCOVERY_MAGIC);
    buf.put_u8(MSG_RESPONSE);

    put_str(&mut buf, &info.lobby_id);
    put_str(&mut buf, &info.lobby_name);
    put_str(&mut buf, &info.host_name);
    buf.put_i32(info.current_players);
    buf.put_i32(info.max_players);
    put_bool(&mut buf, info.has_password);
    buf.put_i32(info.privacy_mode);
    buf.put_i32(info.port);
    buf.put_i32(info.public_port);
    put_str(&mut buf, &info.public_address);
    put_str(&mut buf, &info.transport_id);
    buf.put_i32(info.player_names.len() as i32);
    for name in &info.player_names {
        put_str(&mut buf, name);
    }
    buf.put_i32(info.player_instruments.len() as i32);
    for instrument in &info.player_instruments {
        buf.put_i32(*instrument);
    }

    // Trailing extension block.
    put_bool(&mut buf, info.no_fail_mode);
    put_bool(&mut buf, info.shared_songs_only);
    buf.put_i32(info.band_size);
    buf.put_i32(info.allowed_game_modes.len() as i32);
    for mode in &info.allowed_game_modes {
        buf.put_i32(*mode);
    }
    buf.put_i32(info.session_type);
    put_bool(&mut buf, info.is_dedicated_server);

    buf.to_vec()
}

// ── Parsing ─────────────────────────────────────────────────────────

fn get_u8(buf: &mut &[u8]) -> Option<u8> {
    if buf.remaining() < 1 {
        return None;
    }
    Some(buf.get_u8())
}

fn get_bool(buf: &mut &[u8]) -> Option<bool> {
    get_u8(buf).map(|b| b != 0)
}

fn get_i32(buf: &mut &[u8]) -> Option<i32> {
    if buf.remaining() < 4 {
        return None;
    }
    Some(buf.get_i32())
}

fn get_str(buf: &mut &[u8]) -> Option<String> {
    let len = get_i32(buf)?;
    if len < 0 {
        return None;
    }
    let len = len as usize;
    if buf.remaining() < len {
        return None;
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).ok()
}

fn get_header(buf: &mut &[u8]) -> Option<u8> {
    if buf.remaining() < 9 {
        return None;
    }
    if buf.get_u64() != DISCOVERY_MAGIC {
        return None;
    }
    Some(buf.get_u8())
}

/// Validate a discovery request header. Returns `Some(())` iff `bytes` is a
/// well-formed request.
pub fn parse_request(bytes: &[u8]) -> Option<()> {
    let mut buf = bytes;
    (get_header(&mut buf)? == MSG_REQUEST).then_some(())
}

/// Parse a discovery response into its lobby descriptor.
///
/// The trailing extension block is read iff bytes remain past the
/// `playerInstruments` field; absent trailing fields keep their defaults.
pub fn parse_response(bytes: &[u8]) -> Option<DiscoveredLobbyInfo> {
    let mut buf = bytes;
    if get_header(&mut buf)? != MSG_RESPONSE {
        return None;
    }

    let mut info = DiscoveredLobbyInfo {
        lobby_id: get_str(&mut buf)?,
        lobby_name: get_str(&mut buf)?,
        host_name: get_str(&mut buf)?,
        current_players: get_i32(&mut buf)?,
        max_players: get_i32(&mut buf)?,
        has_password: get_bool(&mut buf)?,
        privacy_mode: get_i32(&mut buf)?,
        port: get_i32(&mut buf)?,
        public_port: get_i32(&mut buf)?,
        public_address: get_str(&mut buf)?,
        transport_id: get_str(&mut buf)?,
        ..DiscoveredLobbyInfo::default()
    };

    let name_count = get_i32(&mut buf)?;
    if name_count < 0 {
        return None;
    }
    for _ in 0..name_count {
        info.player_names.push(get_str(&mut buf)?);
    }
    let instrument_count = get_i32(&mut buf)?;
    if instrument_count < 0 {
        return None;
    }
    for _ in 0..instrument_count {
        info.player_instruments.push(get_i32(&mut buf)?);
    }

    if buf.has_remaining() {
        info.no_fail_mode = get_bool(&mut buf)?;
        info.shared_songs_only = get_bool(&mut buf)?;
        info.band_size = get_i32(&mut buf)?;
        let mode_count = get_i32(&mut buf)?;
        if mode_count < 0 {
            return None;
        }
        for _ in 0..mode_count {
            info.allowed_game_modes.push(get_i32(&mut buf)?);
        }
        info.session_type = get_i32(&mut buf)?;
        info.is_dedicated_server = get_bool(&mut buf)?;
    }

    Some(info)
}

/// Send a discovery request to `target` (unicast or the broadcast address).
pub fn send_request<T: Transport>(transport: &T, target: SocketAddr) -> Result<(), TransportError> {
    transport.send_unconnected(target, &encode_request())
}

// ── Host-side responder ─────────────────────────────────────────────

type AdvertisedInfoProvider = Box<dyn Fn() -> DiscoveredLobbyInfo + Send + Sync>;

/// Answers discovery requests on behalf of a host.
///
/// Owns a provider for the lobby's current advertisable description, so
/// every response reflects live membership. The server poll loop feeds it
/// each unconnected datagram and sends back whatever it returns; anything
/// that is not a well-formed request yields `None` and is dropped.
pub struct DiscoveryResponder {
    provider: AdvertisedInfoProvider,
}

impl DiscoveryResponder {
    pub fn new(provider: AdvertisedInfoProvider) -> Self {
        Self { provider }
    }

    /// Validate a request datagram and build the matching response.
    pub fn respond(&self, request: &[u8]) -> Option<Vec<u8>> {
        parse_request(request)?;
        Some(encode_response(&(self.provider)()))
    }
}

// ── Client-side cache ───────────────────────────────────────────────

/// Transition reported by the [`DiscoveryManager`].
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// First sighting of this lobby.
    Discovered(DiscoveredLobbyInfo),
    /// A known lobby re-advertised with different contents.
    Updated(DiscoveredLobbyInfo),
    /// A known lobby has not advertised within the TTL.
    Lost { lobby_id: String },
}

struct CacheEntry {
    info: DiscoveredLobbyInfo,
    last_seen: Instant,
}

impl CacheEntry {
    fn is_active(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.last_seen) < ttl
    }
}

/// Tracks lobbies seen on the LAN and their freshness.
pub struct DiscoveryManager {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl DiscoveryManager {
    /// Create a cache evicting lobbies not seen within `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record a discovery response. Returns the transition it caused, if
    /// any; a re-advertisement with identical contents only refreshes the
    /// last-seen time.
    pub fn observe(&self, info: DiscoveredLobbyInfo, now: Instant) -> Option<DiscoveryEvent> {
        let Ok(mut entries) = self.entries.lock() else {
            return None;
        };
        match entries.get_mut(&info.lobby_id) {
            Some(entry) => {
                entry.last_seen = now;
                if entry.info == info {
                    None
                } else {
                    entry.info = info.clone();
                    debug!(lobby_id = %info.lobby_id, "lobby updated");
                    Some(DiscoveryEvent::Updated(info))
                }
            }
            None => {
                debug!(lobby_id = %info.lobby_id, name = %info.lobby_name, "lobby discovered");
                entries.insert(
                    info.lobby_id.clone(),
                    CacheEntry {
                        info: info.clone(),
                        last_seen: now,
                    },
                );
                Some(DiscoveryEvent::Discovered(info))
            }
        }
    }

    /// Evict entries older than the TTL, reporting each loss.
    pub fn evict_expired(&self, now: Instant) -> Vec<DiscoveryEvent> {
        let Ok(mut entries) = self.entries.lock() else {
            return Vec::new();
        };
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_active(self.ttl, now))
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .map(|lobby_id| {
                entries.remove(&lobby_id);
                debug!(%lobby_id, "lobby lost");
                DiscoveryEvent::Lost { lobby_id }
            })
            .collect()
    }

    /// All currently active lobbies.
    pub fn lobbies(&self, now: Instant) -> Vec<DiscoveredLobbyInfo> {
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        entries
            .values()
            .filter(|entry| entry.is_active(self.ttl, now))
            .map(|entry| entry.info.clone())
            .collect()
    }
}
