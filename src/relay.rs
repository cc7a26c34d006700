//! Relay fallback: tunnel traffic through a third-party UDP forwarder when
//! neither a direct nor a punched connection is possible.
//!
//! One allocation (HTTP) yields a session id and a relay endpoint; both
//! sides register over UDP (17-byte frame: opcode + session id), wait for
//! the ACK and then exchange application data framed as
//! `{opcode=Data, sessionId, payload}` with a 5-second heartbeat.
//!
//! [`RelayTransport`] wraps the whole tunnel behind the ordinary
//! [`Transport`] seam, and [`RelayConnection`] presents the forwarded peer
//! as an ordinary [`Connection`] — higher layers cannot tell a relayed
//! session from a direct one.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{RelayError, TransportError};
use crate::transport::{
    Channel, Connection, ConnectionId, Transport, TransportEvent, TransportOptions,
};

/// Heartbeat cadence once registered.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

// ── Frame codec ─────────────────────────────────────────────────────

const OP_HOST_REGISTER: u8 = 1;
const OP_CLIENT_REGISTER: u8 = 2;
const OP_DATA: u8 = 3;
const OP_HEARTBEAT: u8 = 4;
const OP_DISCONNECT: u8 = 5;
const OP_ACK: u8 = 10;
const OP_PEER_CONNECTED: u8 = 11;
const OP_PEER_DISCONNECTED: u8 = 12;

/// One datagram on the relay wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    HostRegister { session_id: Uuid },
    ClientRegister { session_id: Uuid },
    Data { session_id: Uuid, payload: Vec<u8> },
    Heartbeat { session_id: Uuid },
    Disconnect { session_id: Uuid },
    Ack { status: u8, message: Option<String> },
    PeerConnected { session_id: Uuid },
    PeerDisconnected { session_id: Uuid },
}

/// Encode a frame to its wire bytes.
pub fn encode_frame(frame: &RelayFrame) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(32);
    match frame {
        RelayFrame::HostRegister { session_id } => {
            buf.put_u8(OP_HOST_REGISTER);
            buf.put_slice(session_id.as_bytes());
        }
        RelayFrame::ClientRegister { session_id } => {
            buf.put_u8(OP_CLIENT_REGISTER);
            buf.put_slice(session_id.as_bytes());
        }
        RelayFrame::Data {
            session_id,
            payload,
        } => {
            buf.put_u8(OP_DATA);
            buf.put_slice(session_id.as_bytes());
            buf.put_slice(payload);
        }
        RelayFrame::Heartbeat { session_id } => {
            buf.put_u8(OP_HEARTBEAT);
            buf.put_slice(session_id.as_bytes());
        }
        RelayFrame::Disconnect { session_id } => {
            buf.put_u8(OP_DISCONNECT);
            buf.put_slice(session_id.as_bytes());
        }
        RelayFrame::Ack { status, message } => {
            buf.put_u8(OP_ACK);
            buf.put_u8(*status);
            if let Some(message) = message {
                buf.put_slice(message.as_bytes());
            }
        }
        RelayFrame::PeerConnected { session_id } => {
            buf.put_u8(OP_PEER_CONNECTED);
            buf.put_slice(session_id.as_bytes());
        }
        RelayFrame::PeerDisconnected { session_id } => {
            buf.put_u8(OP_PEER_DISCONNECTED);
            buf.put_slice(session_id.as_bytes());
        }
    }
    buf.to_vec()
}

fn get_session_id(buf: &mut &[u8]) -> Result<Uuid, RelayError> {
    if buf.remaining() < 16 {
        return Err(RelayError::MalformedFrame);
    }
    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Ok(Uuid::from_bytes(bytes))
}

/// Parse a datagram from the relay wire.
pub fn parse_frame(bytes: &[u8]) -> Result<RelayFrame, RelayError> {
    let mut buf = bytes;
    if buf.remaining() < 1 {
        return Err(RelayError::MalformedFrame);
    }
    let opcode = buf.get_u8();
    match opcode {
        OP_HOST_REGISTER => Ok(RelayFrame::HostRegister {
            session_id: get_session_id(&mut buf)?,
        }),
        OP_CLIENT_REGISTER => Ok(RelayFrame::ClientRegister {
            session_id: get_session_id(&mut buf)?,
        }),
        OP_DATA => {
            let session_id = get_session_id(&mut buf)?;
            Ok(RelayFrame::Data {
                session_id,
                payload: buf.to_vec(),
            })
        }
        OP_HEARTBEAT => Ok(RelayFrame::Heartbeat {
            session_id: get_session_id(&mut buf)?,
        }),
        OP_DISCONNECT => Ok(RelayFrame::Disconnect {
            session_id: get_session_id(&mut buf)?,
        }),
        OP_ACK => {
            if buf.remaining() < 1 {
                return Err(RelayError::MalformedFrame);
            }
            let status = buf.get_u8();
            let message = if buf.has_remaining() {
                String::from_utf8(buf.to_vec()).ok()
            } else {
                None
            };
            Ok(RelayFrame::Ack { status, message })
        }
        OP_PEER_CONNECTED => Ok(RelayFrame::PeerConnected {
            session_id: get_session_id(&mut buf)?,
        }),
        OP_PEER_DISCONNECTED => Ok(RelayFrame::PeerDisconnected {
            session_id: get_session_id(&mut buf)?,
        }),
        _ => Err(RelayError::MalformedFrame),
    }
}

// ── HTTP allocation ─────────────────────────────────────────────────

/// Answer to `GET <base>/api/relay/info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayInfoResponse {
    pub available: bool,
    pub address: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Answer to `POST <base>/api/relay/allocate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayAllocateResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A granted relay session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAllocation {
    pub session_id: Uuid,
    pub relay_address: String,
    pub relay_port: u16,
}

impl RelayAllocation {
    /// The relay's UDP endpoint.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.relay_address, self.relay_port)
            .parse()
            .ok()
    }
}

/// HTTP client for relay allocation.
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    /// Query relay availability.
    pub async fn info(&self) -> Result<RelayInfoResponse, RelayError> {
        let info: RelayInfoResponse = self
            .http
            .get(format!("{}/api/relay/info", self.base_url))
            .send()
            .await?
            .json()
            .await?;
        if !info.available {
            return Err(RelayError::Unavailable(
                info.message.unwrap_or_else(|| "relay offline".to_string()),
            ));
        }
        Ok(info)
    }

    /// Allocate a relay session for `lobby_id`.
    pub async fn allocate(&self, lobby_id: &str) -> Result<RelayAllocation, RelayError> {
        let response: RelayAllocateResponse = self
            .http
            .post(format!("{}/api/relay/allocate", self.base_url))
            .json(&serde_json::json!({ "lobbyId": lobby_id }))
            .send()
            .await?
            .json()
            .await?;
        match (
            response.success,
            response.session_id,
            response.relay_address,
            response.relay_port,
        ) {
            (true, Some(session_id), Some(relay_address), Some(relay_port)) => Ok(RelayAllocation {
                session_id,
                relay_address,
                relay_port,
            }),
            _ => Err(RelayError::AllocateRejected(
                response
                    .message
                    .unwrap_or_else(|| "allocation refused".to_string()),
            )),
        }
    }

    /// Release an allocation, best-effort.
    pub async fn release(&self, session_id: Uuid) {
        let result = self
            .http
            .delete(format!("{}/api/relay/{session_id}", self.base_url))
            .send()
            .await;
        if let Err(error) = result {
            debug!(%error, "relay release failed");
        }
    }
}

// ── Connection ──────────────────────────────────────────────────────

/// The forwarded peer, presented as an ordinary [`Connection`].
pub struct RelayConnection {
    session_id: Uuid,
    relay_addr: SocketAddr,
    socket: Arc<tokio::net::UdpSocket>,
    open: AtomicBool,
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("session_id", &self.session_id)
            .field("relay", &self.relay_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection for RelayConnection {
    fn id(&self) -> ConnectionId {
        self.session_id.as_u64_pair().0
    }

    fn remote_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    fn send(&self, payload: &[u8], _channel: Channel) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Ok(());
        }
        let frame = encode_frame(&RelayFrame::Data {
            session_id: self.session_id,
            payload: payload.to_vec(),
        });
        match self.socket.try_send(&frame) {
            Ok(_) => Ok(()),
            // A full send buffer drops the datagram, as UDP would.
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(error) => Err(TransportError::Send(error.to_string())),
        }
    }

    fn disconnect(&self, _reason: Option<&[u8]>) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let frame = encode_frame(&RelayFrame::Disconnect {
            session_id: self.session_id,
        });
        let _ = self.socket.try_send(&frame);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

// ── Transport ───────────────────────────────────────────────────────

struct RelayState {
    socket: Arc<tokio::net::UdpSocket>,
    frames_rx: mpsc::UnboundedReceiver<RelayFrame>,
    read_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
    connection: Option<Arc<RelayConnection>>,
    is_host: bool,
    relay_addr: SocketAddr,
}

/// A [`Transport`] tunneling one session through a relay server.
///
/// Channel semantics degrade to the relay's single delivery path: outgoing
/// channel choice is accepted but all relayed payloads arrive
/// reliable-ordered. Unconnected messages are unsupported.
pub struct RelayTransport {
    allocation: RelayAllocation,
    state: Option<RelayState>,
}

impl RelayTransport {
    /// Wrap a granted allocation. Host or client role is picked by
    /// `TransportOptions::is_server` at [`start`](Transport::start).
    pub fn new(allocation: RelayAllocation) -> Self {
        Self {
            allocation,
            state: None,
        }
    }

    fn convert(&mut self, frame: RelayFrame) -> Option<TransportEvent> {
        let state = self.state.as_mut()?;
        match frame {
            RelayFrame::Ack { status: 0, .. } => {
                if state.is_host || state.connection.is_some() {
                    debug!("relay registration acknowledged");
                    return None;
                }
                // Client side: the ACK is the connection coming up.
                let connection = Arc::new(RelayConnection {
                    session_id: self.allocation.session_id,
                    relay_addr: state.relay_addr,
                    socket: Arc::clone(&state.socket),
                    open: AtomicBool::new(true),
                });
                state.connection = Some(Arc::clone(&connection));
                Some(TransportEvent::PeerConnected(connection))
            }
            RelayFrame::Ack { status, message } => {
                warn!(status, message = message.as_deref(), "relay rejected registration");
                None
            }
            RelayFrame::PeerConnected { .. } => {
                if state.connection.is_some() {
                    return None;
                }
                let connection = Arc::new(RelayConnection {
                    session_id: self.allocation.session_id,
                    relay_addr: state.relay_addr,
                    socket: Arc::clone(&state.socket),
                    open: AtomicBool::new(true),
                });
                state.connection = Some(Arc::clone(&connection));
                Some(TransportEvent::PeerConnected(connection))
            }
            RelayFrame::PeerDisconnected { .. } | RelayFrame::Disconnect { .. } => {
                let connection = state.connection.take()?;
                connection.open.store(false, Ordering::Release);
                Some(TransportEvent::PeerDisconnected {
                    connection,
                    reason: None,
                })
            }
            RelayFrame::Data { payload, .. } => {
                let connection = state.connection.as_ref()?;
                Some(TransportEvent::PayloadReceived {
                    connection: Arc::clone(connection) as Arc<dyn Connection>,
                    payload,
                    channel: Channel::ReliableOrdered,
                })
            }
            RelayFrame::Heartbeat { .. }
            | RelayFrame::HostRegister { .. }
            | RelayFrame::ClientRegister { .. } => None,
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn start(&mut self, options: TransportOptions) -> Result<(), TransportError> {
        if self.state.is_some() {
            return Err(TransportError::AlreadyRunning);
        }
        let relay_addr = self
            .allocation
            .socket_addr()
            .ok_or_else(|| TransportError::Bind("unparseable relay endpoint".to_string()))?;

        let std_socket = std::net::UdpSocket::bind("0.0.0.0:0")
            .map_err(|e| TransportError::Bind(e.to_string()))?;
        std_socket
            .connect(relay_addr)
            .map_err(|e| TransportError::Bind(e.to_string()))?;
        std_socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::Bind(e.to_string()))?;
        let socket = Arc::new(
            tokio::net::UdpSocket::from_std(std_socket)
                .map_err(|e| TransportError::Bind(e.to_string()))?,
        );

        let session_id = self.allocation.session_id;
        let register = if options.is_server {
            RelayFrame::HostRegister { session_id }
        } else {
            RelayFrame::ClientRegister { session_id }
        };
        socket
            .try_send(&encode_frame(&register))
            .map_err(|e| TransportError::Send(e.to_string()))?;

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let read_socket = Arc::clone(&socket);
        let read_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match read_socket.recv(&mut buf).await {
                    Ok(len) => {
                        let datagram = buf.get(..len).unwrap_or_default();
                        match parse_frame(datagram) {
                            Ok(frame) => {
                                if frames_tx.send(frame).is_err() {
                                    break;
                                }
                            }
                            Err(_) => debug!("dropping malformed relay frame"),
                        }
                    }
                    Err(error) => {
                        debug!(%error, "relay socket read failed");
                        break;
                    }
                }
            }
        });

        let heartbeat_socket = Arc::clone(&socket);
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                let frame = encode_frame(&RelayFrame::Heartbeat { session_id });
                if let Err(error) = heartbeat_socket.try_send(&frame) {
                    if error.kind() != std::io::ErrorKind::WouldBlock {
                        debug!(%error, "relay heartbeat failed");
                        break;
                    }
                }
            }
        });

        debug!(%session_id, relay = %relay_addr, is_host = options.is_server, "relay transport registered");
        self.state = Some(RelayState {
            socket,
            frames_rx,
            read_task,
            heartbeat_task,
            connection: None,
            is_host: options.is_server,
            relay_addr,
        });
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        let mut frames = Vec::new();
        {
            let Some(state) = self.state.as_mut() else {
                return events;
            };
            if timeout > Duration::ZERO {
                match tokio::time::timeout(timeout, state.frames_rx.recv()).await {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) | Err(_) => {}
                }
            }
            while let Ok(frame) = state.frames_rx.try_recv() {
                frames.push(frame);
            }
        }
        for frame in frames {
            if let Some(event) = self.convert(frame) {
                events.push(event);
            }
        }
        events
    }

    fn shutdown(&mut self, _reason: Option<&[u8]>) {
        let Some(state) = self.state.take() else {
            return;
        };
        if let Some(connection) = &state.connection {
            connection.open.store(false, Ordering::Release);
        }
        let frame = encode_frame(&RelayFrame::Disconnect {
            session_id: self.allocation.session_id,
        });
        let _ = state.socket.try_send(&frame);
        state.read_task.abort();
        state.heartbeat_task.abort();
        debug!("relay transport shut down");
    }

    fn is_running(&self) -> bool {
        self.state.is_some()
    }

    fn send_unconnected(&self, _target: SocketAddr, _payload: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::Send(
            "unconnected messages are not supported over a relay".to_string(),
        ))
    }

    fn nat_introduce(&self, _punch_server: SocketAddr, _token: &str) -> Result<(), TransportError> {
        // A relayed session needs no punching.
        Ok(())
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

    #[test]
    fn register_frame_is_seventeen_bytes() {
        let session_id = Uuid::new_v4();
        let host = encode_frame(&RelayFrame::HostRegister { session_id });
        let client = encode_frame(&RelayFrame::ClientRegister { session_id });
        assert_eq!(host.len(), 17);
        assert_eq!(client.len(), 17);
        assert_eq!(host[0], 1);
        assert_eq!(client[0], 2);
    }

    #[test]
    fn data_frame_round_trips() {
        let session_id = Uuid::from_u128(42);
        let frame = RelayFrame::Data {
            session_id,
            payload: b"note chart".to_vec(),
        };
        let parsed = parse_frame(&encode_frame(&frame)).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn ack_with_message_round_trips() {
        let frame = RelayFrame::Ack {
            status: 1,
            message: Some("session unknown".into()),
        };
        let parsed = parse_frame(&encode_frame(&frame)).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn ack_without_message_round_trips() {
        let frame = RelayFrame::Ack {
            status: 0,
            message: None,
        };
        assert_eq!(parse_frame(&encode_frame(&frame)).unwrap(), frame);
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(matches!(parse_frame(&[]), Err(RelayError::MalformedFrame)));
        assert!(matches!(
            parse_frame(&[OP_DATA, 1, 2, 3]),
            Err(RelayError::MalformedFrame)
        ));
        assert!(matches!(
            parse_frame(&[99]),
            Err(RelayError::MalformedFrame)
        ));
    }
}
