//! The client runtime.
//!
//! Wraps a [`Transport`] in client mode: connects, writes the handshake the
//! moment the peer comes up, dispatches inbound packets on a cooperative
//! poll loop and surfaces everything user-visible as [`ClientEvent`]s on the
//! receiver returned from [`ClientRuntime::connect`].
//!
//! The poll loop also sends heartbeats while idle and enforces the
//! handshake-response timeout; both the connect attempt and the loop itself
//! honor cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatcher::{EndpointRole, HandlerContext, PacketDispatcher};
use crate::error::ClientError;
use crate::event::ClientEvent;
use crate::handshake::{ClientHandshake, ClientHandshakeOutcome};
use crate::lobby_client::{ClientLobbyCommandSender, ClientLobbyStateHandler};
use crate::protocol::{
    GameplayCountdown, GameplayEnd, GameplayPause, GameplayStart, GameplayState, GameplayTimeSync,
    HandshakeResponse, Heartbeat, LobbyInvite, LobbyStateSnapshot, PacketEnvelope, PacketType,
    ReplaySyncComplete, ReplaySyncData, ReplaySyncRequest, SessionId, SongSelectionState,
};
use crate::punch::PunchTicket;
use crate::serializer;
use crate::session::ClientSessionContext;
use crate::transport::{Channel, Connection, Transport, TransportEvent, TransportOptions};

/// Configuration for a [`ClientRuntime`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Display name presented in the handshake.
    pub player_name: String,
    /// Lobby password, when the host requires one.
    pub password: Option<String>,
    /// How long `connect` waits for the transport-level connection.
    pub connect_timeout: Duration,
    /// Poll loop frame budget.
    pub poll_interval: Duration,
    /// Capacity of the bounded event channel. When the consumer cannot keep
    /// up, events are dropped (with a warning) — except `Disconnected`,
    /// which is always delivered.
    pub event_capacity: usize,
    /// Idle keep-alive interval.
    pub heartbeat_interval: Duration,
}

impl ClientConfig {
    pub fn new(player_name: impl Into<String>) -> Self {
        Self {
            player_name: player_name.into(),
            password: None,
            connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(33),
            event_capacity: 256,
            heartbeat_interval: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

/// State shared between the runtime handle, the dispatcher handlers and the
/// poll loop.
struct ClientShared {
    config: ClientConfig,
    dispatcher: PacketDispatcher,
    context: Arc<ClientSessionContext>,
    handshake: ClientHandshake,
    lobby: ClientLobbyStateHandler,
    /// The current server connection, while one exists.
    connection: Mutex<Option<Arc<dyn Connection>>>,
    /// Reason to hand the transport on graceful shutdown.
    shutdown_reason: Mutex<Option<String>>,
    /// Millisecond clock origin for heartbeat RTT estimation.
    epoch: Instant,
}

impl ClientShared {
    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn current_connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Client-side runtime handle.
pub struct ClientRuntime<T: Transport> {
    shared: Arc<ClientShared>,
    commands: ClientLobbyCommandSender,
    transport: Option<T>,
    task: Option<JoinHandle<T>>,
    cancel: CancellationToken,
    connecting: Arc<AtomicBool>,
}

impl<T: Transport> ClientRuntime<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        let context = Arc::new(ClientSessionContext::new());
        let shared = Arc::new(ClientShared {
            handshake: ClientHandshake::new(
                Arc::clone(&context),
                config.player_name.clone(),
                config.password.clone(),
            ),
            config,
            dispatcher: PacketDispatcher::new(),
            context: Arc::clone(&context),
            lobby: ClientLobbyStateHandler::new(),
            connection: Mutex::new(None),
            shutdown_reason: Mutex::new(None),
            epoch: Instant::now(),
        });
        Self {
            shared,
            commands: ClientLobbyCommandSender::new(context),
            transport: Some(transport),
            task: None,
            cancel: CancellationToken::new(),
            connecting: Arc::new(AtomicBool::new(false)),
        }
    }

    // ── Connecting ──────────────────────────────────────────────────

    /// Connect to a server and return the event receiver.
    ///
    /// Resolves once the transport reports the peer connected (the handshake
    /// continues asynchronously; watch for `HandshakeAccepted`). Rejects on
    /// cancellation, transport failure or timeout. Concurrent calls fail
    /// with [`ClientError::AlreadyConnecting`].
    pub async fn connect(
        &mut self,
        address: impl Into<String>,
        port: u16,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ClientEvent>, ClientError> {
        self.connect_inner(address.into(), port, None, cancel).await
    }

    /// Connect to a NAT-punched endpoint: the introduce request is written
    /// through the transport right after it starts, then the connection
    /// proceeds normally against the punched address.
    pub async fn connect_punched(
        &mut self,
        address: impl Into<String>,
        port: u16,
        ticket: PunchTicket,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ClientEvent>, ClientError> {
        self.connect_inner(address.into(), port, Some(ticket), cancel)
            .await
    }

    async fn connect_inner(
        &mut self,
        address: String,
        port: u16,
        ticket: Option<PunchTicket>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ClientEvent>, ClientError> {
        if self.connecting.swap(true, Ordering::AcqRel) {
            return Err(ClientError::AlreadyConnecting);
        }
        let result = self.do_connect(address, port, ticket, cancel).await;
        self.connecting.store(false, Ordering::Release);
        result
    }

    async fn do_connect(
        &mut self,
        address: String,
        port: u16,
        ticket: Option<PunchTicket>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ClientEvent>, ClientError> {
        if self.task.is_some() {
            return Err(ClientError::AlreadyConnected);
        }
        let mut transport = self.transport.take().ok_or(ClientError::AlreadyConnected)?;
        if let Err(error) = transport.start(TransportOptions::client(address, port)) {
            self.transport = Some(transport);
            return Err(error.into());
        }
        if let Some(ticket) = ticket {
            if let Err(error) = transport.nat_introduce(ticket.punch_server, &ticket.token) {
                warn!(%error, "nat introduce failed");
            }
        }

        let (event_tx, event_rx) = mpsc::channel(self.shared.config.event_capacity.max(1));
        let (connected_tx, connected_rx) = oneshot::channel::<()>();
        register_client_handlers(&self.shared, &event_tx);

        self.cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(
            transport,
            Arc::clone(&self.shared),
            event_tx,
            connected_tx,
            self.cancel.clone(),
        ));
        self.task = Some(task);

        let timeout = self.shared.config.connect_timeout;
        tokio::select! {
            _ = cancel.cancelled() => {
                self.teardown().await;
                Err(ClientError::Cancelled)
            }
            result = tokio::time::timeout(timeout, connected_rx) => match result {
                Ok(Ok(())) => Ok(event_rx),
                Ok(Err(_)) => {
                    self.teardown().await;
                    Err(ClientError::ConnectFailed)
                }
                Err(_) => {
                    self.teardown().await;
                    Err(ClientError::Timeout)
                }
            }
        }
    }

    /// Disconnect, optionally with a UTF-8 reason for the peer, and await
    /// the poll loop. Idempotent.
    pub async fn disconnect(&mut self, reason: Option<&str>) {
        if let Ok(mut slot) = self.shared.shutdown_reason.lock() {
            *slot = reason.map(str::to_string);
        }
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(transport) => self.transport = Some(transport),
                Err(error) => warn!(%error, "client poll loop terminated abnormally"),
            }
        }
        self.shared.context.clear();
        self.shared.lobby.reset();
        if let Ok(mut slot) = self.shared.connection.lock() {
            *slot = None;
        }
    }

    // ── State accessors ─────────────────────────────────────────────

    /// The session id granted by the server, once the handshake is accepted.
    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.context.session_id()
    }

    /// The most recently received lobby snapshot.
    pub fn latest_lobby(&self) -> Option<LobbyStateSnapshot> {
        self.shared.lobby.latest()
    }

    /// Whether a server connection currently exists.
    pub fn is_connected(&self) -> bool {
        self.shared
            .current_connection()
            .is_some_and(|c| c.is_open())
    }

    // ── Lobby commands ──────────────────────────────────────────────

    /// Toggle this player's readiness.
    pub fn set_ready(&self, is_ready: bool) -> Result<(), ClientError> {
        let connection = self
            .shared
            .current_connection()
            .ok_or(ClientError::NoActiveSession)?;
        self.commands.send_ready(connection.as_ref(), is_ready)
    }

    /// Submit a song selection (host only; the server enforces it).
    pub fn select_song(&self, state: SongSelectionState) -> Result<(), ClientError> {
        let connection = self
            .shared
            .current_connection()
            .ok_or(ClientError::NoActiveSession)?;
        self.commands.send_song_selection(connection.as_ref(), state)
    }

    // ── Gameplay commands ───────────────────────────────────────────

    /// Send an opaque gameplay state frame (reliable-sequenced).
    pub fn send_gameplay_state(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        let session_id = self.session_id().ok_or(ClientError::NoActiveSession)?;
        self.send_envelope(
            PacketType::GameplayState,
            &GameplayState { session_id, frame },
            Channel::ReliableSequenced,
        )
    }

    /// Send a song-clock sample (reliable-sequenced).
    pub fn send_time_sync(&self, song_time_millis: u64) -> Result<(), ClientError> {
        let session_id = self.session_id().ok_or(ClientError::NoActiveSession)?;
        self.send_envelope(
            PacketType::GameplayTimeSync,
            &GameplayTimeSync {
                session_id,
                song_time_millis,
            },
            Channel::ReliableSequenced,
        )
    }

    /// Pause or resume the song (host only; the server enforces it).
    pub fn send_pause(&self, paused: bool, song_time_millis: u64) -> Result<(), ClientError> {
        let session_id = self.session_id().ok_or(ClientError::NoActiveSession)?;
        self.send_envelope(
            PacketType::GameplayPause,
            &GameplayPause {
                session_id,
                paused,
                song_time_millis,
            },
            Channel::ReliableOrdered,
        )
    }

    /// End the song (host only; the server enforces it).
    pub fn send_game_end(&self, aborted: bool) -> Result<(), ClientError> {
        let session_id = self.session_id().ok_or(ClientError::NoActiveSession)?;
        self.send_envelope(
            PacketType::GameplayEnd,
            &GameplayEnd {
                session_id,
                aborted,
            },
            Channel::ReliableOrdered,
        )
    }

    /// Ask peers to stream their replay data.
    pub fn request_replay_sync(&self) -> Result<(), ClientError> {
        let session_id = self.session_id().ok_or(ClientError::NoActiveSession)?;
        self.send_envelope(
            PacketType::ReplaySyncRequest,
            &ReplaySyncRequest { session_id },
            Channel::ReliableOrdered,
        )
    }

    /// Stream one replay chunk.
    pub fn send_replay_chunk(&self, chunk_index: u32, data: Vec<u8>) -> Result<(), ClientError> {
        let session_id = self.session_id().ok_or(ClientError::NoActiveSession)?;
        self.send_envelope(
            PacketType::ReplaySyncData,
            &ReplaySyncData {
                session_id,
                chunk_index,
                data,
            },
            Channel::ReliableOrdered,
        )
    }

    /// Finish a replay stream.
    pub fn complete_replay_sync(&self, chunk_count: u32) -> Result<(), ClientError> {
        let session_id = self.session_id().ok_or(ClientError::NoActiveSession)?;
        self.send_envelope(
            PacketType::ReplaySyncComplete,
            &ReplaySyncComplete {
                session_id,
                chunk_count,
            },
            Channel::ReliableOrdered,
        )
    }

    fn send_envelope<P: serde::Serialize>(
        &self,
        packet_type: PacketType,
        payload: &P,
        channel: Channel,
    ) -> Result<(), ClientError> {
        let connection = self
            .shared
            .current_connection()
            .ok_or(ClientError::NoActiveSession)?;
        let envelope = PacketEnvelope::new(packet_type, payload);
        let bytes = serializer::encode(&envelope)?;
        connection.send(&bytes, channel)?;
        Ok(())
    }
}

impl<T: Transport> Drop for ClientRuntime<T> {
    fn drop(&mut self) {
        // Synchronous drop cannot await the graceful path; abort the loop so
        // it cannot outlive the handle.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Event emission ──────────────────────────────────────────────────

/// Emit an event without blocking the poll loop; drop (with a warning) when
/// the consumer is behind.
fn emit(event_tx: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(
                "event channel full, dropping event: {:?}",
                std::mem::discriminant(&dropped)
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

// ── Dispatcher wiring ───────────────────────────────────────────────

fn register_client_handlers(shared: &Arc<ClientShared>, event_tx: &mpsc::Sender<ClientEvent>) {
    let dispatcher = &shared.dispatcher;

    {
        let shared = Arc::clone(shared);
        let tx = event_tx.clone();
        dispatcher.register_handler::<HandshakeResponse, _, _>(
            PacketType::HandshakeResponse,
            move |ctx: HandlerContext, envelope: PacketEnvelope<HandshakeResponse>| {
                let shared = Arc::clone(&shared);
                let tx = tx.clone();
                async move {
                    if ctx.role != EndpointRole::Client {
                        return;
                    }
                    match shared.handshake.handle_response(&envelope.payload) {
                        ClientHandshakeOutcome::Accepted { session_id } => {
                            emit(&tx, ClientEvent::HandshakeAccepted { session_id });
                        }
                        ClientHandshakeOutcome::Rejected { reason } => {
                            emit(&tx, ClientEvent::HandshakeRejected { reason });
                        }
                    }
                }
            },
        );
    }
    {
        let shared = Arc::clone(shared);
        let tx = event_tx.clone();
        dispatcher.register_handler::<LobbyStateSnapshot, _, _>(
            PacketType::LobbyState,
            move |ctx, envelope: PacketEnvelope<LobbyStateSnapshot>| {
                let shared = Arc::clone(&shared);
                let tx = tx.clone();
                async move {
                    if let Some(snapshot) = shared.lobby.handle(&ctx, envelope.payload) {
                        emit(&tx, ClientEvent::LobbyUpdated(snapshot));
                    }
                }
            },
        );
    }
    {
        let tx = event_tx.clone();
        dispatcher.register_handler::<LobbyInvite, _, _>(
            PacketType::LobbyInvite,
            move |ctx, envelope: PacketEnvelope<LobbyInvite>| {
                let tx = tx.clone();
                async move {
                    if ctx.role != EndpointRole::Client {
                        return;
                    }
                    emit(&tx, ClientEvent::InviteReceived(envelope.payload));
                }
            },
        );
    }
    {
        let tx = event_tx.clone();
        dispatcher.register_handler::<GameplayCountdown, _, _>(
            PacketType::GameplayCountdown,
            move |_ctx, envelope: PacketEnvelope<GameplayCountdown>| {
                let tx = tx.clone();
                async move {
                    emit(
                        &tx,
                        ClientEvent::CountdownTick {
                            seconds_remaining: envelope.payload.seconds_remaining,
                        },
                    );
                }
            },
        );
    }
    {
        let tx = event_tx.clone();
        dispatcher.register_handler::<GameplayStart, _, _>(
            PacketType::GameplayStart,
            move |_ctx, envelope: PacketEnvelope<GameplayStart>| {
                let tx = tx.clone();
                async move {
                    emit(
                        &tx,
                        ClientEvent::GameplayStarted {
                            song_id: envelope.payload.song_id,
                        },
                    );
                }
            },
        );
    }
    {
        let tx = event_tx.clone();
        dispatcher.register_handler::<GameplayState, _, _>(
            PacketType::GameplayState,
            move |_ctx, envelope: PacketEnvelope<GameplayState>| {
                let tx = tx.clone();
                async move {
                    emit(
                        &tx,
                        ClientEvent::GameplayStateReceived {
                            session_id: envelope.payload.session_id,
                            frame: envelope.payload.frame,
                        },
                    );
                }
            },
        );
    }
    {
        let tx = event_tx.clone();
        dispatcher.register_handler::<GameplayTimeSync, _, _>(
            PacketType::GameplayTimeSync,
            move |_ctx, envelope: PacketEnvelope<GameplayTimeSync>| {
                let tx = tx.clone();
                async move {
                    emit(
                        &tx,
                        ClientEvent::TimeSyncReceived {
                            session_id: envelope.payload.session_id,
                            song_time_millis: envelope.payload.song_time_millis,
                        },
                    );
                }
            },
        );
    }
    {
        let tx = event_tx.clone();
        dispatcher.register_handler::<GameplayPause, _, _>(
            PacketType::GameplayPause,
            move |_ctx, envelope: PacketEnvelope<GameplayPause>| {
                let tx = tx.clone();
                async move {
                    emit(
                        &tx,
                        ClientEvent::GameplayPaused {
                            paused: envelope.payload.paused,
                            song_time_millis: envelope.payload.song_time_millis,
                        },
                    );
                }
            },
        );
    }
    {
        let tx = event_tx.clone();
        dispatcher.register_handler::<GameplayEnd, _, _>(
            PacketType::GameplayEnd,
            move |_ctx, envelope: PacketEnvelope<GameplayEnd>| {
                let tx = tx.clone();
                async move {
                    emit(
                        &tx,
                        ClientEvent::GameplayEnded {
                            aborted: envelope.payload.aborted,
                        },
                    );
                }
            },
        );
    }
    {
        let tx = event_tx.clone();
        dispatcher.register_handler::<ReplaySyncRequest, _, _>(
            PacketType::ReplaySyncRequest,
            move |_ctx, envelope: PacketEnvelope<ReplaySyncRequest>| {
                let tx = tx.clone();
                async move {
                    emit(
                        &tx,
                        ClientEvent::ReplaySyncRequested {
                            session_id: envelope.payload.session_id,
                        },
                    );
                }
            },
        );
    }
    {
        let tx = event_tx.clone();
        dispatcher.register_handler::<ReplaySyncData, _, _>(
            PacketType::ReplaySyncData,
            move |_ctx, envelope: PacketEnvelope<ReplaySyncData>| {
                let tx = tx.clone();
                async move {
                    emit(
                        &tx,
                        ClientEvent::ReplayChunkReceived {
                            session_id: envelope.payload.session_id,
                            chunk_index: envelope.payload.chunk_index,
                            data: envelope.payload.data,
                        },
                    );
                }
            },
        );
    }
    {
        let tx = event_tx.clone();
        dispatcher.register_handler::<ReplaySyncComplete, _, _>(
            PacketType::ReplaySyncComplete,
            move |_ctx, envelope: PacketEnvelope<ReplaySyncComplete>| {
                let tx = tx.clone();
                async move {
                    emit(
                        &tx,
                        ClientEvent::ReplaySyncCompleted {
                            session_id: envelope.payload.session_id,
                            chunk_count: envelope.payload.chunk_count,
                        },
                    );
                }
            },
        );
    }
    {
        let shared = Arc::clone(shared);
        let tx = event_tx.clone();
        dispatcher.register_handler::<Heartbeat, _, _>(
            PacketType::Heartbeat,
            move |_ctx, envelope: PacketEnvelope<Heartbeat>| {
                let shared = Arc::clone(&shared);
                let tx = tx.clone();
                async move {
                    // The server echoes our clock sample back.
                    let rtt = shared
                        .now_millis()
                        .saturating_sub(envelope.payload.client_time_millis);
                    emit(&tx, ClientEvent::LatencyUpdated { millis: rtt as u32 });
                }
            },
        );
    }
}

// ── Poll loop ───────────────────────────────────────────────────────

async fn poll_loop<T: Transport>(
    mut transport: T,
    shared: Arc<ClientShared>,
    event_tx: mpsc::Sender<ClientEvent>,
    connected_tx: oneshot::Sender<()>,
    cancel: CancellationToken,
) -> T {
    debug!("client poll loop started");
    let mut connected_tx = Some(connected_tx);
    let mut last_heartbeat = Instant::now();
    let mut disconnect_reason: Option<String> = None;
    let mut peer_closed = false;

    'outer: loop {
        let events = tokio::select! {
            _ = cancel.cancelled() => break,
            events = transport.poll(shared.config.poll_interval) => events,
        };

        for event in events {
            match event {
                TransportEvent::PeerConnected(connection) => {
                    debug!(remote = %connection.remote_addr(), "connected to server");
                    if let Ok(mut slot) = shared.connection.lock() {
                        *slot = Some(Arc::clone(&connection));
                    }
                    shared
                        .handshake
                        .on_connected(connection.as_ref(), Instant::now());
                    emit(&event_tx, ClientEvent::Connected);
                    if let Some(tx) = connected_tx.take() {
                        let _ = tx.send(());
                    }
                }
                TransportEvent::PeerDisconnected { reason, .. } => {
                    disconnect_reason = reason
                        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
                    peer_closed = true;
                    break 'outer;
                }
                TransportEvent::PayloadReceived {
                    connection,
                    payload,
                    channel,
                } => {
                    let ctx = HandlerContext {
                        connection,
                        channel,
                        role: EndpointRole::Client,
                    };
                    shared.dispatcher.dispatch(&payload, ctx).await;
                }
                TransportEvent::LatencyUpdate { millis, .. } => {
                    emit(&event_tx, ClientEvent::LatencyUpdated { millis });
                }
                TransportEvent::UnconnectedMessage { remote, .. } => {
                    debug!(%remote, "ignoring unconnected datagram on client runtime");
                }
                TransportEvent::NatPunchSuccess { target, .. } => {
                    debug!(%target, "punch confirmed while connecting");
                }
            }
        }

        let now = Instant::now();
        if shared.handshake.timed_out(now) {
            warn!("handshake response timed out");
            shared.handshake.reset();
            emit(
                &event_tx,
                ClientEvent::HandshakeRejected {
                    reason: "Handshake timed out.".to_string(),
                },
            );
            if let Some(connection) = shared.current_connection() {
                connection.disconnect(Some(b"Handshake timed out."));
            }
        }
        if shared.context.session_id().is_some()
            && now.duration_since(last_heartbeat) >= shared.config.heartbeat_interval
        {
            last_heartbeat = now;
            if let Some(connection) = shared.current_connection() {
                let envelope = PacketEnvelope::new(
                    PacketType::Heartbeat,
                    Heartbeat {
                        client_time_millis: shared.now_millis(),
                    },
                );
                if let Ok(bytes) = serializer::encode(&envelope) {
                    let _ = connection.send(&bytes, Channel::Unreliable);
                }
            }
        }
    }

    // Graceful teardown: clear shared state, close the transport, emit the
    // final Disconnected (never dropped).
    if let Ok(mut slot) = shared.connection.lock() {
        *slot = None;
    }
    shared.context.clear();
    shared.lobby.reset();

    if disconnect_reason.is_none() {
        disconnect_reason = shared
            .shutdown_reason
            .lock()
            .ok()
            .and_then(|slot| slot.clone());
    }
    if peer_closed {
        transport.shutdown(None);
    } else {
        let reason_bytes = disconnect_reason.as_ref().map(|r| r.as_bytes().to_vec());
        transport.shutdown(reason_bytes.as_deref());
    }

    if event_tx
        .send(ClientEvent::Disconnected {
            reason: disconnect_reason,
        })
        .await
        .is_err()
    {
        debug!("event channel closed, receiver dropped");
    }
    debug!("client poll loop exited");
    transport
}
