//! The authoritative server runtime.
//!
//! Owns the transport, dispatcher, session manager, lobby manager and
//! coordinator, and drives them from a single cooperative poll loop: drain
//! transport events, dispatch payloads, expire silent handshakes, advance
//! the countdown, flush pending broadcasts. Handlers run synchronously on
//! the loop; anything long-lived (directory heartbeat, punch registration)
//! belongs on its own task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{LobbyCoordinator, ServerLobbyCommandHandler};
use crate::discovery::{DiscoveredLobbyInfo, DiscoveryResponder};
use crate::dispatcher::{EndpointRole, HandlerContext, PacketDispatcher};
use crate::error::TransportError;
use crate::handshake::ServerHandshake;
use crate::lobby::LobbyManager;
use crate::protocol::{
    GameplayEnd, GameplayPause, GameplayState, GameplayTimeSync, HandshakeRequest, Heartbeat,
    LobbyInvite, LobbyReadyState, PacketEnvelope, PacketType, ReplaySyncComplete, ReplaySyncData,
    ReplaySyncRequest, SongSelection,
};
use crate::serializer;
use crate::session::SessionManager;
use crate::transport::{Connection, ConnectionId, Transport, TransportEvent, TransportOptions};

/// Configuration for [`ServerRuntime`]. Locked in once the runtime starts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub address: String,
    /// Port to bind.
    pub port: u16,
    /// Maximum concurrent sessions (= lobby capacity).
    pub max_players: usize,
    /// Optional lobby password, compared constant-time during handshake.
    pub password: Option<String>,
    /// Name advertised over LAN discovery and the directory.
    pub lobby_name: String,
    /// How long ReadyToPlay must hold before the countdown starts.
    pub countdown_hold: Duration,
    /// Poll loop frame budget.
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 7777,
            max_players: 8,
            password: None,
            lobby_name: "YARG Lobby".to_string(),
            countdown_hold: Duration::ZERO,
            poll_interval: Duration::from_millis(16),
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_max_players(mut self, max_players: usize) -> Self {
        self.max_players = max_players;
        self
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_lobby_name(mut self, lobby_name: impl Into<String>) -> Self {
        self.lobby_name = lobby_name.into();
        self
    }

    #[must_use]
    pub fn with_countdown_hold(mut self, hold: Duration) -> Self {
        self.countdown_hold = hold;
        self
    }
}

/// Everything the poll loop and the packet handlers share.
struct ServerShared {
    config: ServerConfig,
    dispatcher: PacketDispatcher,
    sessions: Arc<SessionManager>,
    lobby: Arc<LobbyManager>,
    coordinator: LobbyCoordinator,
    commands: ServerLobbyCommandHandler,
    handshake: ServerHandshake,
    /// Set by the lobby's changed signal; drained once per frame.
    lobby_dirty: AtomicBool,
}

/// The server runtime: transport binding, poll loop, orchestration.
pub struct ServerRuntime<T: Transport> {
    config: ServerConfig,
    transport: Option<T>,
    shared: Option<Arc<ServerShared>>,
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl<T: Transport> ServerRuntime<T> {
    pub fn new(transport: T) -> Self {
        Self {
            config: ServerConfig::default(),
            transport: Some(transport),
            shared: None,
            task: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the configuration. Disallowed once the runtime is running.
    pub fn configure(&mut self, config: ServerConfig) -> Result<(), TransportError> {
        if self.task.is_some() {
            return Err(TransportError::AlreadyRunning);
        }
        self.config = config;
        Ok(())
    }

    /// The lobby manager, for host-side tooling (directory advertisement,
    /// invites).
    pub fn lobby(&self) -> Option<Arc<LobbyManager>> {
        self.shared.as_ref().map(|s| Arc::clone(&s.lobby))
    }

    /// The session manager.
    pub fn sessions(&self) -> Option<Arc<SessionManager>> {
        self.shared.as_ref().map(|s| Arc::clone(&s.sessions))
    }

    /// Current advertisable description of this lobby, used by LAN discovery
    /// responses and the directory heartbeat.
    pub fn advertised_info(&self) -> Option<DiscoveredLobbyInfo> {
        let shared = self.shared.as_ref()?;
        Some(build_advertised_info(shared))
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Bind the transport in server mode and spawn the poll loop.
    pub async fn start(&mut self) -> Result<(), TransportError> {
        if self.task.is_some() {
            return Err(TransportError::AlreadyRunning);
        }
        let mut transport = self.transport.take().ok_or(TransportError::NotRunning)?;
        transport.start(TransportOptions::server(
            self.config.address.clone(),
            self.config.port,
        ))?;

        let sessions = Arc::new(SessionManager::new(self.config.max_players));
        let lobby = Arc::new(LobbyManager::new(self.config.max_players));
        let shared = Arc::new(ServerShared {
            config: self.config.clone(),
            dispatcher: PacketDispatcher::new(),
            coordinator: LobbyCoordinator::new(
                Arc::clone(&lobby),
                Arc::clone(&sessions),
                self.config.countdown_hold,
            ),
            commands: ServerLobbyCommandHandler::new(Arc::clone(&lobby), Arc::clone(&sessions)),
            handshake: ServerHandshake::new(Arc::clone(&sessions), self.config.password.clone()),
            sessions,
            lobby,
            lobby_dirty: AtomicBool::new(false),
        });

        // The lobby's changed signal only marks a flag; the poll loop turns
        // it into a broadcast at frame granularity. Weak, since the lobby
        // outlives neither the shared state nor the listener.
        {
            let weak = Arc::downgrade(&shared);
            shared.lobby.register_changed_listener(Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.lobby_dirty.store(true, Ordering::Release);
                }
            }));
        }

        register_server_handlers(&shared);

        self.cancel = CancellationToken::new();
        let cancel = self.cancel.clone();
        let loop_shared = Arc::clone(&shared);
        info!(
            address = %self.config.address,
            port = self.config.port,
            max_players = self.config.max_players,
            "server runtime starting"
        );
        self.shared = Some(shared);
        self.task = Some(tokio::spawn(poll_loop(transport, loop_shared, cancel)));
        Ok(())
    }

    /// Signal the poll loop to exit, await it, shut the transport down.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(%error, "server poll loop terminated abnormally");
            }
        }
        self.shared = None;
        info!("server runtime stopped");
    }
}

fn build_advertised_info(shared: &ServerShared) -> DiscoveredLobbyInfo {
    let snapshot = shared.lobby.build_snapshot();
    let host_name = snapshot
        .players
        .iter()
        .find(|p| p.role == crate::protocol::PlayerRole::Host)
        .map(|p| p.display_name.clone())
        .unwrap_or_default();
    DiscoveredLobbyInfo {
        lobby_id: shared.lobby.lobby_id().to_string(),
        lobby_name: shared.config.lobby_name.clone(),
        host_name,
        current_players: snapshot.players.len() as i32,
        max_players: shared.config.max_players as i32,
        has_password: shared.config.password.is_some(),
        port: i32::from(shared.config.port),
        public_port: i32::from(shared.config.port),
        player_names: snapshot
            .players
            .iter()
            .map(|p| p.display_name.clone())
            .collect(),
        ..DiscoveredLobbyInfo::default()
    }
}

/// Wire every server-side packet handler into the dispatcher.
fn register_server_handlers(shared: &Arc<ServerShared>) {
    let dispatcher = &shared.dispatcher;

    // Handshake.
    {
        let shared = Arc::clone(shared);
        dispatcher.register_handler::<HandshakeRequest, _, _>(
            PacketType::HandshakeRequest,
            move |ctx: HandlerContext, envelope: PacketEnvelope<HandshakeRequest>| {
                let shared = Arc::clone(&shared);
                async move {
                    if ctx.role != EndpointRole::Server {
                        return;
                    }
                    if let Ok(record) = shared.handshake.process(ctx.connection, &envelope.payload)
                    {
                        shared.coordinator.on_session_accepted(&record);
                    }
                }
            },
        );
    }

    // Heartbeat: echo so the client can estimate RTT.
    dispatcher.register_handler::<Heartbeat, _, _>(
        PacketType::Heartbeat,
        move |ctx: HandlerContext, envelope: PacketEnvelope<Heartbeat>| async move {
            let echo = PacketEnvelope::new(PacketType::Heartbeat, envelope.payload);
            if let Ok(bytes) = serializer::encode(&echo) {
                let _ = ctx.connection.send(&bytes, ctx.channel);
            }
        },
    );

    // Lobby commands.
    {
        let shared = Arc::clone(shared);
        dispatcher.register_handler::<LobbyReadyState, _, _>(
            PacketType::LobbyReadyState,
            move |ctx, envelope: PacketEnvelope<LobbyReadyState>| {
                let shared = Arc::clone(&shared);
                async move {
                    shared.commands.handle_ready_state(&ctx, &envelope.payload);
                }
            },
        );
    }
    {
        let shared = Arc::clone(shared);
        dispatcher.register_handler::<SongSelection, _, _>(
            PacketType::SongSelection,
            move |ctx, envelope: PacketEnvelope<SongSelection>| {
                let shared = Arc::clone(&shared);
                async move {
                    shared.commands.handle_song_selection(&ctx, &envelope.payload);
                }
            },
        );
    }
    {
        let shared = Arc::clone(shared);
        dispatcher.register_handler::<LobbyInvite, _, _>(
            PacketType::LobbyInvite,
            move |ctx, envelope: PacketEnvelope<LobbyInvite>| {
                let shared = Arc::clone(&shared);
                async move {
                    shared.commands.handle_invite(&ctx, &envelope.payload);
                }
            },
        );
    }

    // Gameplay relays: session-gated, preserve the arrival channel.
    {
        let shared = Arc::clone(shared);
        dispatcher.register_handler::<GameplayState, _, _>(
            PacketType::GameplayState,
            move |ctx, envelope: PacketEnvelope<GameplayState>| {
                let shared = Arc::clone(&shared);
                async move {
                    if shared.sessions.get_by_connection(ctx.connection.id()).is_none() {
                        return;
                    }
                    shared.coordinator.relay_to_others(
                        ctx.connection.id(),
                        PacketType::GameplayState,
                        &envelope.payload,
                        ctx.channel,
                    );
                }
            },
        );
    }
    {
        let shared = Arc::clone(shared);
        dispatcher.register_handler::<GameplayTimeSync, _, _>(
            PacketType::GameplayTimeSync,
            move |ctx, envelope: PacketEnvelope<GameplayTimeSync>| {
                let shared = Arc::clone(&shared);
                async move {
                    if shared.sessions.get_by_connection(ctx.connection.id()).is_none() {
                        return;
                    }
                    shared.coordinator.relay_to_others(
                        ctx.connection.id(),
                        PacketType::GameplayTimeSync,
                        &envelope.payload,
                        ctx.channel,
                    );
                }
            },
        );
    }
    {
        let shared = Arc::clone(shared);
        dispatcher.register_handler::<GameplayPause, _, _>(
            PacketType::GameplayPause,
            move |ctx, envelope: PacketEnvelope<GameplayPause>| {
                let shared = Arc::clone(&shared);
                async move {
                    if !shared
                        .commands
                        .is_host_connection(ctx.connection.id(), envelope.payload.session_id)
                    {
                        debug!("dropping pause from non-host");
                        return;
                    }
                    shared.coordinator.relay_to_others(
                        ctx.connection.id(),
                        PacketType::GameplayPause,
                        &envelope.payload,
                        ctx.channel,
                    );
                }
            },
        );
    }
    {
        let shared = Arc::clone(shared);
        dispatcher.register_handler::<GameplayEnd, _, _>(
            PacketType::GameplayEnd,
            move |ctx, envelope: PacketEnvelope<GameplayEnd>| {
                let shared = Arc::clone(&shared);
                async move {
                    if !shared
                        .commands
                        .is_host_connection(ctx.connection.id(), envelope.payload.session_id)
                    {
                        debug!("dropping game end from non-host");
                        return;
                    }
                    shared.coordinator.relay_to_others(
                        ctx.connection.id(),
                        PacketType::GameplayEnd,
                        &envelope.payload,
                        ctx.channel,
                    );
                    shared.coordinator.on_game_ended();
                }
            },
        );
    }

    // Replay sync relays.
    {
        let shared = Arc::clone(shared);
        dispatcher.register_handler::<ReplaySyncRequest, _, _>(
            PacketType::ReplaySyncRequest,
            move |ctx, envelope: PacketEnvelope<ReplaySyncRequest>| {
                let shared = Arc::clone(&shared);
                async move {
                    if shared.sessions.get_by_connection(ctx.connection.id()).is_none() {
                        return;
                    }
                    shared.coordinator.relay_to_others(
                        ctx.connection.id(),
                        PacketType::ReplaySyncRequest,
                        &envelope.payload,
                        ctx.channel,
                    );
                }
            },
        );
    }
    {
        let shared = Arc::clone(shared);
        dispatcher.register_handler::<ReplaySyncData, _, _>(
            PacketType::ReplaySyncData,
            move |ctx, envelope: PacketEnvelope<ReplaySyncData>| {
                let shared = Arc::clone(&shared);
                async move {
                    if shared.sessions.get_by_connection(ctx.connection.id()).is_none() {
                        return;
                    }
                    shared.coordinator.relay_to_others(
                        ctx.connection.id(),
                        PacketType::ReplaySyncData,
                        &envelope.payload,
                        ctx.channel,
                    );
                }
            },
        );
    }
    {
        let shared = Arc::clone(shared);
        dispatcher.register_handler::<ReplaySyncComplete, _, _>(
            PacketType::ReplaySyncComplete,
            move |ctx, envelope: PacketEnvelope<ReplaySyncComplete>| {
                let shared = Arc::clone(&shared);
                async move {
                    if shared.sessions.get_by_connection(ctx.connection.id()).is_none() {
                        return;
                    }
                    shared.coordinator.relay_to_others(
                        ctx.connection.id(),
                        PacketType::ReplaySyncComplete,
                        &envelope.payload,
                        ctx.channel,
                    );
                }
            },
        );
    }
}

async fn poll_loop<T: Transport>(
    mut transport: T,
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
) {
    debug!("server poll loop started");
    let mut peers: HashMap<ConnectionId, Arc<dyn Connection>> = HashMap::new();
    let responder = DiscoveryResponder::new(Box::new({
        let weak = Arc::downgrade(&shared);
        move || {
            weak.upgrade()
                .map(|shared| build_advertised_info(&shared))
                .unwrap_or_default()
        }
    }));

    loop {
        let events = tokio::select! {
            _ = cancel.cancelled() => break,
            events = transport.poll(shared.config.poll_interval) => events,
        };

        for event in events {
            handle_event(&mut transport, &shared, &responder, &mut peers, event).await;
        }

        let now = Instant::now();
        for connection_id in shared.handshake.expired(now) {
            if let Some(connection) = peers.get(&connection_id) {
                warn!(connection_id, "disconnecting peer with expired handshake");
                connection.disconnect(Some(b"Handshake timed out."));
            }
        }
        shared.coordinator.tick(now);
        if shared.lobby_dirty.swap(false, Ordering::AcqRel) {
            shared.coordinator.broadcast_if_changed();
        }
    }

    transport.shutdown(Some(b"Server shutting down."));
    debug!("server poll loop exited");
}

async fn handle_event<T: Transport>(
    transport: &mut T,
    shared: &Arc<ServerShared>,
    responder: &DiscoveryResponder,
    peers: &mut HashMap<ConnectionId, Arc<dyn Connection>>,
    event: TransportEvent,
) {
    match event {
        TransportEvent::PeerConnected(connection) => {
            debug!(connection_id = connection.id(), remote = %connection.remote_addr(), "peer connected");
            shared
                .handshake
                .note_connected(connection.id(), Instant::now());
            peers.insert(connection.id(), connection);
        }
        TransportEvent::PeerDisconnected { connection, reason } => {
            debug!(
                connection_id = connection.id(),
                reason = reason.as_deref().map(String::from_utf8_lossy).as_deref(),
                "peer disconnected"
            );
            peers.remove(&connection.id());
            shared.handshake.note_disconnected(connection.id());
            shared.coordinator.on_peer_disconnected(connection.id());
        }
        TransportEvent::PayloadReceived {
            connection,
            payload,
            channel,
        } => {
            let ctx = HandlerContext {
                connection,
                channel,
                role: EndpointRole::Server,
            };
            shared.dispatcher.dispatch(&payload, ctx).await;
        }
        TransportEvent::UnconnectedMessage { remote, payload } => {
            // Anything that is not a valid discovery request is ignored.
            if let Some(response) = responder.respond(&payload) {
                if let Err(error) = transport.send_unconnected(remote, &response) {
                    debug!(%error, %remote, "discovery response failed");
                }
            }
        }
        TransportEvent::LatencyUpdate { connection, millis } => {
            debug!(connection_id = connection.id(), millis, "latency update");
        }
        TransportEvent::NatPunchSuccess { target, .. } => {
            // The host's side of a punch; the client does the connecting.
            debug!(%target, "punch coordination completed");
        }
    }
}
