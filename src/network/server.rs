//! Relay Server
//!
//! Two faces:
//! - **Control**: WebSocket over TCP. Create, join, start and leave requests
//!   arrive as binary codec frames or JSON text; the reply uses the same form.
//! - **Realtime**: one UDP socket per match. Forwards peer input for pairs
//!   without a direct path, collects disconnect and desync reports, and
//!   broadcasts the match sync at a steady cadence.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::network::codec::EncodeError;
use crate::network::protocol::{
    ControlMessage, CreateMatchResponse, ErrorCode, JoinMatchResponse, LeaveMatchResponse,
    RealtimeMessage, ServerDcFramesMessage, StartMatchResponse,
};
use crate::network::session::{MatchSession, SeatAssignment, SessionError, SessionManager, SessionState};

/// Receive buffer for relay sockets. Larger than any valid datagram so
/// oversized ones are seen whole and rejected by the codec.
const RELAY_RECV_BUFFER: usize = 2048;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Control channel bind address. Relay sockets bind to the same IP.
    pub bind_addr: SocketAddr,
    /// First relay UDP port.
    pub base_udp_port: u16,
    /// Relay ports available (one per match).
    pub max_matches: u16,
    /// Maximum concurrent control connections.
    pub max_connections: usize,
    /// Cadence of the match sync broadcast.
    pub sync_interval: Duration,
    /// Silence after which a player is considered disconnected.
    pub player_timeout: Duration,
    /// Silence required before a survivor's escalation is believed.
    pub suspect_grace: Duration,
    /// How long a match may have no connected players before closing.
    pub empty_match_timeout: Duration,
    /// How long an ended match keeps its relay open.
    pub ended_match_linger: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 14242)),
            base_udp_port: 14243,
            max_matches: 64,
            max_connections: 1000,
            sync_interval: Duration::from_millis(500),
            player_timeout: Duration::from_secs(5),
            suspect_grace: Duration::from_secs(1),
            empty_match_timeout: Duration::from_secs(5),
            ended_match_linger: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        Self {
            bind_addr: std::env::var("RELAY_BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            base_udp_port: std::env::var("RELAY_BASE_UDP_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.base_udp_port),
            sync_interval: millis("RELAY_SYNC_INTERVAL_MS", defaults.sync_interval),
            player_timeout: millis("RELAY_PLAYER_TIMEOUT_MS", defaults.player_timeout),
            empty_match_timeout: millis("RELAY_EMPTY_MATCH_TIMEOUT_MS", defaults.empty_match_timeout),
            ..defaults
        }
    }
}

/// Relay server errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayServerError {
    /// Failed to bind a socket.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Encoding error.
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),
}

/// Control connection bookkeeping.
struct ControlConnection {
    connected_at: Instant,
    /// Matches this connection holds a seat in: (match name, guid).
    seats: Vec<(String, Uuid)>,
}

/// Datagrams to send after releasing the session lock.
type Outgoing = Vec<(SocketAddr, Vec<u8>)>;

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    sessions: Arc<SessionManager>,
    connections: Arc<RwLock<BTreeMap<SocketAddr, ControlConnection>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a relay server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let sessions = Arc::new(SessionManager::new(config.base_udp_port, config.max_matches));

        Self {
            config,
            sessions,
            connections: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), RelayServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve control connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayServerError> {
        info!("Relay server listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let count = self.connections.read().await.len();
                            if count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("New control connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let connections = self.connections.clone();
        let sessions = self.sessions.clone();
        let config = self.config.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (reply_tx, mut reply_rx) = mpsc::channel::<Message>(64);

            connections.write().await.insert(addr, ControlConnection {
                connected_at: Instant::now(),
                seats: Vec::new(),
            });

            let sender_task = tokio::spawn(async move {
                while let Some(msg) = reply_rx.recv().await {
                    if ws_sender.send(msg).await.is_err() {
                        break;
                    }
                }
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let reply = match msg {
                            Some(Ok(Message::Text(text))) => {
                                let reply = match ControlMessage::from_json(&text) {
                                    Ok(request) => {
                                        Self::handle_control(addr, request, &sessions, &connections, &config, &shutdown_tx).await
                                    }
                                    Err(e) => {
                                        debug!("Invalid control message from {}: {}", addr, e);
                                        ControlMessage::error(ErrorCode::InvalidMessage, "Invalid message format")
                                    }
                                };
                                match reply.to_json() {
                                    Ok(text) => Message::Text(text),
                                    Err(e) => {
                                        error!("Failed to serialize reply: {}", e);
                                        continue;
                                    }
                                }
                            }
                            Some(Ok(Message::Binary(data))) => {
                                let reply = match ControlMessage::decode(&data) {
                                    Ok(request) => {
                                        Self::handle_control(addr, request, &sessions, &connections, &config, &shutdown_tx).await
                                    }
                                    Err(e) => {
                                        debug!("Invalid control frame from {}: {}", addr, e);
                                        ControlMessage::error(ErrorCode::InvalidMessage, e.to_string())
                                    }
                                };
                                match reply.encode() {
                                    Ok(bytes) => Message::Binary(bytes),
                                    Err(e) => {
                                        error!("Failed to encode reply: {}", e);
                                        continue;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Control connection {} closed", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => continue,
                        };
                        if reply_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            drop(reply_tx);
            let _ = sender_task.await;

            // Losing the control channel before start frees the seat
            let connection = connections.write().await.remove(&addr);
            if let Some(connection) = connection {
                for (match_name, guid) in connection.seats {
                    Self::release_lobby_seat(&sessions, &match_name, guid).await;
                }
                debug!("Control connection {} cleaned up after {:?}", addr, connection.connected_at.elapsed());
            }
        });
    }

    /// Handle one control request and build the reply.
    async fn handle_control(
        addr: SocketAddr,
        request: ControlMessage,
        sessions: &Arc<SessionManager>,
        connections: &Arc<RwLock<BTreeMap<SocketAddr, ControlConnection>>>,
        config: &ServerConfig,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> ControlMessage {
        match request {
            ControlMessage::CreateMatch(req) => {
                let guid = req.player.guid;
                let mut seat = match sessions.create_match(req.settings, &req.player).await {
                    Ok(seat) => seat,
                    Err(e) => return session_error(e),
                };

                if seat.created {
                    match Self::spawn_relay(&seat, sessions, config, shutdown_tx).await {
                        Ok(port) => seat.relay_port = port,
                        Err(e) => {
                            error!(match_name = %seat.settings.match_name, "Relay socket failed: {}", e);
                            sessions.remove(&seat.settings.match_name).await;
                            return ControlMessage::error(ErrorCode::InternalError, e.to_string());
                        }
                    }
                }

                Self::remember_seat(connections, addr, &seat.settings.match_name, guid).await;
                ControlMessage::MatchCreated(CreateMatchResponse {
                    settings: seat.settings,
                    relay_port: seat.relay_port,
                    player: seat.player,
                })
            }
            ControlMessage::JoinMatch(req) => match sessions.join_match(&req.match_name, &req.player).await {
                Ok(seat) => {
                    Self::remember_seat(connections, addr, &req.match_name, req.player.guid).await;
                    ControlMessage::MatchJoined(JoinMatchResponse {
                        settings: seat.settings,
                        relay_port: seat.relay_port,
                        player: seat.player,
                    })
                }
                Err(e) => session_error(e),
            },
            ControlMessage::StartMatch(req) => match sessions.start_match(&req.match_name, req.requester).await {
                Ok(()) => ControlMessage::MatchStarted(StartMatchResponse { match_name: req.match_name }),
                Err(e) => session_error(e),
            },
            ControlMessage::LeaveMatch(req) => match sessions.leave_match(&req.match_name, req.guid).await {
                Ok(_) => {
                    if let Some(connection) = connections.write().await.get_mut(&addr) {
                        connection.seats.retain(|(name, guid)| !(name == &req.match_name && *guid == req.guid));
                    }
                    ControlMessage::MatchLeft(LeaveMatchResponse { match_name: req.match_name })
                }
                Err(e) => session_error(e),
            },
            other => {
                debug!("Unexpected control message {:?} from {}", other.kind(), addr);
                ControlMessage::error(ErrorCode::InvalidMessage, "Not a request")
            }
        }
    }

    async fn remember_seat(
        connections: &Arc<RwLock<BTreeMap<SocketAddr, ControlConnection>>>,
        addr: SocketAddr,
        match_name: &str,
        guid: Uuid,
    ) {
        if let Some(connection) = connections.write().await.get_mut(&addr) {
            let seat = (match_name.to_string(), guid);
            if !connection.seats.contains(&seat) {
                connection.seats.push(seat);
            }
        }
    }

    async fn release_lobby_seat(sessions: &SessionManager, match_name: &str, guid: Uuid) {
        let Some(session) = sessions.get(match_name).await else {
            return;
        };
        let mut session = session.write().await;
        if session.state == SessionState::Lobby {
            if let Ok(player_id) = session.remove_player(guid) {
                info!(match_name, player_id, "Seat released after control channel loss");
            }
        }
    }

    /// Bind the match relay socket and start its task. Returns the bound port.
    async fn spawn_relay(
        seat: &SeatAssignment,
        sessions: &Arc<SessionManager>,
        config: &ServerConfig,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Result<u16, RelayServerError> {
        let session = sessions
            .get(&seat.settings.match_name)
            .await
            .ok_or(SessionError::MatchNotFound)?;

        let socket = UdpSocket::bind(SocketAddr::new(config.bind_addr.ip(), seat.relay_port)).await?;
        let port = socket.local_addr()?.port();
        session.write().await.relay_port = port;

        info!(match_name = %seat.settings.match_name, port, "Relay socket bound");
        tokio::spawn(Self::run_match_relay(
            session,
            socket,
            sessions.clone(),
            config.clone(),
            shutdown_tx.subscribe(),
        ));
        Ok(port)
    }

    /// Per-match realtime loop.
    async fn run_match_relay(
        session: Arc<RwLock<MatchSession>>,
        socket: UdpSocket,
        sessions: Arc<SessionManager>,
        config: ServerConfig,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let match_name = session.read().await.name().to_string();
        let mut buf = vec![0u8; RELAY_RECV_BUFFER];
        let mut sync_interval = interval(config.sync_interval);
        sync_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => {
                            let outgoing = Self::handle_datagram(&session, &buf[..len], from, &config).await;
                            send_all(&socket, outgoing).await;
                        }
                        Err(e) => {
                            debug!(%match_name, "Relay receive error: {}", e);
                        }
                    }
                }
                _ = sync_interval.tick() => {
                    let (outgoing, close) = Self::sync_tick(&session, &config).await;
                    send_all(&socket, outgoing).await;
                    if close {
                        info!(%match_name, "Closing match");
                        break;
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        sessions.remove(&match_name).await;
    }

    /// Timeouts, then the sync broadcast to every connected endpoint.
    async fn sync_tick(session: &RwLock<MatchSession>, config: &ServerConfig) -> (Outgoing, bool) {
        let now = Instant::now();
        let mut session = session.write().await;
        session.check_timeouts(now, config.player_timeout);

        let close = session.should_close(now, config.empty_match_timeout, config.ended_match_linger);
        let mut parts = Vec::new();
        for part in session.sync_messages() {
            match RealtimeMessage::MatchSync(part).encode() {
                Ok(bytes) => parts.push(bytes),
                Err(e) => warn!(match_name = %session.name(), "Sync part not encodable: {}", e),
            }
        }

        let mut outgoing = Vec::new();
        for addr in session.live_players().into_iter().filter_map(|id| session.endpoint_of(id)) {
            outgoing.extend(parts.iter().map(|bytes| (addr, bytes.clone())));
        }
        (outgoing, close)
    }

    /// Handle one datagram on a match relay socket.
    async fn handle_datagram(
        session: &RwLock<MatchSession>,
        bytes: &[u8],
        from: SocketAddr,
        config: &ServerConfig,
    ) -> Outgoing {
        let msg = match RealtimeMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%from, "Dropping malformed datagram: {}", e);
                return Vec::new();
            }
        };

        let now = Instant::now();
        let mut session = session.write().await;

        if let RealtimeMessage::Hello(hello) = &msg {
            if !session.bind_endpoint(hello.player_id, hello.guid, from) {
                debug!(%from, player_id = hello.player_id, "Hello rejected");
            }
            return Vec::new();
        }

        let Some(sender) = session.player_at(from) else {
            debug!(%from, kind = ?msg.kind(), "Datagram from unbound endpoint");
            return Vec::new();
        };
        if msg.sender_id().map_or(false, |claimed| claimed != sender) {
            warn!(%from, sender, claimed = ?msg.sender_id(), "Sender id does not match endpoint");
            return Vec::new();
        }
        session.touch(sender, now);

        match msg {
            RealtimeMessage::PeerInput(m) => session
                .endpoint_of(m.recipient_id)
                .map(|addr| vec![(addr, bytes.to_vec())])
                .unwrap_or_default(),
            RealtimeMessage::ClientDcFrames(m) => {
                let Some(resolved) = session.record_dc_report(&m, now, config.suspect_grace) else {
                    return Vec::new();
                };
                let disconnector = resolved.record.player_id;
                let reply = RealtimeMessage::ServerDcFrames(ServerDcFramesMessage {
                    recipient_id: sender,
                    record: resolved.record,
                    frames: resolved.frames,
                });
                match reply.encode() {
                    Ok(bytes) => vec![(from, bytes)],
                    Err(e) => {
                        warn!(player_id = disconnector, "Disconnect frames not encodable: {}", e);
                        Vec::new()
                    }
                }
            }
            RealtimeMessage::DesyncReport(m) => {
                session.record_desync_report(&m);
                Vec::new()
            }
            other => {
                debug!(%from, kind = ?other.kind(), "Unexpected datagram");
                Vec::new()
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Active control connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Active matches.
    pub async fn match_count(&self) -> usize {
        self.sessions.match_count().await
    }
}

async fn send_all(socket: &UdpSocket, outgoing: Outgoing) {
    for (addr, bytes) in outgoing {
        if let Err(e) = socket.send_to(&bytes, addr).await {
            debug!(%addr, "Relay send failed: {}", e);
        }
    }
}

fn session_error(e: SessionError) -> ControlMessage {
    ControlMessage::error(e.code(), e.to_string())
}
