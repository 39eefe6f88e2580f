//! Client / Peer Role
//!
//! - `ControlClient`: request/response over the WebSocket control channel.
//! - `RealtimeEndpoint`: the local UDP socket.
//! - `PeerRouter`: direct peer path with relay fallback.
//! - `OnlineMatch`: receive task feeding the frame loop; publishes
//!   `MatchEvent`s for the presentation layer.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::frame::{FrameInput, FrameNum};
use crate::network::codec::{DecodeError, EncodeError};
use crate::network::protocol::{
    ControlMessage, CreateMatchRequest, CreateMatchResponse, ErrorCode, HelloMessage,
    JoinMatchRequest, JoinMatchResponse, LeaveMatchRequest, LeaveMatchResponse, MatchSettings,
    MatchSyncMessage, MessageKind, PlayerId, PlayerIdentity, RealtimeMessage, StartMatchRequest,
    StartMatchResponse, SyncedPlayerData,
};
use crate::sync::{DesyncReporter, InputSyncer, Simulation, SyncConfig};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Control request timeout.
    pub request_timeout: Duration,
    /// Silence from the server after which the match is lagging.
    pub sync_timeout: Duration,
    /// Hello cadence.
    pub hello_interval: Duration,
    /// How long to probe a direct peer path before relaying permanently.
    pub direct_path_timeout: Duration,
    /// Silence on an established direct path before relaying permanently.
    pub direct_silence_timeout: Duration,
    /// Frame loop period.
    pub frame_interval: Duration,
    /// Inbound datagram queue between the receive task and the frame loop.
    pub inbound_capacity: usize,
    /// Presentation event buffer.
    pub event_capacity: usize,
    /// Input engine tuning.
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(5),
            hello_interval: Duration::from_millis(250),
            direct_path_timeout: Duration::from_secs(3),
            direct_silence_timeout: Duration::from_secs(1),
            frame_interval: Duration::from_micros(1_000_000 / crate::FRAME_RATE as u64),
            inbound_capacity: 256,
            event_capacity: 64,
            sync: SyncConfig::default(),
        }
    }
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// No answer in time.
    #[error("Request timed out")]
    Timeout,

    /// Control channel closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Server refused the request.
    #[error("Server error ({code:?}): {message}")]
    Server {
        /// Error code.
        code: ErrorCode,
        /// Server message.
        message: String,
    },

    /// Answer of the wrong kind.
    #[error("Unexpected response: {0:?}")]
    UnexpectedResponse(MessageKind),

    /// Encoding error.
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Decoding error.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

// =============================================================================
// CONTROL CLIENT
// =============================================================================

/// Reliable control channel to the relay server.
pub struct ControlClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    request_timeout: Duration,
}

impl ControlClient {
    /// Connect to `ws://host:port`.
    pub async fn connect(url: &str, config: &ClientConfig) -> Result<Self, ClientError> {
        let (ws, _) = timeout(config.request_timeout, connect_async(url))
            .await
            .map_err(|_| ClientError::Timeout)??;
        debug!(url, "Control channel connected");
        Ok(Self { ws, request_timeout: config.request_timeout })
    }

    /// Create a match and take the first seat.
    pub async fn create_match(
        &mut self,
        settings: MatchSettings,
        player: &PlayerIdentity,
    ) -> Result<CreateMatchResponse, ClientError> {
        let request = ControlMessage::CreateMatch(CreateMatchRequest { settings, player: player.clone() });
        match self.request(request).await? {
            ControlMessage::MatchCreated(response) => Ok(response),
            other => Err(ClientError::UnexpectedResponse(other.kind())),
        }
    }

    /// Join a match by name.
    pub async fn join_match(
        &mut self,
        match_name: &str,
        player: &PlayerIdentity,
    ) -> Result<JoinMatchResponse, ClientError> {
        let request = ControlMessage::JoinMatch(JoinMatchRequest {
            match_name: match_name.to_string(),
            player: player.clone(),
        });
        match self.request(request).await? {
            ControlMessage::MatchJoined(response) => Ok(response),
            other => Err(ClientError::UnexpectedResponse(other.kind())),
        }
    }

    /// Start a match. Only its creator may.
    pub async fn start_match(&mut self, match_name: &str, requester: Uuid) -> Result<StartMatchResponse, ClientError> {
        let request = ControlMessage::StartMatch(StartMatchRequest {
            match_name: match_name.to_string(),
            requester,
        });
        match self.request(request).await? {
            ControlMessage::MatchStarted(response) => Ok(response),
            other => Err(ClientError::UnexpectedResponse(other.kind())),
        }
    }

    /// Leave a match.
    pub async fn leave_match(&mut self, match_name: &str, guid: Uuid) -> Result<LeaveMatchResponse, ClientError> {
        let request = ControlMessage::LeaveMatch(LeaveMatchRequest {
            match_name: match_name.to_string(),
            guid,
        });
        match self.request(request).await? {
            ControlMessage::MatchLeft(response) => Ok(response),
            other => Err(ClientError::UnexpectedResponse(other.kind())),
        }
    }

    /// Close the control channel.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.ws.close(None).await?;
        Ok(())
    }

    async fn request(&mut self, request: ControlMessage) -> Result<ControlMessage, ClientError> {
        let bytes = request.encode()?;
        let reply = timeout(self.request_timeout, exchange(&mut self.ws, bytes))
            .await
            .map_err(|_| ClientError::Timeout)??;
        into_result(reply)
    }
}

/// Send one binary frame and wait for the binary reply.
async fn exchange(
    ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
    bytes: Vec<u8>,
) -> Result<ControlMessage, ClientError> {
    ws.send(Message::Binary(bytes)).await?;
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(ControlMessage::decode(&data)?),
            Some(Ok(Message::Close(_))) | None => return Err(ClientError::ConnectionClosed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Turn an error response into `ClientError::Server`.
fn into_result(reply: ControlMessage) -> Result<ControlMessage, ClientError> {
    match reply {
        ControlMessage::Error(e) => Err(ClientError::Server { code: e.code, message: e.message }),
        other => Ok(other),
    }
}

// =============================================================================
// REALTIME ENDPOINT
// =============================================================================

/// Local UDP socket for realtime traffic.
#[derive(Debug, Clone)]
pub struct RealtimeEndpoint {
    socket: Arc<UdpSocket>,
    relay: SocketAddr,
}

impl RealtimeEndpoint {
    /// Bind an ephemeral port of the relay's address family.
    pub async fn bind(relay: SocketAddr) -> Result<Self, ClientError> {
        let local: SocketAddr = if relay.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self { socket: Arc::new(socket), relay })
    }

    /// Relay socket address of the match.
    pub fn relay(&self) -> SocketAddr {
        self.relay
    }

    /// Local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.socket.local_addr()?)
    }

    /// Send one message.
    pub async fn send_to(&self, msg: &RealtimeMessage, addr: SocketAddr) -> Result<usize, ClientError> {
        let bytes = msg.encode()?;
        Ok(self.socket.send_to(&bytes, addr).await?)
    }

    /// Send one message to the relay.
    pub async fn send_to_relay(&self, msg: &RealtimeMessage) -> Result<usize, ClientError> {
        self.send_to(msg, self.relay).await
    }

    /// Spawn the receive task. Decoded messages go to `tx`; when the frame
    /// loop falls behind, datagrams are dropped as the network would.
    fn spawn_receiver(&self, tx: mpsc::Sender<(RealtimeMessage, SocketAddr)>) -> JoinHandle<()> {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("Realtime receive error: {}", e);
                        continue;
                    }
                };
                match RealtimeMessage::decode(&buf[..len]) {
                    Ok(msg) => match tx.try_send((msg, from)) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!(%from, "Inbound queue full, datagram dropped");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    },
                    Err(e) => debug!(%from, "Dropping malformed datagram: {}", e),
                }
            }
        })
    }
}

// =============================================================================
// PEER ROUTER
// =============================================================================

/// How input reaches a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRoute {
    /// Relay plus a direct probe.
    Probing,
    /// Direct only.
    Direct,
    /// Relay only, for the rest of the match.
    Relay,
}

#[derive(Debug, Clone)]
struct PeerPath {
    endpoint: Option<SocketAddr>,
    route: PeerRoute,
    first_seen: Instant,
    last_direct: Option<Instant>,
}

/// Chooses between the direct peer path and the relay.
///
/// Once a peer falls back to the relay it stays there. Dropping the direct
/// path also stops our direct traffic, so the peer's own router sees the
/// same silence and follows.
#[derive(Debug, Clone)]
pub struct PeerRouter {
    relay: SocketAddr,
    direct_path_timeout: Duration,
    direct_silence_timeout: Duration,
    peers: BTreeMap<PlayerId, PeerPath>,
}

impl PeerRouter {
    /// Create a router for a match relayed through `relay`.
    pub fn new(relay: SocketAddr, direct_path_timeout: Duration, direct_silence_timeout: Duration) -> Self {
        Self {
            relay,
            direct_path_timeout,
            direct_silence_timeout,
            peers: BTreeMap::new(),
        }
    }

    /// Learn peer endpoints from a sync broadcast.
    pub fn update_players(&mut self, players: &[SyncedPlayerData], local_id: PlayerId, now: Instant) {
        for player in players.iter().filter(|p| p.id != local_id) {
            let path = self.peers.entry(player.id).or_insert(PeerPath {
                endpoint: None,
                route: PeerRoute::Probing,
                first_seen: now,
                last_direct: None,
            });
            if player.endpoint.is_some() && path.endpoint != player.endpoint && path.route != PeerRoute::Relay {
                path.endpoint = player.endpoint;
                path.route = PeerRoute::Probing;
                path.last_direct = None;
            }
        }
        self.peers.retain(|id, _| players.iter().any(|p| p.id == *id));
    }

    /// Current route to a peer.
    pub fn route(&self, player_id: PlayerId) -> Option<PeerRoute> {
        self.peers.get(&player_id).map(|p| p.route)
    }

    /// Addresses a packet for `player_id` should go to.
    pub fn targets(&self, player_id: PlayerId) -> Vec<SocketAddr> {
        match self.peers.get(&player_id) {
            Some(PeerPath { endpoint: Some(addr), route: PeerRoute::Direct, .. }) => vec![*addr],
            Some(PeerPath { endpoint: Some(addr), route: PeerRoute::Probing, .. }) => vec![self.relay, *addr],
            _ => vec![self.relay],
        }
    }

    /// Peer whose direct endpoint is `addr`.
    pub fn player_at(&self, addr: SocketAddr) -> Option<PlayerId> {
        self.peers
            .iter()
            .find(|(_, p)| p.endpoint == Some(addr))
            .map(|(id, _)| *id)
    }

    /// A packet arrived directly from `player_id`. Returns true if the route
    /// switched to direct.
    pub fn note_direct(&mut self, player_id: PlayerId, now: Instant) -> bool {
        let Some(path) = self.peers.get_mut(&player_id) else {
            return false;
        };
        if path.endpoint.is_none() || path.route == PeerRoute::Relay {
            return false;
        }
        path.last_direct = Some(now);
        if path.route == PeerRoute::Probing {
            path.route = PeerRoute::Direct;
            info!(player_id, "Direct peer path established");
            return true;
        }
        false
    }

    /// Fall back to the relay for direct paths probed too long and for
    /// established ones gone silent. Returns affected peers.
    pub fn expire(&mut self, now: Instant) -> Vec<PlayerId> {
        let mut expired = Vec::new();
        for (&id, path) in self.peers.iter_mut() {
            match path.route {
                PeerRoute::Probing
                    if now.saturating_duration_since(path.first_seen) >= self.direct_path_timeout =>
                {
                    debug!(player_id = id, "Direct path timed out, relaying");
                }
                PeerRoute::Direct
                    if path.last_direct.map_or(true, |at| {
                        now.saturating_duration_since(at) >= self.direct_silence_timeout
                    }) =>
                {
                    warn!(player_id = id, "Direct path went silent, relaying");
                }
                _ => continue,
            }
            path.route = PeerRoute::Relay;
            expired.push(id);
        }
        expired
    }
}

// =============================================================================
// ONLINE MATCH
// =============================================================================

/// Presentation events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchEvent {
    /// Player list changed.
    PlayersChanged(Vec<SyncedPlayerData>),
    /// The match left the lobby.
    MatchStarted,
    /// A peer dropped. Its input is synthesized from now on.
    PlayerDisconnected(PlayerId),
    /// The server saw diverging state digests.
    DesyncDetected,
    /// No sync broadcast for `sync_timeout`. The match is paused.
    ServerUnreachable,
    /// Fewer than two participants remain, or the local player was dropped.
    MatchEnded,
}

/// A joined match: realtime endpoint, lockstep engine and event feed.
pub struct OnlineMatch {
    config: ClientConfig,
    local: SyncedPlayerData,
    endpoint: RealtimeEndpoint,
    router: PeerRouter,
    syncer: InputSyncer,
    reporter: DesyncReporter,
    inbound: mpsc::Receiver<(RealtimeMessage, SocketAddr)>,
    receive_task: JoinHandle<()>,
    events: broadcast::Sender<MatchEvent>,
    players: Vec<SyncedPlayerData>,
    last_sync: Instant,
    last_hello: Option<Instant>,
    started: bool,
    lagging: bool,
    desync_detected: bool,
    ended: bool,
}

impl OnlineMatch {
    /// Open the realtime side of a match after create or join.
    pub async fn connect(
        config: ClientConfig,
        settings: &MatchSettings,
        local: SyncedPlayerData,
        relay: SocketAddr,
    ) -> Result<Self, ClientError> {
        let endpoint = RealtimeEndpoint::bind(relay).await?;
        let (tx, inbound) = mpsc::channel(config.inbound_capacity);
        let receive_task = endpoint.spawn_receiver(tx);
        let (events, _) = broadcast::channel(config.event_capacity);

        info!(
            match_name = %settings.match_name,
            player_id = local.id,
            local_addr = ?endpoint.local_addr().ok(),
            %relay,
            "Realtime endpoint open"
        );

        Ok(Self {
            router: PeerRouter::new(relay, config.direct_path_timeout, config.direct_silence_timeout),
            syncer: InputSyncer::new(local.id, settings, config.sync.clone()),
            reporter: DesyncReporter::new(local.id, settings.desync_interval),
            players: vec![local.clone()],
            config,
            local,
            endpoint,
            inbound,
            receive_task,
            events,
            last_sync: Instant::now(),
            last_hello: None,
            started: false,
            lagging: false,
            desync_detected: false,
            ended: false,
        })
    }

    /// Subscribe to presentation events.
    pub fn subscribe(&self) -> broadcast::Receiver<MatchEvent> {
        self.events.subscribe()
    }

    /// Local player.
    pub fn local_player(&self) -> &SyncedPlayerData {
        &self.local
    }

    /// Last known player list.
    pub fn players(&self) -> &[SyncedPlayerData] {
        &self.players
    }

    /// Lockstep engine.
    pub fn syncer(&self) -> &InputSyncer {
        &self.syncer
    }

    /// Peer routing.
    pub fn router(&self) -> &PeerRouter {
        &self.router
    }

    /// Whether the match has started.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Whether the server has gone quiet.
    pub fn is_lagging(&self) -> bool {
        self.lagging
    }

    /// Whether the server latched a desync.
    pub fn desync_detected(&self) -> bool {
        self.desync_detected
    }

    /// Whether the match is over for this client.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Run the frame loop until the match ends or `shutdown` fires.
    ///
    /// `input` is asked for the local input of each frame the loop records.
    /// Send failures are logged and absorbed; redundant inclusion covers them.
    pub async fn run<S, F>(&mut self, sim: &mut S, mut input: F, mut shutdown: broadcast::Receiver<()>)
    where
        S: Simulation,
        F: FnMut(FrameNum) -> FrameInput,
    {
        let mut frame_interval = interval(self.config.frame_interval);
        frame_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = frame_interval.tick() => {
                    let target = self.syncer.frame() + self.syncer.delay_frames() as FrameNum;
                    self.tick(input(target), sim).await;
                    if self.ended {
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }
    }

    /// One frame of the loop: drain inbound traffic, record local input,
    /// advance at most one frame, then send.
    ///
    /// Returns the frame simulated, if any.
    pub async fn tick<S: Simulation>(&mut self, input: FrameInput, sim: &mut S) -> Option<FrameNum> {
        let now = Instant::now();
        self.pump(now);
        self.check_liveness(now);
        self.send_hello(now).await;

        if !self.started || self.lagging || self.ended {
            return None;
        }

        self.syncer.record_local_input(input);
        let advanced = match self.syncer.try_advance() {
            Some(step) => {
                sim.advance(&step);
                if self.reporter.is_due(step.frame) {
                    if let Some(report) = self.reporter.report(step.frame, sim.state_digest()) {
                        if let Err(e) = self.endpoint.send_to_relay(&RealtimeMessage::DesyncReport(report)).await {
                            warn!(frame = step.frame, "Desync report send failed: {}", e);
                        }
                    }
                }
                Some(step.frame)
            }
            None => None,
        };

        self.flush().await;
        advanced
    }

    /// Send input to every live peer and any pending disconnect reports.
    async fn flush(&mut self) {
        for msg in self.syncer.outgoing_inputs() {
            let targets = self.router.targets(msg.recipient_id);
            let msg = RealtimeMessage::PeerInput(msg);
            for addr in targets {
                if let Err(e) = self.endpoint.send_to(&msg, addr).await {
                    debug!(%addr, "Input send failed: {}", e);
                }
            }
        }
        for report in self.syncer.disconnect_reports() {
            let disconnector = report.disconnector_id;
            if let Err(e) = self.endpoint.send_to_relay(&RealtimeMessage::ClientDcFrames(report)).await {
                warn!(disconnector, "Disconnect report send failed: {}", e);
            }
        }
    }

    async fn send_hello(&mut self, now: Instant) {
        let due = self
            .last_hello
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.hello_interval);
        if due {
            let hello = RealtimeMessage::Hello(HelloMessage {
                player_id: self.local.id,
                guid: self.local.guid,
            });
            if let Err(e) = self.endpoint.send_to_relay(&hello).await {
                warn!(player_id = self.local.id, "Hello send failed: {}", e);
            }
            self.last_hello = Some(now);
        }
    }

    fn pump(&mut self, now: Instant) {
        while let Ok((msg, from)) = self.inbound.try_recv() {
            self.handle_inbound(msg, from, now);
        }
        self.router.expire(now);
    }

    fn check_liveness(&mut self, now: Instant) {
        if !self.lagging && now.saturating_duration_since(self.last_sync) > self.config.sync_timeout {
            self.lagging = true;
            warn!(player_id = self.local.id, "No sync from server, pausing");
            self.emit(MatchEvent::ServerUnreachable);
        }
    }

    fn handle_inbound(&mut self, msg: RealtimeMessage, from: SocketAddr, now: Instant) {
        let from_relay = from == self.endpoint.relay();
        match msg {
            RealtimeMessage::MatchSync(sync) if from_relay => self.apply_sync(sync, now),
            RealtimeMessage::PeerInput(m) => {
                if !from_relay {
                    if self.router.player_at(from) != Some(m.sender_id) {
                        debug!(%from, sender = m.sender_id, "Input from unexpected address");
                        return;
                    }
                    self.router.note_direct(m.sender_id, now);
                }
                if let Err(e) = self.syncer.receive_peer_input(&m) {
                    debug!(%from, "Peer input rejected: {}", e);
                }
            }
            RealtimeMessage::ServerDcFrames(m) if from_relay => match self.syncer.apply_server_dc_frames(&m) {
                Ok(true) => info!(player_id = m.record.player_id, "Disconnect frames adopted"),
                Ok(false) => {}
                Err(e) => debug!("Disconnect frames rejected: {}", e),
            },
            other => debug!(%from, kind = ?other.kind(), "Unexpected datagram"),
        }
    }

    fn apply_sync(&mut self, sync: MatchSyncMessage, now: Instant) {
        self.last_sync = now;
        if self.lagging {
            self.lagging = false;
            info!(player_id = self.local.id, "Server sync resumed");
        }

        // Merge this part into the known list; seats outside the roster are gone
        let mut players: Vec<SyncedPlayerData> = self
            .players
            .iter()
            .filter(|p| sync.roster.contains(&p.id) && !sync.players.iter().any(|s| s.id == p.id))
            .cloned()
            .collect();
        players.extend(sync.players);
        players.sort_by_key(|p| p.id);
        let roster_complete = sync.roster.iter().all(|id| players.iter().any(|p| p.id == *id));

        if players != self.players {
            for id in self.syncer.apply_player_data(&players) {
                self.emit(MatchEvent::PlayerDisconnected(id));
            }
            self.router.update_players(&players, self.local.id, now);
            self.players = players;
            self.emit(MatchEvent::PlayersChanged(self.players.clone()));
        }

        if sync.match_started && !self.started {
            self.started = true;
            info!(player_id = self.local.id, players = self.players.len(), "Match started");
            self.emit(MatchEvent::MatchStarted);
        }

        if sync.desync_detected && !self.desync_detected {
            self.desync_detected = true;
            warn!(frame = self.syncer.frame(), "Server reported desync");
            self.emit(MatchEvent::DesyncDetected);
        }

        if self.started && !self.ended && roster_complete {
            let local_dropped = self.players.iter().any(|p| p.id == self.local.id && !p.is_connected());
            let connected = self.players.iter().filter(|p| p.is_connected()).count();
            if local_dropped || connected < 2 {
                self.ended = true;
                info!(player_id = self.local.id, frame = self.syncer.frame(), "Match ended");
                self.emit(MatchEvent::MatchEnded);
            }
        }
    }

    fn emit(&self, event: MatchEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Drop for OnlineMatch {
    fn drop(&mut self) {
        self.receive_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::StateDigest;
    use crate::network::protocol::{ConnectionState, ErrorResponse};
    use crate::sync::FrameStep;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn player(id: PlayerId, endpoint: Option<SocketAddr>) -> SyncedPlayerData {
        SyncedPlayerData {
            id,
            name: format!("p{}", id),
            skin: "link".to_string(),
            guid: Uuid::new_v4(),
            connection: ConnectionState::Connected,
            endpoint,
        }
    }

    #[derive(Default)]
    struct Counter {
        frames: Vec<FrameNum>,
    }

    impl Simulation for Counter {
        fn advance(&mut self, step: &FrameStep) {
            self.frames.push(step.frame);
        }

        fn state_digest(&self) -> StateDigest {
            [self.frames.len() as u8; 32]
        }
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.sync_timeout, Duration::from_secs(5));
        assert_eq!(config.frame_interval, Duration::from_micros(16_666));
    }

    #[test]
    fn test_error_response_maps_to_server_error() {
        let reply = ControlMessage::Error(ErrorResponse {
            code: ErrorCode::MatchFull,
            message: "Match is full".to_string(),
        });
        match into_result(reply) {
            Err(ClientError::Server { code, .. }) => assert_eq!(code, ErrorCode::MatchFull),
            other => panic!("unexpected {:?}", other.map(|m| m.kind())),
        }
    }

    #[test]
    fn test_router_probes_then_goes_direct() {
        let relay = addr(9000);
        let now = Instant::now();
        let mut router = PeerRouter::new(relay, Duration::from_secs(3), Duration::from_secs(1));
        router.update_players(&[player(0, None), player(1, Some(addr(9101)))], 0, now);

        assert_eq!(router.route(1), Some(PeerRoute::Probing));
        assert_eq!(router.targets(1), vec![relay, addr(9101)]);
        assert_eq!(router.player_at(addr(9101)), Some(1));

        assert!(router.note_direct(1, now));
        assert_eq!(router.targets(1), vec![addr(9101)]);

        // Direct traffic keeps the path alive past the probe timeout
        let later = now + Duration::from_secs(10);
        assert!(!router.note_direct(1, later));
        assert!(router.expire(later).is_empty());
        assert_eq!(router.route(1), Some(PeerRoute::Direct));
    }

    #[test]
    fn test_router_drops_silent_direct_path() {
        let relay = addr(9000);
        let now = Instant::now();
        let mut router = PeerRouter::new(relay, Duration::from_secs(3), Duration::from_secs(1));
        router.update_players(&[player(0, None), player(1, Some(addr(9101)))], 0, now);
        assert!(router.note_direct(1, now));

        assert!(router.expire(now + Duration::from_millis(500)).is_empty());
        assert_eq!(router.expire(now + Duration::from_secs(1)), vec![1]);
        assert_eq!(router.route(1), Some(PeerRoute::Relay));
        assert_eq!(router.targets(1), vec![relay]);

        // Direct packets arriving afterwards do not bring it back
        assert!(!router.note_direct(1, now + Duration::from_secs(2)));
        assert_eq!(router.targets(1), vec![relay]);
    }

    #[test]
    fn test_router_falls_back_to_relay_for_good() {
        let relay = addr(9000);
        let now = Instant::now();
        let mut router = PeerRouter::new(relay, Duration::from_secs(3), Duration::from_secs(1));
        router.update_players(&[player(0, None), player(1, Some(addr(9101)))], 0, now);

        assert_eq!(router.expire(now + Duration::from_secs(3)), vec![1]);
        assert_eq!(router.targets(1), vec![relay]);

        // A late direct packet does not revive the path
        assert!(!router.note_direct(1, now));
        router.update_players(&[player(0, None), player(1, Some(addr(9102)))], 0, now);
        assert_eq!(router.route(1), Some(PeerRoute::Relay));
    }

    #[test]
    fn test_router_without_endpoint_uses_relay() {
        let relay = addr(9000);
        let mut router = PeerRouter::new(relay, Duration::from_secs(3), Duration::from_secs(1));
        router.update_players(&[player(0, None), player(1, None)], 0, Instant::now());

        assert_eq!(router.targets(1), vec![relay]);
        assert!(!router.note_direct(1, Instant::now()));
        assert_eq!(router.targets(7), vec![relay]);
    }

    async fn online_match(relay: SocketAddr) -> OnlineMatch {
        let settings = MatchSettings::new("m", "map").with_capacity(2);
        OnlineMatch::connect(ClientConfig::default(), &settings, player(0, None), relay)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sync_emits_presentation_events() {
        let relay = addr(9000);
        let mut online = online_match(relay).await;
        let mut events = online.subscribe();
        let local = online.local_player().clone();
        let peer = player(1, None);
        let now = Instant::now();

        online.apply_sync(
            MatchSyncMessage {
                roster: vec![0, 1],
                players: vec![local.clone(), peer.clone()],
                match_started: true,
                desync_detected: false,
            },
            now,
        );
        assert!(matches!(events.try_recv(), Ok(MatchEvent::PlayersChanged(p)) if p.len() == 2));
        assert_eq!(events.try_recv().ok(), Some(MatchEvent::MatchStarted));
        assert!(online.is_started());

        let mut dropped = peer.clone();
        dropped.connection = ConnectionState::Disconnected;
        online.apply_sync(
            MatchSyncMessage {
                roster: vec![0, 1],
                players: vec![local, dropped],
                match_started: true,
                desync_detected: true,
            },
            now,
        );
        assert_eq!(events.try_recv().ok(), Some(MatchEvent::PlayerDisconnected(1)));
        assert!(matches!(events.try_recv(), Ok(MatchEvent::PlayersChanged(_))));
        assert_eq!(events.try_recv().ok(), Some(MatchEvent::DesyncDetected));
        assert_eq!(events.try_recv().ok(), Some(MatchEvent::MatchEnded));
        assert!(online.is_ended());
    }

    #[tokio::test]
    async fn test_lagging_pauses_until_sync_resumes() {
        let relay = addr(9000);
        let mut online = online_match(relay).await;
        let mut events = online.subscribe();
        let now = Instant::now();

        online.check_liveness(now + Duration::from_secs(6));
        assert!(online.is_lagging());
        assert_eq!(events.try_recv().ok(), Some(MatchEvent::ServerUnreachable));

        let players = online.players().to_vec();
        online.apply_sync(
            MatchSyncMessage { roster: vec![0], players, match_started: false, desync_detected: false },
            now + Duration::from_secs(7),
        );
        assert!(!online.is_lagging());
    }

    #[tokio::test]
    async fn test_tick_waits_for_start() {
        let relay_socket = UdpSocket::bind(addr(0)).await.unwrap();
        let relay = relay_socket.local_addr().unwrap();
        let mut online = online_match(relay).await;
        let mut sim = Counter::default();

        assert_eq!(online.tick(FrameInput::NEUTRAL, &mut sim).await, None);
        assert!(sim.frames.is_empty());

        // The first tick announces the endpoint to the relay
        let mut buf = [0u8; 64];
        let (len, _) = relay_socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(RealtimeMessage::decode(&buf[..len]).unwrap().kind(), MessageKind::Hello);
    }

    #[tokio::test]
    async fn test_started_match_blocks_on_silent_peer() {
        let relay_socket = UdpSocket::bind(addr(0)).await.unwrap();
        let relay = relay_socket.local_addr().unwrap();
        let mut online = online_match(relay).await;
        let local = online.local_player().clone();
        online.apply_sync(
            MatchSyncMessage {
                roster: vec![0, 1],
                players: vec![local, player(1, None)],
                match_started: true,
                desync_detected: false,
            },
            Instant::now(),
        );

        let mut sim = Counter::default();
        // Peer 1 never sends, so only the local window fills
        for _ in 0..10 {
            online.tick(FrameInput::NEUTRAL, &mut sim).await;
        }
        assert!(sim.frames.is_empty());
        assert!(online.syncer().local_window().len() > 0);
    }

    #[tokio::test]
    async fn test_sync_parts_merge_by_roster() {
        let mut online = online_match(addr(9000)).await;
        let mut events = online.subscribe();
        let local = online.local_player().clone();
        let now = Instant::now();
        let roster = vec![0, 1, 2, 3];

        online.apply_sync(
            MatchSyncMessage {
                roster: roster.clone(),
                players: vec![local.clone(), player(1, None)],
                match_started: true,
                desync_detected: false,
            },
            now,
        );
        // Seats 2 and 3 are still unknown, so the match does not end yet
        let mut dropped = player(1, None);
        dropped.connection = ConnectionState::Disconnected;
        online.apply_sync(
            MatchSyncMessage {
                roster: roster.clone(),
                players: vec![local.clone(), dropped],
                match_started: true,
                desync_detected: false,
            },
            now,
        );
        assert!(!online.is_ended());

        online.apply_sync(
            MatchSyncMessage {
                roster,
                players: vec![player(2, None), player(3, None)],
                match_started: true,
                desync_detected: false,
            },
            now,
        );
        let ids: Vec<_> = online.players().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(!online.is_ended());

        // A seat that left the roster is forgotten
        online.apply_sync(
            MatchSyncMessage { roster: vec![0, 2, 3], players: vec![], match_started: true, desync_detected: false },
            now,
        );
        let ids: Vec<_> = online.players().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![0, 2, 3]);

        let mut changes = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, MatchEvent::PlayersChanged(_)) {
                changes += 1;
            }
        }
        assert_eq!(changes, 4);
    }

    #[tokio::test]
    async fn test_failed_sends_do_not_stop_the_frame_loop() {
        // Broadcast without SO_BROADCAST: every relay send fails
        let relay = SocketAddr::from(([255, 255, 255, 255], 9));
        let settings = MatchSettings::new("m", "map").with_capacity(3);
        let mut online = OnlineMatch::connect(ClientConfig::default(), &settings, player(0, None), relay)
            .await
            .unwrap();
        let local = online.local_player().clone();
        let mut gone = player(2, None);
        gone.connection = ConnectionState::Disconnected;
        online.apply_sync(
            MatchSyncMessage {
                roster: vec![0, 1, 2],
                players: vec![local, player(1, None), gone],
                match_started: true,
                desync_detected: false,
            },
            Instant::now(),
        );
        assert!(!online.syncer().disconnect_reports().is_empty());

        let mut sim = Counter::default();
        for _ in 0..5 {
            assert_eq!(online.tick(FrameInput::NEUTRAL, &mut sim).await, None);
        }
        assert!(!online.is_ended());
        assert!(online.syncer().local_window().len() > 0);
    }
}
