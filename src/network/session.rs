//! Match Session Management
//!
//! Owns match membership on the server: creation, joining, start, leave,
//! player-id assignment and the authoritative `SyncedPlayerData` list. Each
//! match also carries its disconnect coordinator and desync detector, so all
//! per-match authority sits behind one lock.
//!
//! ```text
//!  Lobby ──start──▶ Started ──(< 2 connected | end)──▶ Ended
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::network::codec::encoded_size;
use crate::network::protocol::{
    ClientDcFramesMessage, ConnectionState, DesyncReportMessage, ErrorCode, MatchSettings,
    MatchSyncMessage, PlayerId, PlayerIdentity, SyncedPlayerData, ValidationError,
    MAX_DATAGRAM_SIZE, MAX_PLAYERS,
};
use crate::sync::desync::{DesyncDetector, DesyncVerdict, DEFAULT_MAX_TRACKED_FRAMES};
use crate::sync::disconnect::{DisconnectCoordinator, ResolvedDisconnect};

/// Longest display name before de-duplication suffixes.
pub const MAX_NAME_LEN: usize = 8;

/// Longest cosmetic selector kept.
pub const MAX_SKIN_LEN: usize = 16;

/// Connected players needed to start a match.
pub const MIN_PLAYERS_TO_START: usize = 2;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting joins.
    Lobby,
    /// Frames are being simulated.
    Started,
    /// Terminal.
    Ended,
}

/// A participant as tracked by the server.
#[derive(Debug, Clone)]
pub struct SessionPlayer {
    /// Broadcast view.
    pub data: SyncedPlayerData,
    /// Last time anything arrived from this player.
    pub last_heard: Instant,
}

impl SessionPlayer {
    /// Check if player is connected.
    pub fn is_connected(&self) -> bool {
        self.data.is_connected()
    }
}

/// A match session.
#[derive(Debug)]
pub struct MatchSession {
    /// Agreed settings.
    pub settings: MatchSettings,
    /// UDP relay port.
    pub relay_port: u16,
    /// Current state.
    pub state: SessionState,
    creator: Uuid,
    players: BTreeMap<PlayerId, SessionPlayer>,
    disconnects: DisconnectCoordinator,
    desync: DesyncDetector,
    empty_since: Option<Instant>,
    ended_at: Option<Instant>,
}

impl MatchSession {
    /// Create a session in the lobby. The creator is seated by
    /// [`SessionManager::create_match`].
    pub fn new(settings: MatchSettings, relay_port: u16, creator: Uuid) -> Self {
        let disconnects = DisconnectCoordinator::new(settings.disconnect_policy, settings.max_delay_frames);
        Self {
            settings,
            relay_port,
            state: SessionState::Lobby,
            creator,
            players: BTreeMap::new(),
            disconnects,
            desync: DesyncDetector::new(DEFAULT_MAX_TRACKED_FRAMES),
            empty_since: None,
            ended_at: None,
        }
    }

    /// Match name.
    pub fn name(&self) -> &str {
        &self.settings.match_name
    }

    /// Seat a player. Repeating a request with the same GUID returns the
    /// existing seat.
    pub fn add_player(&mut self, identity: &PlayerIdentity) -> Result<SyncedPlayerData, SessionError> {
        if let Some(existing) = self.player_by_guid(identity.guid) {
            if existing.is_connected() {
                return Ok(existing.data.clone());
            }
            return Err(SessionError::MatchInProgress);
        }

        if self.state != SessionState::Lobby {
            return Err(SessionError::MatchInProgress);
        }
        if self.players.len() >= self.settings.capacity as usize {
            return Err(SessionError::MatchFull);
        }

        let id = (0..MAX_PLAYERS)
            .find(|id| !self.players.contains_key(id))
            .ok_or(SessionError::MatchFull)?;

        let data = SyncedPlayerData {
            id,
            name: self.first_available_name(&identity.name),
            skin: identity.skin.chars().take(MAX_SKIN_LEN).collect(),
            guid: identity.guid,
            connection: ConnectionState::Connected,
            endpoint: None,
        };
        self.players.insert(id, SessionPlayer { data: data.clone(), last_heard: Instant::now() });
        self.empty_since = None;

        info!(match_name = %self.settings.match_name, player_id = id, name = %data.name, "Player joined");
        Ok(data)
    }

    /// Leave. Before start the seat is freed; after start the player is
    /// marked disconnected so survivors substitute its input.
    pub fn remove_player(&mut self, guid: Uuid) -> Result<PlayerId, SessionError> {
        let id = self.player_by_guid(guid).map(|p| p.data.id).ok_or(SessionError::PlayerNotFound)?;

        match self.state {
            SessionState::Lobby => {
                self.players.remove(&id);
                if self.players.is_empty() {
                    self.empty_since = Some(Instant::now());
                }
                info!(match_name = %self.settings.match_name, player_id = id, "Player left lobby");
            }
            SessionState::Started | SessionState::Ended => {
                self.mark_disconnected(id);
            }
        }
        Ok(id)
    }

    /// Start the match. Only the creator may, and only with at least
    /// [`MIN_PLAYERS_TO_START`] players seated.
    pub fn start(&mut self, requester: Uuid) -> Result<(), SessionError> {
        if requester != self.creator {
            return Err(SessionError::NotAuthorized);
        }
        if self.state != SessionState::Lobby {
            return Err(SessionError::AlreadyStarted);
        }
        let seated = self.live_players().len();
        if seated < MIN_PLAYERS_TO_START {
            return Err(SessionError::NotEnoughPlayers(seated));
        }
        self.state = SessionState::Started;
        info!(match_name = %self.settings.match_name, players = self.players.len(), "Match started");
        Ok(())
    }

    /// End the match.
    pub fn end(&mut self) {
        if self.state != SessionState::Ended {
            self.state = SessionState::Ended;
            self.ended_at = Some(Instant::now());
            info!(match_name = %self.settings.match_name, "Match ended");
        }
    }

    /// Mark a player disconnected. Final for the match.
    ///
    /// Returns true if the player was connected.
    pub fn mark_disconnected(&mut self, player_id: PlayerId) -> bool {
        let Some(player) = self.players.get_mut(&player_id) else {
            return false;
        };
        if !player.is_connected() {
            return false;
        }
        player.data.connection = ConnectionState::Disconnected;
        warn!(match_name = %self.settings.match_name, player_id, "Player disconnected");

        if self.state == SessionState::Started {
            self.disconnects.begin(player_id);
            // A survivor dropping may complete other pending disconnects
            let live = self.live_players();
            self.disconnects.poll(&live);
            if live.len() < 2 {
                self.end();
            }
        }
        if self.live_players().is_empty() {
            self.empty_since = Some(Instant::now());
        }
        true
    }

    /// Bind a player's UDP endpoint if the GUID matches the seat.
    pub fn bind_endpoint(&mut self, player_id: PlayerId, guid: Uuid, addr: SocketAddr) -> bool {
        match self.players.get_mut(&player_id) {
            Some(player) if player.data.guid == guid && player.is_connected() => {
                if player.data.endpoint != Some(addr) {
                    debug!(player_id, %addr, "Endpoint bound");
                    player.data.endpoint = Some(addr);
                }
                player.last_heard = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Player bound to a UDP endpoint.
    pub fn player_at(&self, addr: SocketAddr) -> Option<PlayerId> {
        self.players
            .values()
            .find(|p| p.data.endpoint == Some(addr))
            .map(|p| p.data.id)
    }

    /// Endpoint of a connected player.
    pub fn endpoint_of(&self, player_id: PlayerId) -> Option<SocketAddr> {
        self.players
            .get(&player_id)
            .filter(|p| p.is_connected())
            .and_then(|p| p.data.endpoint)
    }

    /// Note traffic from a player.
    pub fn touch(&mut self, player_id: PlayerId, now: Instant) {
        if let Some(player) = self.players.get_mut(&player_id) {
            player.last_heard = now;
        }
    }

    /// Drop players silent for longer than `timeout`. Returns their ids.
    pub fn check_timeouts(&mut self, now: Instant, timeout: Duration) -> Vec<PlayerId> {
        let silent: Vec<PlayerId> = self
            .players
            .values()
            .filter(|p| p.is_connected() && now.saturating_duration_since(p.last_heard) > timeout)
            .map(|p| p.data.id)
            .collect();

        for id in &silent {
            match self.state {
                SessionState::Lobby => {
                    if let Some(guid) = self.players.get(id).map(|p| p.data.guid) {
                        if let Err(e) = self.remove_player(guid) {
                            debug!(player_id = id, "Timed out seat not released: {}", e);
                        }
                    }
                }
                _ => {
                    self.mark_disconnected(*id);
                }
            }
        }
        silent
    }

    /// Handle a survivor's disconnect report.
    ///
    /// A report naming a player the server still considers connected is an
    /// escalation: accepted only if that player has been silent for `grace`.
    /// Returns the authoritative frames once every survivor reported.
    pub fn record_dc_report(
        &mut self,
        report: &ClientDcFramesMessage,
        now: Instant,
        grace: Duration,
    ) -> Option<ResolvedDisconnect> {
        if self.state == SessionState::Lobby {
            return None;
        }
        let suspect = report.disconnector_id;
        let suspect_connected = self.players.get(&suspect).map(|p| p.is_connected())?;

        if suspect_connected {
            let silent_for = self
                .players
                .get(&suspect)
                .map(|p| now.saturating_duration_since(p.last_heard))
                .unwrap_or_default();
            if silent_for < grace {
                debug!(reporter = report.sender_id, suspect, ?silent_for, "Escalation rejected");
                return None;
            }
            info!(reporter = report.sender_id, suspect, ?silent_for, "Escalation accepted");
            self.mark_disconnected(suspect);
        }

        if let Some(resolved) = self.disconnects.resolved(suspect) {
            return Some(resolved.clone());
        }
        let live = self.live_players();
        self.disconnects
            .record_report(report.sender_id, suspect, report.inputs.clone(), &live)
            .cloned()
    }

    /// Authoritative frames for a disconnected player, once resolved.
    pub fn resolved_disconnect(&self, player_id: PlayerId) -> Option<&ResolvedDisconnect> {
        self.disconnects.resolved(player_id)
    }

    /// Disconnected players whose frames are resolved.
    pub fn resolved_disconnects(&self) -> Vec<&ResolvedDisconnect> {
        self.players
            .keys()
            .filter_map(|id| self.disconnects.resolved(*id))
            .collect()
    }

    /// Handle a digest report.
    pub fn record_desync_report(&mut self, report: &DesyncReportMessage) -> Option<DesyncVerdict> {
        if self.state != SessionState::Started {
            return None;
        }
        let live = self.live_players();
        self.desync.record(report.sender_id, report.frame, report.digest, &live)
    }

    /// Sticky desync flag.
    pub fn desync_detected(&self) -> bool {
        self.desync.desync_detected()
    }

    /// Connected player ids.
    pub fn live_players(&self) -> BTreeSet<PlayerId> {
        self.players
            .values()
            .filter(|p| p.is_connected())
            .map(|p| p.data.id)
            .collect()
    }

    /// All seats, connected or not.
    pub fn players(&self) -> impl Iterator<Item = &SyncedPlayerData> {
        self.players.values().map(|p| &p.data)
    }

    /// Number of seats.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Periodic sync broadcast, split into parts that each fit one datagram.
    /// Endpoints are shared only for peer-to-peer matches.
    pub fn sync_messages(&self) -> Vec<MatchSyncMessage> {
        let share_endpoints = self.settings.is_p2p;
        let empty = MatchSyncMessage {
            roster: self.players.keys().copied().collect(),
            players: Vec::new(),
            match_started: self.state != SessionState::Lobby,
            desync_detected: self.desync.desync_detected(),
        };

        let mut parts = Vec::new();
        let mut current = empty.clone();
        for player in self.players.values() {
            let mut data = player.data.clone();
            if !share_endpoints {
                data.endpoint = None;
            }
            current.players.push(data);

            let fits = encoded_size(&current).map_or(false, |size| size <= MAX_DATAGRAM_SIZE);
            if !fits && current.players.len() > 1 {
                let overflow = current.players.pop();
                parts.push(std::mem::replace(&mut current, empty.clone()));
                current.players.extend(overflow);
            }
        }
        parts.push(current);
        parts
    }

    /// Whether the match should be torn down.
    pub fn should_close(&self, now: Instant, empty_timeout: Duration, ended_linger: Duration) -> bool {
        if let Some(since) = self.empty_since {
            if self.live_players().is_empty() && now.saturating_duration_since(since) >= empty_timeout {
                return true;
            }
        }
        matches!(self.ended_at, Some(at) if now.saturating_duration_since(at) >= ended_linger)
    }

    fn player_by_guid(&self, guid: Uuid) -> Option<&SessionPlayer> {
        self.players.values().find(|p| p.data.guid == guid)
    }

    fn first_available_name(&self, requested: &str) -> String {
        let mut name: String = requested.trim().chars().take(MAX_NAME_LEN).collect();
        if name.is_empty() {
            name = "player".to_string();
        }

        let taken = |candidate: &str| self.players.values().any(|p| p.data.name == candidate);
        for _ in 0..(MAX_PLAYERS as usize * 10) {
            if !taken(&name) {
                return name;
            }
            name = next_name_candidate(&name);
        }
        name
    }
}

/// `bob` → `bob1` → … → `bob9` → `bob9(1)`.
fn next_name_candidate(name: &str) -> String {
    let mut chars: Vec<char> = name.chars().collect();
    match chars.last().copied() {
        Some(c) if c.is_ascii_digit() && c != '9' => {
            let last = chars.len() - 1;
            chars[last] = (c as u8 + 1) as char;
            chars.into_iter().collect()
        }
        Some('9') => format!("{}(1)", name),
        _ => {
            if chars.len() >= MAX_NAME_LEN {
                chars.pop();
            }
            chars.push('1');
            chars.into_iter().collect()
        }
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Settings rejected.
    #[error("Invalid settings: {0}")]
    InvalidSettings(#[from] ValidationError),

    /// No match with that name.
    #[error("Match not found")]
    MatchNotFound,

    /// Match at capacity.
    #[error("Match is full")]
    MatchFull,

    /// Requester may not start the match.
    #[error("Only the match creator may start the match")]
    NotAuthorized,

    /// Too few connected players to start.
    #[error("At least 2 players are needed to start, {0} connected")]
    NotEnoughPlayers(usize),

    /// Match already started.
    #[error("Match already started")]
    AlreadyStarted,

    /// Match name in use.
    #[error("Match already exists")]
    MatchAlreadyExists,

    /// Match no longer accepts joins.
    #[error("Match in progress")]
    MatchInProgress,

    /// GUID not seated in the match.
    #[error("Player not found")]
    PlayerNotFound,

    /// Every relay port is in use.
    #[error("No relay port available")]
    NoPortAvailable,
}

impl SessionError {
    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidSettings(_) => ErrorCode::InvalidSettings,
            Self::MatchNotFound => ErrorCode::MatchNotFound,
            Self::MatchFull => ErrorCode::MatchFull,
            Self::NotAuthorized => ErrorCode::NotAuthorized,
            Self::NotEnoughPlayers(_) => ErrorCode::NotEnoughPlayers,
            Self::AlreadyStarted => ErrorCode::AlreadyStarted,
            Self::MatchAlreadyExists => ErrorCode::MatchAlreadyExists,
            Self::MatchInProgress => ErrorCode::MatchInProgress,
            Self::PlayerNotFound => ErrorCode::PlayerNotFound,
            Self::NoPortAvailable => ErrorCode::InternalError,
        }
    }
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// A seat handed back by create or join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatAssignment {
    /// Agreed settings.
    pub settings: MatchSettings,
    /// UDP relay port.
    pub relay_port: u16,
    /// Assigned player data.
    pub player: SyncedPlayerData,
    /// True when this request created a new match.
    pub created: bool,
}

/// Manages all matches on a server.
pub struct SessionManager {
    sessions: RwLock<BTreeMap<String, Arc<RwLock<MatchSession>>>>,
    base_port: u16,
    port_count: u16,
}

impl SessionManager {
    /// Create a manager that hands out relay ports in `base_port..base_port + port_count`.
    pub fn new(base_port: u16, port_count: u16) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            base_port,
            port_count,
        }
    }

    /// Create a match and seat its creator.
    ///
    /// Repeating the request with the creator's GUID returns the existing seat.
    pub async fn create_match(
        &self,
        settings: MatchSettings,
        creator: &PlayerIdentity,
    ) -> Result<SeatAssignment, SessionError> {
        settings.validate()?;

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&settings.match_name) {
            let mut session = existing.write().await;
            if session.players().any(|p| p.guid == creator.guid) {
                let player = session.add_player(creator)?;
                return Ok(SeatAssignment {
                    settings: session.settings.clone(),
                    relay_port: session.relay_port,
                    player,
                    created: false,
                });
            }
            return Err(SessionError::MatchAlreadyExists);
        }

        let mut used = BTreeSet::new();
        for session in sessions.values() {
            used.insert(session.read().await.relay_port);
        }
        let relay_port = (0..self.port_count)
            .filter_map(|i| self.base_port.checked_add(i))
            .find(|port| !used.contains(port))
            .ok_or(SessionError::NoPortAvailable)?;

        let mut session = MatchSession::new(settings, relay_port, creator.guid);
        let player = session.add_player(creator)?;
        let assignment = SeatAssignment {
            settings: session.settings.clone(),
            relay_port,
            player,
            created: true,
        };

        info!(match_name = %assignment.settings.match_name, relay_port, "Match created");
        sessions.insert(assignment.settings.match_name.clone(), Arc::new(RwLock::new(session)));
        Ok(assignment)
    }

    /// Join a match by name.
    pub async fn join_match(
        &self,
        match_name: &str,
        identity: &PlayerIdentity,
    ) -> Result<SeatAssignment, SessionError> {
        let session = self.get(match_name).await.ok_or(SessionError::MatchNotFound)?;
        let mut session = session.write().await;
        let player = session.add_player(identity)?;
        Ok(SeatAssignment {
            settings: session.settings.clone(),
            relay_port: session.relay_port,
            player,
            created: false,
        })
    }

    /// Start a match.
    pub async fn start_match(&self, match_name: &str, requester: Uuid) -> Result<(), SessionError> {
        let session = self.get(match_name).await.ok_or(SessionError::MatchNotFound)?;
        let mut session = session.write().await;
        session.start(requester)
    }

    /// Leave a match.
    pub async fn leave_match(&self, match_name: &str, guid: Uuid) -> Result<PlayerId, SessionError> {
        let session = self.get(match_name).await.ok_or(SessionError::MatchNotFound)?;
        let mut session = session.write().await;
        session.remove_player(guid)
    }

    /// Get a match by name.
    pub async fn get(&self, match_name: &str) -> Option<Arc<RwLock<MatchSession>>> {
        let sessions = self.sessions.read().await;
        sessions.get(match_name).cloned()
    }

    /// Remove a match, releasing its name and port.
    pub async fn remove(&self, match_name: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        sessions.remove(match_name).is_some()
    }

    /// Number of matches.
    pub async fn match_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::core::frame::FrameInput;
    use crate::network::protocol::RealtimeMessage;

    fn manager() -> SessionManager {
        SessionManager::new(17_000, 8)
    }

    fn settings(name: &str, capacity: u8) -> MatchSettings {
        MatchSettings::new(name, "hyrule_field").with_capacity(capacity)
    }

    fn session_with(names: &[&str]) -> (MatchSession, Vec<PlayerIdentity>) {
        let ids: Vec<PlayerIdentity> = names.iter().map(|n| PlayerIdentity::new(*n, "link")).collect();
        let mut session = MatchSession::new(settings("m", 8), 17_000, ids[0].guid);
        for id in &ids {
            session.add_player(id).unwrap();
        }
        (session, ids)
    }

    #[tokio::test]
    async fn test_create_join_start_scenario() {
        let manager = manager();
        let alice = PlayerIdentity::new("alice", "link");
        let bob = PlayerIdentity::new("bob", "zelda");

        let created = manager.create_match(settings("friday", 2), &alice).await.unwrap();
        assert!(created.created);
        assert_eq!(created.player.id, 0);

        let joined = manager.join_match("friday", &bob).await.unwrap();
        assert_eq!(joined.player.id, 1);
        assert_eq!(joined.settings, created.settings);
        assert_eq!(joined.relay_port, created.relay_port);

        manager.start_match("friday", alice.guid).await.unwrap();
        let session = manager.get("friday").await.unwrap();
        let parts = session.read().await.sync_messages();
        assert_eq!(parts.len(), 1);
        assert!(parts[0].match_started);
        assert_eq!(parts[0].players.len(), 2);
        assert_eq!(parts[0].roster, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_settings() {
        let manager = manager();
        let result = manager.create_match(settings("bad", 0), &PlayerIdentity::new("a", "b")).await;
        assert!(matches!(result, Err(SessionError::InvalidSettings(ValidationError::InvalidCapacity(0)))));
        assert_eq!(manager.match_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_match_name() {
        let manager = manager();
        manager.create_match(settings("dup", 2), &PlayerIdentity::new("a", "x")).await.unwrap();
        let other = manager.create_match(settings("dup", 2), &PlayerIdentity::new("b", "x")).await;
        assert_eq!(other, Err(SessionError::MatchAlreadyExists));
    }

    #[tokio::test]
    async fn test_create_and_join_are_idempotent() {
        let manager = manager();
        let alice = PlayerIdentity::new("alice", "link");
        let bob = PlayerIdentity::new("bob", "link");

        let first = manager.create_match(settings("m", 4), &alice).await.unwrap();
        let again = manager.create_match(settings("m", 4), &alice).await.unwrap();
        assert!(!again.created);
        assert_eq!(again.player, first.player);

        let b1 = manager.join_match("m", &bob).await.unwrap();
        let b2 = manager.join_match("m", &bob).await.unwrap();
        assert_eq!(b1.player, b2.player);

        let session = manager.get("m").await.unwrap();
        assert_eq!(session.read().await.player_count(), 2);
    }

    #[tokio::test]
    async fn test_join_errors() {
        let manager = manager();
        let missing = manager.join_match("nope", &PlayerIdentity::new("a", "b")).await;
        assert_eq!(missing, Err(SessionError::MatchNotFound));

        let host = PlayerIdentity::new("host", "x");
        manager.create_match(settings("full", 1), &host).await.unwrap();
        let full = manager.join_match("full", &PlayerIdentity::new("late", "x")).await;
        assert_eq!(full, Err(SessionError::MatchFull));

        manager.create_match(settings("live", 4), &host).await.unwrap();
        manager.join_match("live", &PlayerIdentity::new("guest", "x")).await.unwrap();
        manager.start_match("live", host.guid).await.unwrap();
        let late = manager.join_match("live", &PlayerIdentity::new("late", "x")).await;
        assert_eq!(late, Err(SessionError::MatchInProgress));
    }

    #[tokio::test]
    async fn test_start_authorization() {
        let manager = manager();
        let host = PlayerIdentity::new("host", "x");
        let guest = PlayerIdentity::new("guest", "x");
        manager.create_match(settings("m", 2), &host).await.unwrap();
        manager.join_match("m", &guest).await.unwrap();

        assert_eq!(manager.start_match("m", guest.guid).await, Err(SessionError::NotAuthorized));
        manager.start_match("m", host.guid).await.unwrap();
        assert_eq!(manager.start_match("m", host.guid).await, Err(SessionError::AlreadyStarted));
    }

    #[tokio::test]
    async fn test_relay_ports_are_first_available() {
        let manager = SessionManager::new(17_000, 2);
        let p = PlayerIdentity::new("p", "x");
        let a = manager.create_match(settings("a", 2), &p).await.unwrap();
        let b = manager.create_match(settings("b", 2), &PlayerIdentity::new("q", "x")).await.unwrap();
        assert_eq!((a.relay_port, b.relay_port), (17_000, 17_001));

        let none = manager.create_match(settings("c", 2), &PlayerIdentity::new("r", "x")).await;
        assert_eq!(none, Err(SessionError::NoPortAvailable));

        manager.remove("a").await;
        let c = manager.create_match(settings("c", 2), &PlayerIdentity::new("r", "x")).await.unwrap();
        assert_eq!(c.relay_port, 17_000);
    }

    #[test]
    fn test_name_deduplication() {
        let (session, _) = session_with(&["bob", "bob", "bob"]);
        let names: Vec<_> = session.players().map(|p| p.name.clone()).collect();
        assert_eq!(names, vec!["bob", "bob1", "bob2"]);

        assert_eq!(next_name_candidate("bob9"), "bob9(1)");
        assert_eq!(next_name_candidate("longname"), "longnam1");
        assert_eq!(next_name_candidate("abc"), "abc1");
    }

    #[test]
    fn test_names_are_capped() {
        let (session, _) = session_with(&["averyverylongname", "  "]);
        let names: Vec<_> = session.players().map(|p| p.name.clone()).collect();
        assert_eq!(names, vec!["averyver", "player"]);
    }

    #[test]
    fn test_player_ids_reuse_lowest_free() {
        let (mut session, ids) = session_with(&["a", "b", "c"]);
        assert_eq!(session.remove_player(ids[1].guid), Ok(1));

        let d = session.add_player(&PlayerIdentity::new("d", "x")).unwrap();
        assert_eq!(d.id, 1);
    }

    #[test]
    fn test_leave_after_start_marks_disconnected() {
        let (mut session, ids) = session_with(&["a", "b", "c"]);
        session.start(ids[0].guid).unwrap();

        assert_eq!(session.remove_player(ids[2].guid), Ok(2));
        assert_eq!(session.player_count(), 3);
        assert_eq!(session.live_players().len(), 2);
        assert_eq!(session.state, SessionState::Started);

        // A second drop leaves fewer than two connected
        session.remove_player(ids[1].guid).unwrap();
        assert_eq!(session.state, SessionState::Ended);

        assert_eq!(session.remove_player(Uuid::new_v4()), Err(SessionError::PlayerNotFound));
    }

    #[test]
    fn test_rejoin_after_drop_is_refused() {
        let (mut session, ids) = session_with(&["a", "b", "c"]);
        session.start(ids[0].guid).unwrap();
        session.mark_disconnected(2);
        assert_eq!(session.add_player(&ids[2]), Err(SessionError::MatchInProgress));
    }

    #[test]
    fn test_endpoint_binding_checks_guid() {
        let (mut session, ids) = session_with(&["a", "b"]);
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        assert!(!session.bind_endpoint(1, ids[0].guid, addr));
        assert!(session.bind_endpoint(1, ids[1].guid, addr));
        assert_eq!(session.player_at(addr), Some(1));
        assert_eq!(session.endpoint_of(1), Some(addr));
    }

    #[test]
    fn test_sync_hides_endpoints_without_p2p() {
        let (mut session, ids) = session_with(&["a", "b"]);
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        session.bind_endpoint(0, ids[0].guid, addr);

        assert_eq!(session.sync_messages()[0].players[0].endpoint, Some(addr));
        session.settings.is_p2p = false;
        assert_eq!(session.sync_messages()[0].players[0].endpoint, None);
    }

    #[test]
    fn test_start_needs_two_players() {
        let (mut solo, ids) = session_with(&["a"]);
        assert_eq!(solo.start(ids[0].guid), Err(SessionError::NotEnoughPlayers(1)));
        assert_eq!(solo.state, SessionState::Lobby);
        assert_eq!(SessionError::NotEnoughPlayers(1).code(), ErrorCode::NotEnoughPlayers);

        let guest = PlayerIdentity::new("b", "x");
        solo.add_player(&guest).unwrap();
        solo.start(ids[0].guid).unwrap();
        assert_eq!(solo.state, SessionState::Started);
    }

    #[test]
    fn test_full_roster_sync_fits_datagrams() {
        let ids: Vec<PlayerIdentity> = (0..MAX_PLAYERS)
            .map(|i| PlayerIdentity::new(format!("player{:02}", i), "skin_abcdefghijk"))
            .collect();
        let mut session = MatchSession::new(settings("m", MAX_PLAYERS), 17_000, ids[0].guid);
        for (i, id) in ids.iter().enumerate() {
            session.add_player(id).unwrap();
            let addr: SocketAddr = format!("[2001:db8::{}]:40000", i + 1).parse().unwrap();
            assert!(session.bind_endpoint(i as PlayerId, id.guid, addr));
        }
        session.start(ids[0].guid).unwrap();

        let parts = session.sync_messages();
        assert!(parts.len() > 1);

        let mut seen = Vec::new();
        for part in &parts {
            let bytes = RealtimeMessage::MatchSync(part.clone()).encode().unwrap();
            assert!(bytes.len() <= MAX_DATAGRAM_SIZE);
            assert_eq!(part.roster.len(), MAX_PLAYERS as usize);
            assert!(part.match_started);
            seen.extend(part.players.iter().map(|p| p.id));
        }
        assert_eq!(seen, (0..MAX_PLAYERS).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_lobby_sync_is_one_part() {
        let (mut session, ids) = session_with(&["a"]);
        session.remove_player(ids[0].guid).unwrap();
        let parts = session.sync_messages();
        assert_eq!(parts.len(), 1);
        assert!(parts[0].players.is_empty());
        assert!(parts[0].roster.is_empty());
    }

    #[test]
    fn test_timeouts() {
        let (mut session, ids) = session_with(&["a", "b", "c"]);
        session.start(ids[0].guid).unwrap();

        let later = Instant::now() + Duration::from_secs(10);
        session.touch(0, later);
        session.touch(1, later);

        let dropped = session.check_timeouts(later, Duration::from_secs(5));
        assert_eq!(dropped, vec![2]);
        assert!(!session.live_players().contains(&2));
        assert!(session.check_timeouts(later, Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn test_lobby_timeouts_free_seats() {
        let (mut session, _) = session_with(&["a", "b"]);
        let later = Instant::now() + Duration::from_secs(10);
        session.touch(0, later);

        assert_eq!(session.check_timeouts(later, Duration::from_secs(5)), vec![1]);
        assert_eq!(session.player_count(), 1);
        assert_eq!(session.state, SessionState::Lobby);
    }

    #[test]
    fn test_disconnect_reports_resolve_for_all_survivors() {
        let (mut session, ids) = session_with(&["a", "b", "c"]);
        session.start(ids[0].guid).unwrap();
        session.mark_disconnected(1);

        let frames = |range: std::ops::RangeInclusive<u32>| -> BTreeMap<u32, FrameInput> {
            range.map(|f| (f, FrameInput::new(3))).collect()
        };
        let now = Instant::now();
        let grace = Duration::from_secs(1);

        let r0 = ClientDcFramesMessage { sender_id: 0, disconnector_id: 1, inputs: frames(20..=50) };
        assert!(session.record_dc_report(&r0, now, grace).is_none());

        let r2 = ClientDcFramesMessage { sender_id: 2, disconnector_id: 1, inputs: frames(18..=48) };
        let resolved = session.record_dc_report(&r2, now, grace).unwrap();
        assert_eq!(resolved.record.last_genuine_frame, Some(50));

        // Late reports get the same answer
        let again = session.record_dc_report(&r0, now, grace).unwrap();
        assert_eq!(again, resolved);
        assert_eq!(session.resolved_disconnects().len(), 1);
    }

    #[test]
    fn test_escalation_requires_silence() {
        let (mut session, ids) = session_with(&["a", "b", "c"]);
        session.start(ids[0].guid).unwrap();
        let report = ClientDcFramesMessage { sender_id: 0, disconnector_id: 1, inputs: BTreeMap::new() };

        let now = Instant::now();
        assert!(session.record_dc_report(&report, now, Duration::from_secs(2)).is_none());
        assert!(session.live_players().contains(&1));

        let later = now + Duration::from_secs(3);
        session.touch(0, later);
        session.touch(2, later);
        session.record_dc_report(&report, later, Duration::from_secs(2));
        assert!(!session.live_players().contains(&1));
    }

    #[test]
    fn test_desync_latches_in_sync_message() {
        let (mut session, ids) = session_with(&["a", "b"]);
        session.start(ids[0].guid).unwrap();

        session.record_desync_report(&DesyncReportMessage { sender_id: 0, frame: 100, digest: [1; 32] });
        session.record_desync_report(&DesyncReportMessage { sender_id: 1, frame: 100, digest: [2; 32] });
        assert!(session.sync_messages()[0].desync_detected);

        session.record_desync_report(&DesyncReportMessage { sender_id: 0, frame: 160, digest: [5; 32] });
        session.record_desync_report(&DesyncReportMessage { sender_id: 1, frame: 160, digest: [5; 32] });
        assert!(session.sync_messages()[0].desync_detected);
    }

    #[test]
    fn test_should_close() {
        let (mut session, ids) = session_with(&["a"]);
        let now = Instant::now();
        let five = Duration::from_secs(5);
        assert!(!session.should_close(now + five * 2, five, five));

        session.remove_player(ids[0].guid).unwrap();
        assert!(!session.should_close(Instant::now(), five, five));
        assert!(session.should_close(Instant::now() + five * 2, five, five));
    }
}
