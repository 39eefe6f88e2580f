//! Protocol Messages
//!
//! Data shapes for the two channels:
//! - **Control** (reliable, ordered): match creation, joining, start, leave.
//! - **Realtime** (unreliable, unordered): peer input, disconnect frames,
//!   desync reports, the periodic match sync broadcast.
//!
//! Every message kind has a stable 1-byte identifier and a fixed channel.
//! Binary encoding lives in [`crate::network::codec`]; control messages also
//! have a JSON text form for debugging.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use crate::core::frame::{FrameInput, FrameNum};
use crate::core::hash::StateDigest;
use crate::sync::disconnect::{DisconnectPolicy, DisconnectRecord};
use crate::sync::input_sync::REMOTE_HISTORY_MARGIN;

/// Server-assigned player identifier. Small, stable for the match lifetime.
pub type PlayerId = u8;

/// Hard upper bound on match capacity.
pub const MAX_PLAYERS: u8 = 16;

/// Longest accepted match name.
pub const MAX_MATCH_NAME_LEN: usize = 32;

/// Largest realtime datagram the codec will produce or accept.
pub const MAX_DATAGRAM_SIZE: usize = 1200;

// =============================================================================
// MESSAGE KINDS
// =============================================================================

/// Delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    /// Reliable, ordered control channel.
    Reliable,
    /// Unreliable, unordered realtime channel.
    Unreliable,
}

/// Closed set of message kinds. The discriminant is the wire identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Server → clients periodic sync.
    MatchSync = 1,
    /// Peer ↔ peer input (direct or relayed).
    PeerInput = 2,
    /// Client → server frames seen from a disconnected player.
    ClientDcFrames = 3,
    /// Server → client authoritative disconnect frames.
    ServerDcFrames = 4,
    /// Client → server state digest report.
    DesyncReport = 5,
    /// Client → server endpoint announcement.
    Hello = 6,

    /// Create a match.
    CreateMatchRequest = 0x30,
    /// Join a match by name.
    JoinMatchRequest = 0x31,
    /// Start a match (creator only).
    StartMatchRequest = 0x32,
    /// Leave a match.
    LeaveMatchRequest = 0x33,
    /// Reply to [`MessageKind::CreateMatchRequest`].
    CreateMatchResponse = 0x40,
    /// Reply to [`MessageKind::JoinMatchRequest`].
    JoinMatchResponse = 0x41,
    /// Reply to [`MessageKind::StartMatchRequest`].
    StartMatchResponse = 0x42,
    /// Reply to [`MessageKind::LeaveMatchRequest`].
    LeaveMatchResponse = 0x43,
    /// Any control request that failed.
    ErrorResponse = 0x4F,
}

impl MessageKind {
    /// Parse a wire identifier.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Self::MatchSync,
            2 => Self::PeerInput,
            3 => Self::ClientDcFrames,
            4 => Self::ServerDcFrames,
            5 => Self::DesyncReport,
            6 => Self::Hello,
            0x30 => Self::CreateMatchRequest,
            0x31 => Self::JoinMatchRequest,
            0x32 => Self::StartMatchRequest,
            0x33 => Self::LeaveMatchRequest,
            0x40 => Self::CreateMatchResponse,
            0x41 => Self::JoinMatchResponse,
            0x42 => Self::StartMatchResponse,
            0x43 => Self::LeaveMatchResponse,
            0x4F => Self::ErrorResponse,
            _ => return None,
        })
    }

    /// Wire identifier.
    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Channel this kind always travels on.
    pub fn channel(self) -> Channel {
        if self.id() < 0x30 {
            Channel::Unreliable
        } else {
            Channel::Reliable
        }
    }
}

/// Implemented by every message struct.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Kind identifier.
    const KIND: MessageKind;

    /// Estimated payload size in bytes (diagnostics and bandwidth accounting).
    fn estimated_size(&self) -> usize;
}

/// Bytes per frame entry in an input map (frame number + input bits).
pub const FRAME_ENTRY_SIZE: usize = 4 + FrameInput::SIZE;

/// Frames one disconnect datagram can carry: header, recipient, record and
/// map length come first.
pub const MAX_DC_FRAMES: usize =
    (MAX_DATAGRAM_SIZE - 3 - 1 - DisconnectRecord::SIZE - 8) / FRAME_ENTRY_SIZE;

/// Ceiling for [`MatchSettings::max_delay_frames`]. The synthesized run plus
/// the genuine tail survivors keep must fit one disconnect datagram.
pub const MAX_DELAY_FRAMES_LIMIT: u16 =
    ((MAX_DC_FRAMES - 1 - REMOTE_HISTORY_MARGIN as usize) / 2) as u16;

// =============================================================================
// MATCH SETTINGS & PLAYERS
// =============================================================================

/// Immutable configuration agreed at match creation.
///
/// Copied verbatim into every join response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSettings {
    /// Name used to find the match (unique on a server).
    pub match_name: String,
    /// Map to load.
    pub map_name: String,
    /// Maximum number of human participants.
    pub capacity: u8,
    /// Team rules instead of free-for-all.
    pub is_teams: bool,
    /// Attempt direct peer-to-peer paths before relaying.
    pub is_p2p: bool,
    /// Seed for the simulation's deterministic RNG.
    pub rng_seed: u32,
    /// Initial input delay in frames.
    pub delay_frames: u16,
    /// Upper bound for the input delay.
    pub max_delay_frames: u16,
    /// Frames between state digest reports.
    pub desync_interval: u32,
    /// How a dropped player's input is substituted.
    pub disconnect_policy: DisconnectPolicy,
}

impl MatchSettings {
    /// Default initial input delay.
    pub const DEFAULT_DELAY_FRAMES: u16 = 3;
    /// Default input delay ceiling.
    pub const DEFAULT_MAX_DELAY_FRAMES: u16 = 30;
    /// Default digest cadence (once a second at 60 Hz).
    pub const DEFAULT_DESYNC_INTERVAL: u32 = 60;

    /// Settings with defaults and a fresh random seed.
    pub fn new(match_name: impl Into<String>, map_name: impl Into<String>) -> Self {
        Self {
            match_name: match_name.into(),
            map_name: map_name.into(),
            capacity: 4,
            is_teams: false,
            is_p2p: true,
            rng_seed: (Uuid::new_v4().as_u128() % 1_000_000_000) as u32 + 1,
            delay_frames: Self::DEFAULT_DELAY_FRAMES,
            max_delay_frames: Self::DEFAULT_MAX_DELAY_FRAMES,
            desync_interval: Self::DEFAULT_DESYNC_INTERVAL,
            disconnect_policy: DisconnectPolicy::Neutral,
        }
    }

    /// Set capacity.
    pub fn with_capacity(mut self, capacity: u8) -> Self {
        self.capacity = capacity;
        self
    }

    /// Check static constraints.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.match_name.trim().is_empty() {
            return Err(ValidationError::EmptyMatchName);
        }
        if self.match_name.len() > MAX_MATCH_NAME_LEN {
            return Err(ValidationError::MatchNameTooLong(self.match_name.len()));
        }
        if self.map_name.trim().is_empty() {
            return Err(ValidationError::EmptyMapName);
        }
        if self.capacity == 0 || self.capacity > MAX_PLAYERS {
            return Err(ValidationError::InvalidCapacity(self.capacity));
        }
        if self.max_delay_frames > MAX_DELAY_FRAMES_LIMIT {
            return Err(ValidationError::MaxDelayTooLarge(self.max_delay_frames));
        }
        if self.delay_frames > self.max_delay_frames {
            return Err(ValidationError::DelayExceedsMax {
                delay: self.delay_frames,
                max: self.max_delay_frames,
            });
        }
        if self.desync_interval == 0 {
            return Err(ValidationError::ZeroDesyncInterval);
        }
        Ok(())
    }
}

/// Match settings that violate static constraints.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Match name is blank.
    #[error("match name is empty")]
    EmptyMatchName,
    /// Match name exceeds [`MAX_MATCH_NAME_LEN`].
    #[error("match name is {0} bytes, limit is 32")]
    MatchNameTooLong(usize),
    /// Map name is blank.
    #[error("map name is empty")]
    EmptyMapName,
    /// Capacity outside 1..=MAX_PLAYERS.
    #[error("capacity {0} outside 1..=16")]
    InvalidCapacity(u8),
    /// Input delay above its ceiling.
    #[error("delay frames {delay} exceed max delay frames {max}")]
    DelayExceedsMax {
        /// Requested delay.
        delay: u16,
        /// Ceiling.
        max: u16,
    },
    /// Input delay ceiling above [`MAX_DELAY_FRAMES_LIMIT`].
    #[error("max delay frames {0} exceed limit {limit}", limit = MAX_DELAY_FRAMES_LIMIT)]
    MaxDelayTooLarge(u16),
    /// Digest cadence of zero frames.
    #[error("desync interval must be at least one frame")]
    ZeroDesyncInterval,
}

/// Identity a client chooses before any network call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerIdentity {
    /// Display name.
    pub name: String,
    /// Cosmetic selector.
    pub skin: String,
    /// Globally unique identifier chosen by the client.
    pub guid: Uuid,
}

impl PlayerIdentity {
    /// Create an identity with a fresh GUID.
    pub fn new(name: impl Into<String>, skin: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            skin: skin.into(),
            guid: Uuid::new_v4(),
        }
    }
}

/// Participant connection state as seen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Player is connected.
    Connected,
    /// Player dropped or left. Final for the match.
    Disconnected,
}

/// Server-assigned view of a participant, broadcast to everyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedPlayerData {
    /// Player identifier.
    pub id: PlayerId,
    /// Display name (de-duplicated within the match).
    pub name: String,
    /// Cosmetic selector.
    pub skin: String,
    /// Client-chosen GUID.
    pub guid: Uuid,
    /// Connection state.
    pub connection: ConnectionState,
    /// Observed UDP endpoint (only shared for peer-to-peer matches).
    pub endpoint: Option<SocketAddr>,
}

impl SyncedPlayerData {
    /// Check if the player is connected.
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }
}

// =============================================================================
// CONTROL MESSAGES
// =============================================================================

/// Create a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMatchRequest {
    /// Requested settings.
    pub settings: MatchSettings,
    /// Creator identity.
    pub player: PlayerIdentity,
}

/// Match created; the creator's seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMatchResponse {
    /// Agreed settings.
    pub settings: MatchSettings,
    /// UDP port of the match relay socket.
    pub relay_port: u16,
    /// Assigned player data.
    pub player: SyncedPlayerData,
}

/// Join a match by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinMatchRequest {
    /// Match to join.
    pub match_name: String,
    /// Joiner identity.
    pub player: PlayerIdentity,
}

/// Match joined; the joiner's seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinMatchResponse {
    /// Agreed settings (identical to the creator's).
    pub settings: MatchSettings,
    /// UDP port of the match relay socket.
    pub relay_port: u16,
    /// Assigned player data.
    pub player: SyncedPlayerData,
}

/// Start a match. Only the creator may do this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMatchRequest {
    /// Match to start.
    pub match_name: String,
    /// GUID of the requesting player.
    pub requester: Uuid,
}

/// Match started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMatchResponse {
    /// Match that started.
    pub match_name: String,
}

/// Leave a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveMatchRequest {
    /// Match to leave.
    pub match_name: String,
    /// GUID of the leaving player.
    pub guid: Uuid,
}

/// Match left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveMatchResponse {
    /// Match that was left.
    pub match_name: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Settings violate static constraints.
    InvalidSettings,
    /// No match with that name.
    MatchNotFound,
    /// Match at capacity.
    MatchFull,
    /// Match name already in use.
    MatchAlreadyExists,
    /// Match no longer accepts joins.
    MatchInProgress,
    /// Requester may not perform this action.
    NotAuthorized,
    /// Too few players to start.
    NotEnoughPlayers,
    /// Match already started.
    AlreadyStarted,
    /// Player not in match.
    PlayerNotFound,
    /// Message could not be decoded or was unexpected.
    InvalidMessage,
    /// Internal error.
    InternalError,
}

/// Control request failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Every message on the reliable channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Create a match.
    CreateMatch(CreateMatchRequest),
    /// Join a match.
    JoinMatch(JoinMatchRequest),
    /// Start a match.
    StartMatch(StartMatchRequest),
    /// Leave a match.
    LeaveMatch(LeaveMatchRequest),
    /// Match created.
    MatchCreated(CreateMatchResponse),
    /// Match joined.
    MatchJoined(JoinMatchResponse),
    /// Match started.
    MatchStarted(StartMatchResponse),
    /// Match left.
    MatchLeft(LeaveMatchResponse),
    /// Request failed.
    Error(ErrorResponse),
}

impl ControlMessage {
    /// Kind identifier.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::CreateMatch(_) => MessageKind::CreateMatchRequest,
            Self::JoinMatch(_) => MessageKind::JoinMatchRequest,
            Self::StartMatch(_) => MessageKind::StartMatchRequest,
            Self::LeaveMatch(_) => MessageKind::LeaveMatchRequest,
            Self::MatchCreated(_) => MessageKind::CreateMatchResponse,
            Self::MatchJoined(_) => MessageKind::JoinMatchResponse,
            Self::MatchStarted(_) => MessageKind::StartMatchResponse,
            Self::MatchLeft(_) => MessageKind::LeaveMatchResponse,
            Self::Error(_) => MessageKind::ErrorResponse,
        }
    }

    /// Build an error reply.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorResponse { code, message: message.into() })
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

macro_rules! control_wire_message {
    ($ty:ty, $kind:ident, $size:expr) => {
        impl WireMessage for $ty {
            const KIND: MessageKind = MessageKind::$kind;

            fn estimated_size(&self) -> usize {
                #[allow(clippy::redundant_closure_call)]
                ($size)(self)
            }
        }
    };
}

fn settings_size(s: &MatchSettings) -> usize {
    s.match_name.len() + s.map_name.len() + 16
}

fn identity_size(p: &PlayerIdentity) -> usize {
    p.name.len() + p.skin.len() + 16
}

fn player_data_size(p: &SyncedPlayerData) -> usize {
    // id + guid + connection + endpoint
    p.name.len() + p.skin.len() + 1 + 16 + 1 + 18
}

control_wire_message!(CreateMatchRequest, CreateMatchRequest, |m: &CreateMatchRequest| {
    settings_size(&m.settings) + identity_size(&m.player)
});
control_wire_message!(CreateMatchResponse, CreateMatchResponse, |m: &CreateMatchResponse| {
    settings_size(&m.settings) + 2 + player_data_size(&m.player)
});
control_wire_message!(JoinMatchRequest, JoinMatchRequest, |m: &JoinMatchRequest| {
    m.match_name.len() + identity_size(&m.player)
});
control_wire_message!(JoinMatchResponse, JoinMatchResponse, |m: &JoinMatchResponse| {
    settings_size(&m.settings) + 2 + player_data_size(&m.player)
});
control_wire_message!(StartMatchRequest, StartMatchRequest, |m: &StartMatchRequest| {
    m.match_name.len() + 16
});
control_wire_message!(StartMatchResponse, StartMatchResponse, |m: &StartMatchResponse| {
    m.match_name.len()
});
control_wire_message!(LeaveMatchRequest, LeaveMatchRequest, |m: &LeaveMatchRequest| {
    m.match_name.len() + 16
});
control_wire_message!(LeaveMatchResponse, LeaveMatchResponse, |m: &LeaveMatchResponse| {
    m.match_name.len()
});
control_wire_message!(ErrorResponse, ErrorResponse, |m: &ErrorResponse| {
    1 + m.message.len()
});

// =============================================================================
// REALTIME MESSAGES
// =============================================================================

/// Periodic server heartbeat carrying the authoritative player list.
///
/// A large roster is spread over several datagrams per broadcast. Each part
/// names every seat in `roster`; entries missing from `players` travel in
/// another part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSyncMessage {
    /// Every seat id in the match.
    pub roster: Vec<PlayerId>,
    /// Participants carried by this part, connected or not.
    pub players: Vec<SyncedPlayerData>,
    /// Match has left the lobby.
    pub match_started: bool,
    /// Sticky desync latch.
    pub desync_detected: bool,
}

/// One sender's unacknowledged inputs for one recipient.
///
/// `inputs` always starts at the recipient's last ack + 1, so any single
/// packet that arrives fills every earlier gap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInputMessage {
    /// Sending player.
    pub sender_id: PlayerId,
    /// Intended recipient (used by the relay).
    pub recipient_id: PlayerId,
    /// Frame → input, oldest first.
    pub inputs: BTreeMap<FrameNum, FrameInput>,
    /// Highest contiguous frame the sender holds from the recipient.
    pub last_acked_frame: Option<FrameNum>,
}

/// A survivor's view of a dropped player's final frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDcFramesMessage {
    /// Reporting survivor.
    pub sender_id: PlayerId,
    /// Player that dropped.
    pub disconnector_id: PlayerId,
    /// Genuine frames the survivor holds for that player.
    pub inputs: BTreeMap<FrameNum, FrameInput>,
}

/// Authoritative frames for a dropped player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDcFramesMessage {
    /// Survivor this copy is addressed to.
    pub recipient_id: PlayerId,
    /// The disconnect record (identical for every survivor).
    pub record: DisconnectRecord,
    /// Genuine tail plus synthesized frames.
    pub frames: BTreeMap<FrameNum, FrameInput>,
}

/// State digest at a frame boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesyncReportMessage {
    /// Reporting player.
    pub sender_id: PlayerId,
    /// Last frame included in the digested state.
    pub frame: FrameNum,
    /// Digest of the simulation state.
    pub digest: StateDigest,
}

/// Endpoint announcement. Repeated as a keepalive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Assigned player id.
    pub player_id: PlayerId,
    /// GUID registered at join time.
    pub guid: Uuid,
}

fn inputs_size(inputs: &BTreeMap<FrameNum, FrameInput>) -> usize {
    inputs.len() * FRAME_ENTRY_SIZE
}

impl WireMessage for MatchSyncMessage {
    const KIND: MessageKind = MessageKind::MatchSync;

    fn estimated_size(&self) -> usize {
        2 + self.roster.len() + self.players.iter().map(player_data_size).sum::<usize>()
    }
}

impl WireMessage for PeerInputMessage {
    const KIND: MessageKind = MessageKind::PeerInput;

    fn estimated_size(&self) -> usize {
        // sender, recipient, last acked frame
        6 + inputs_size(&self.inputs)
    }
}

impl WireMessage for ClientDcFramesMessage {
    const KIND: MessageKind = MessageKind::ClientDcFrames;

    fn estimated_size(&self) -> usize {
        2 + inputs_size(&self.inputs)
    }
}

impl WireMessage for ServerDcFramesMessage {
    const KIND: MessageKind = MessageKind::ServerDcFrames;

    fn estimated_size(&self) -> usize {
        1 + DisconnectRecord::SIZE + inputs_size(&self.frames)
    }
}

impl WireMessage for DesyncReportMessage {
    const KIND: MessageKind = MessageKind::DesyncReport;

    fn estimated_size(&self) -> usize {
        1 + 4 + 32
    }
}

impl WireMessage for HelloMessage {
    const KIND: MessageKind = MessageKind::Hello;

    fn estimated_size(&self) -> usize {
        1 + 16
    }
}

/// Every message on the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeMessage {
    /// Periodic sync broadcast.
    MatchSync(MatchSyncMessage),
    /// Peer input.
    PeerInput(PeerInputMessage),
    /// Survivor disconnect report.
    ClientDcFrames(ClientDcFramesMessage),
    /// Authoritative disconnect frames.
    ServerDcFrames(ServerDcFramesMessage),
    /// Digest report.
    DesyncReport(DesyncReportMessage),
    /// Endpoint announcement.
    Hello(HelloMessage),
}

impl RealtimeMessage {
    /// Kind identifier.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::MatchSync(_) => MessageKind::MatchSync,
            Self::PeerInput(_) => MessageKind::PeerInput,
            Self::ClientDcFrames(_) => MessageKind::ClientDcFrames,
            Self::ServerDcFrames(_) => MessageKind::ServerDcFrames,
            Self::DesyncReport(_) => MessageKind::DesyncReport,
            Self::Hello(_) => MessageKind::Hello,
        }
    }

    /// Estimated payload size in bytes.
    pub fn estimated_size(&self) -> usize {
        match self {
            Self::MatchSync(m) => m.estimated_size(),
            Self::PeerInput(m) => m.estimated_size(),
            Self::ClientDcFrames(m) => m.estimated_size(),
            Self::ServerDcFrames(m) => m.estimated_size(),
            Self::DesyncReport(m) => m.estimated_size(),
            Self::Hello(m) => m.estimated_size(),
        }
    }

    /// Player that originated the message, when it names one.
    pub fn sender_id(&self) -> Option<PlayerId> {
        match self {
            Self::PeerInput(m) => Some(m.sender_id),
            Self::ClientDcFrames(m) => Some(m.sender_id),
            Self::DesyncReport(m) => Some(m.sender_id),
            Self::Hello(m) => Some(m.player_id),
            Self::MatchSync(_) | Self::ServerDcFrames(_) => None,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_ids_and_channels() {
        let realtime = [
            (MessageKind::MatchSync, 1u8),
            (MessageKind::PeerInput, 2),
            (MessageKind::ClientDcFrames, 3),
            (MessageKind::ServerDcFrames, 4),
            (MessageKind::DesyncReport, 5),
            (MessageKind::Hello, 6),
        ];
        for (kind, id) in realtime {
            assert_eq!(kind.id(), id);
            assert_eq!(MessageKind::from_byte(id), Some(kind));
            assert_eq!(kind.channel(), Channel::Unreliable);
        }

        assert_eq!(MessageKind::CreateMatchRequest.channel(), Channel::Reliable);
        assert_eq!(MessageKind::ErrorResponse.channel(), Channel::Reliable);
        assert_eq!(MessageKind::from_byte(0), None);
        assert_eq!(MessageKind::from_byte(0xFF), None);
    }

    #[test]
    fn test_default_settings_are_valid() {
        let settings = MatchSettings::new("friday", "hyrule_field");
        assert!(settings.validate().is_ok());
        assert!(settings.rng_seed >= 1);
    }

    #[test]
    fn test_settings_validation() {
        let base = MatchSettings::new("friday", "hyrule_field");

        let zero = base.clone().with_capacity(0);
        assert_eq!(zero.validate(), Err(ValidationError::InvalidCapacity(0)));

        let huge = base.clone().with_capacity(MAX_PLAYERS + 1);
        assert!(matches!(huge.validate(), Err(ValidationError::InvalidCapacity(_))));

        let mut blank = base.clone();
        blank.match_name = "   ".to_string();
        assert_eq!(blank.validate(), Err(ValidationError::EmptyMatchName));

        let mut no_map = base.clone();
        no_map.map_name.clear();
        assert_eq!(no_map.validate(), Err(ValidationError::EmptyMapName));

        let mut delay = base.clone();
        delay.delay_frames = delay.max_delay_frames + 1;
        assert!(matches!(delay.validate(), Err(ValidationError::DelayExceedsMax { .. })));

        let mut interval = base.clone();
        interval.desync_interval = 0;
        assert_eq!(interval.validate(), Err(ValidationError::ZeroDesyncInterval));

        let mut ceiling = base;
        ceiling.max_delay_frames = MAX_DELAY_FRAMES_LIMIT;
        assert!(ceiling.validate().is_ok());
        ceiling.max_delay_frames = 100;
        assert_eq!(ceiling.validate(), Err(ValidationError::MaxDelayTooLarge(100)));
    }

    #[test]
    fn test_dc_frame_limits() {
        assert_eq!(MAX_DC_FRAMES, 195);
        assert_eq!(MAX_DELAY_FRAMES_LIMIT, 95);
        // Synthesized run plus the genuine tail survivors keep
        let needed = 2 * MAX_DELAY_FRAMES_LIMIT as usize + 1 + REMOTE_HISTORY_MARGIN as usize;
        assert!(needed <= MAX_DC_FRAMES);
    }

    #[test]
    fn test_control_message_json_tags() {
        let msg = ControlMessage::StartMatch(StartMatchRequest {
            match_name: "friday".to_string(),
            requester: Uuid::nil(),
        });
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"start_match\""));

        let parsed = ControlMessage::from_json(&json).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.kind(), MessageKind::StartMatchRequest);
    }

    #[test]
    fn test_error_codes_json() {
        let msg = ControlMessage::error(ErrorCode::MatchFull, "Match is full");
        let json = msg.to_json().unwrap();
        assert!(json.contains("match_full"));
    }

    #[test]
    fn test_peer_input_size_grows_with_window() {
        let mut msg = PeerInputMessage {
            sender_id: 0,
            recipient_id: 1,
            inputs: BTreeMap::new(),
            last_acked_frame: None,
        };
        assert_eq!(msg.estimated_size(), 6);

        for f in 10..13 {
            msg.inputs.insert(f, FrameInput::new(1));
        }
        assert_eq!(msg.estimated_size(), 6 + 3 * FRAME_ENTRY_SIZE);
    }

    #[test]
    fn test_realtime_sender_ids() {
        let report = RealtimeMessage::DesyncReport(DesyncReportMessage {
            sender_id: 3,
            frame: 60,
            digest: [0; 32],
        });
        assert_eq!(report.sender_id(), Some(3));
        assert_eq!(report.kind(), MessageKind::DesyncReport);

        let sync = RealtimeMessage::MatchSync(MatchSyncMessage {
            roster: vec![],
            players: vec![],
            match_started: false,
            desync_detected: false,
        });
        assert_eq!(sync.sender_id(), None);
    }
}
