//! Network Layer
//!
//! Relay server, client roles and the wire format between them.
//! This layer is **non-deterministic** - frame stepping lives in `sync/`.

pub mod client;
pub mod codec;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::{ClientConfig, ClientError, ControlClient, MatchEvent, OnlineMatch, PeerRoute, PeerRouter, RealtimeEndpoint};
pub use codec::{DecodeError, EncodeError};
pub use protocol::{
    ControlMessage, MatchSettings, MessageKind, PlayerId, PlayerIdentity, RealtimeMessage,
    SyncedPlayerData, WireMessage,
};
pub use server::{RelayServer, RelayServerError, ServerConfig};
pub use session::{MatchSession, SessionError, SessionManager, SessionState};
