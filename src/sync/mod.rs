//! Lockstep synchronization.
//!
//! - `input_sync`: per-frame input exchange with redundant inclusion
//! - `disconnect`: deterministic substitution for dropped players
//! - `desync`: state digest comparison
//!
//! Nothing here touches sockets. The network layer feeds decoded messages in
//! and sends whatever these types produce.

pub mod desync;
pub mod disconnect;
pub mod input_sync;

use thiserror::Error;

use crate::core::hash::StateDigest;
use crate::network::protocol::PlayerId;

pub use desync::{DesyncDetector, DesyncReporter, DesyncVerdict};
pub use disconnect::{
    DisconnectCoordinator, DisconnectPolicy, DisconnectRecord, InputSubstitution, NeutralInput,
    RepeatLastInput, ResolvedDisconnect,
};
pub use input_sync::{FrameStep, InputSyncer, PeerStatus, PeerUnresponsive, SyncConfig, TrafficStats};

/// The deterministic simulation driven by the lockstep engine.
///
/// Implemented by the game layer. `advance` must depend only on the step and
/// the current state.
pub trait Simulation {
    /// Advance exactly one frame.
    fn advance(&mut self, step: &FrameStep);

    /// Digest of the state after the last advanced frame.
    fn state_digest(&self) -> StateDigest;
}

/// Unexpected realtime message. Dropped and logged; never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Message addressed to someone else.
    #[error("message for player {recipient} delivered to player {local}")]
    WrongRecipient {
        /// Addressed player.
        recipient: PlayerId,
        /// Local player.
        local: PlayerId,
    },

    /// Player id not in the match.
    #[error("unknown player {0}")]
    UnknownPlayer(PlayerId),
}
