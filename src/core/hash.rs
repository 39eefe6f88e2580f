//! State Digests for Desync Detection
//!
//! Provides deterministic hashing of simulation state so participants can
//! compare their worlds at a frame boundary without exchanging the state.
//! The simulation layer feeds its state through a [`StateHasher`]; only the
//! 32-byte digest crosses the network.

use sha2::{Sha256, Digest};

use std::collections::BTreeMap;

use super::frame::{FrameNum, FrameInput};
use crate::network::protocol::PlayerId;

/// Digest output type (256 bits / 32 bytes)
pub type StateDigest = [u8; 32];

/// Deterministic hasher for simulation state.
///
/// Wraps SHA-256 with little-endian helpers for primitive fields.
/// Order of updates is critical for determinism.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for world state.
    pub fn for_world_state() -> Self {
        Self::new(b"ROYALE2D_WORLD_STATE_V1")
    }

    /// Create hasher for an input history.
    pub fn for_input_history() -> Self {
        Self::new(b"ROYALE2D_INPUTS_V1")
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a u8 value.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update([value]);
    }

    /// Update with a u16 value (little-endian).
    #[inline]
    pub fn update_u16(&mut self, value: u16) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a u32 value (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with an i32 value (little-endian).
    #[inline]
    pub fn update_i32(&mut self, value: i32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a boolean.
    #[inline]
    pub fn update_bool(&mut self, value: bool) {
        self.update_u8(value as u8);
    }

    /// Update with a length-prefixed string.
    #[inline]
    pub fn update_str(&mut self, value: &str) {
        self.update_u32(value.len() as u32);
        self.hasher.update(value.as_bytes());
    }

    /// Update with a frame input.
    #[inline]
    pub fn update_input(&mut self, input: FrameInput) {
        self.update_u16(input.bits);
    }

    /// Finalize and return the digest.
    pub fn finalize(self) -> StateDigest {
        self.hasher.finalize().into()
    }
}

/// Compute a digest of simulation state at a frame boundary.
///
/// The closure adds state-specific data; the frame number is always hashed
/// first so equal states at different frames never collide.
pub fn compute_state_digest<F>(frame: FrameNum, add_state: F) -> StateDigest
where
    F: FnOnce(&mut StateHasher),
{
    let mut hasher = StateHasher::for_world_state();
    hasher.update_u32(frame);
    add_state(&mut hasher);
    hasher.finalize()
}

/// Digest of an input history, in frame order.
///
/// Two participants that stepped the same frames with the same inputs
/// produce the same value.
pub fn digest_input_history<'a, I>(history: I) -> StateDigest
where
    I: IntoIterator<Item = (FrameNum, &'a BTreeMap<PlayerId, FrameInput>)>,
{
    let mut hasher = StateHasher::for_input_history();
    for (frame, inputs) in history {
        hasher.update_u32(frame);
        hasher.update_u8(inputs.len() as u8);
        for (&player, &input) in inputs {
            hasher.update_u8(player);
            hasher.update_input(input);
        }
    }
    hasher.finalize()
}

/// Short hex form for logs (first 8 bytes).
pub fn short_hex(digest: &StateDigest) -> String {
    hex::encode(&digest[..8])
}

// =============================================================================
// TESTS
// =============================================================================
