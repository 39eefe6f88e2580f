//! Core deterministic primitives.
//!
//! Frame inputs, input windows and state digests. Everything here is pure
//! and platform independent so every participant derives identical values.

pub mod frame;
pub mod hash;

// Re-export core types
pub use frame::{AckCursor, Button, FrameInput, FrameInputWindow, FrameNum, InputReader, InsertOutcome};
pub use hash::{compute_state_digest, digest_input_history, StateDigest, StateHasher};
