//! # Royale Netcode
//!
//! Lockstep netcode for Royale2D: a match relay server and the per-peer
//! input synchronization engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ROYALE NETCODE                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── frame.rs    - Frame inputs, input windows, ack cursors  │
//! │  └── hash.rs     - State digests for desync detection        │
//! │                                                              │
//! │  sync/           - Lockstep engine (no sockets)              │
//! │  ├── input_sync.rs - Redundant input exchange, frame steps   │
//! │  ├── disconnect.rs - Input substitution for dropped players  │
//! │  └── desync.rs     - Digest comparison                       │
//! │                                                              │
//! │  network/        - Networking (non-deterministic)            │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── codec.rs    - Binary framing                            │
//! │  ├── session.rs  - Match session management                  │
//! │  ├── server.rs   - Relay server (WebSocket + UDP)            │
//! │  └── client.rs   - Control client, peer routing, frame loop  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! Every participant hands its simulation the same `FrameStep` sequence:
//! - A frame advances only once every participant's input for it is known
//! - Inputs are never overwritten once recorded
//! - Dropped players are substituted by a rule all participants share
//! - Ordered collections only (`BTreeMap`), so iteration never differs
//!
//! State digests reported to the relay catch any divergence that slips through.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod network;
pub mod sync;

// Re-export commonly used types
pub use crate::core::frame::{Button, FrameInput, FrameInputWindow, FrameNum, InputReader};
pub use crate::core::hash::{StateDigest, StateHasher};
pub use network::protocol::{MatchSettings, PlayerId, PlayerIdentity};
pub use sync::{FrameStep, InputSyncer, Simulation};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Simulation frame rate (Hz)
pub const FRAME_RATE: u32 = 60;
