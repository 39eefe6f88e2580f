//! Disconnect Handling
//!
//! When a participant drops, the survivors must keep simulating it with input
//! they all agree on. The server collects every survivor's copy of the
//! dropped player's genuine frames, merges them, and synthesizes a fixed run
//! of substitute frames with the match's [`DisconnectPolicy`]. That result is
//! authoritative; clients extend beyond it locally with the same policy, so
//! every survivor sees an identical, gap-free history for the dropped player.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;

use serde::{Serialize, Deserialize};
use tracing::{debug, info};

use crate::core::frame::{FrameInput, FrameInputWindow, FrameNum};
use crate::network::protocol::{PlayerId, MAX_DC_FRAMES};

// =============================================================================
// SUBSTITUTION POLICY
// =============================================================================

/// Produces the input used for a disconnected player's next frame.
pub trait InputSubstitution: Send + Sync {
    /// Input for the frame after one whose input was `previous`.
    fn substitute(&self, previous: FrameInput) -> FrameInput;
}

/// Keep holding whatever the player held last.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepeatLastInput;

impl InputSubstitution for RepeatLastInput {
    fn substitute(&self, previous: FrameInput) -> FrameInput {
        previous
    }
}

/// Release every button.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeutralInput;

impl InputSubstitution for NeutralInput {
    fn substitute(&self, _previous: FrameInput) -> FrameInput {
        FrameInput::NEUTRAL
    }
}

/// Substitution policy selected in the match settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    /// [`NeutralInput`].
    #[default]
    Neutral,
    /// [`RepeatLastInput`].
    RepeatLast,
}

impl DisconnectPolicy {
    /// Substitution function for this policy.
    pub fn substitution(self) -> &'static dyn InputSubstitution {
        match self {
            Self::Neutral => &NeutralInput,
            Self::RepeatLast => &RepeatLastInput,
        }
    }
}

// =============================================================================
// DISCONNECT RECORD
// =============================================================================

/// Outcome of one disconnect event. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectRecord {
    /// Player that dropped.
    pub player_id: PlayerId,
    /// Last frame with genuine input, if any was ever produced.
    pub last_genuine_frame: Option<FrameNum>,
    /// First synthesized frame.
    pub first_synthesized: FrameNum,
    /// Last synthesized frame in the authoritative slice.
    pub last_synthesized: FrameNum,
}

impl DisconnectRecord {
    /// Encoded size in bytes.
    pub const SIZE: usize = 1 + 5 + 4 + 4;

    /// Frames synthesized by the server.
    pub fn synthesized_range(&self) -> RangeInclusive<FrameNum> {
        self.first_synthesized..=self.last_synthesized
    }
}

/// Merge survivor reports and synthesize `count` substitute frames.
///
/// Genuine input is the contiguous run starting at the lowest reported frame;
/// anything after a gap was never seen by every survivor in order and is
/// replaced. Returns the record and every frame survivors must adopt.
pub fn synthesize_frames(
    player_id: PlayerId,
    genuine: &BTreeMap<FrameNum, FrameInput>,
    count: u32,
    substitution: &dyn InputSubstitution,
) -> (DisconnectRecord, BTreeMap<FrameNum, FrameInput>) {
    let mut frames = BTreeMap::new();
    let mut last_genuine = None;
    let mut previous = FrameInput::NEUTRAL;

    if let Some((&first, _)) = genuine.iter().next() {
        let mut expected = first;
        for (&frame, &input) in genuine.range(first..) {
            if frame != expected {
                break;
            }
            frames.insert(frame, input);
            last_genuine = Some(frame);
            previous = input;
            expected += 1;
        }
    }

    let first_synthesized = last_genuine.map(|f| f + 1).unwrap_or(0);
    let count = count.max(1);
    for frame in first_synthesized..first_synthesized + count {
        previous = substitution.substitute(previous);
        frames.insert(frame, previous);
    }

    let record = DisconnectRecord {
        player_id,
        last_genuine_frame: last_genuine,
        first_synthesized,
        last_synthesized: first_synthesized + count - 1,
    };
    (record, frames)
}

/// Drop the oldest frames until at most `limit` remain.
pub fn keep_newest(frames: &mut BTreeMap<FrameNum, FrameInput>, limit: usize) {
    while frames.len() > limit {
        frames.pop_first();
    }
}

// =============================================================================
// SERVER SIDE
// =============================================================================

/// Authoritative result for one disconnected player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDisconnect {
    /// Disconnect record.
    pub record: DisconnectRecord,
    /// Genuine tail plus synthesized frames.
    pub frames: BTreeMap<FrameNum, FrameInput>,
}

#[derive(Debug, Default)]
struct PendingDisconnect {
    reports: BTreeMap<PlayerId, BTreeMap<FrameNum, FrameInput>>,
}

/// Server-side collector of survivor reports.
///
/// Single writer: the relay task of the owning match.
#[derive(Debug)]
pub struct DisconnectCoordinator {
    policy: DisconnectPolicy,
    synth_count: u32,
    pending: BTreeMap<PlayerId, PendingDisconnect>,
    resolved: BTreeMap<PlayerId, ResolvedDisconnect>,
}

impl DisconnectCoordinator {
    /// Create a coordinator. `max_delay_frames + 1` frames are synthesized per event.
    pub fn new(policy: DisconnectPolicy, max_delay_frames: u16) -> Self {
        Self {
            policy,
            synth_count: max_delay_frames as u32 + 1,
            pending: BTreeMap::new(),
            resolved: BTreeMap::new(),
        }
    }

    /// Start collecting reports for a newly disconnected player.
    ///
    /// Returns false if the player is already pending or resolved.
    pub fn begin(&mut self, player_id: PlayerId) -> bool {
        if self.pending.contains_key(&player_id) || self.resolved.contains_key(&player_id) {
            return false;
        }
        debug!(player_id, "Collecting disconnect reports");
        self.pending.insert(player_id, PendingDisconnect::default());
        true
    }

    /// Check if reports are still being collected for a player.
    pub fn is_pending(&self, player_id: PlayerId) -> bool {
        self.pending.contains_key(&player_id)
    }

    /// Authoritative result for a player, once resolved.
    pub fn resolved(&self, player_id: PlayerId) -> Option<&ResolvedDisconnect> {
        self.resolved.get(&player_id)
    }

    /// Record one survivor's view of a disconnected player's frames.
    ///
    /// `live` is the set of connected players. Reports from players outside
    /// it are ignored. Returns the resolution if this report completed it.
    pub fn record_report(
        &mut self,
        reporter: PlayerId,
        disconnector: PlayerId,
        inputs: BTreeMap<FrameNum, FrameInput>,
        live: &BTreeSet<PlayerId>,
    ) -> Option<&ResolvedDisconnect> {
        if !live.contains(&reporter) || reporter == disconnector {
            return None;
        }
        let pending = self.pending.get_mut(&disconnector)?;
        pending.reports.insert(reporter, inputs);

        if live.iter().all(|p| *p == disconnector || pending.reports.contains_key(p)) {
            self.resolve(disconnector);
            return self.resolved.get(&disconnector);
        }
        None
    }

    /// Resolve every pending disconnect whose reports are now complete
    /// (for example after another survivor dropped). Returns resolved ids.
    pub fn poll(&mut self, live: &BTreeSet<PlayerId>) -> Vec<PlayerId> {
        let ready: Vec<PlayerId> = self
            .pending
            .iter()
            .filter(|(id, pending)| live.iter().all(|p| p == *id || pending.reports.contains_key(p)))
            .map(|(id, _)| *id)
            .collect();

        for id in &ready {
            self.resolve(*id);
        }
        ready
    }

    fn resolve(&mut self, player_id: PlayerId) {
        let Some(pending) = self.pending.remove(&player_id) else {
            return;
        };

        let mut union = BTreeMap::new();
        for inputs in pending.reports.into_values() {
            for (frame, input) in inputs {
                union.entry(frame).or_insert(input);
            }
        }

        let (record, mut frames) =
            synthesize_frames(player_id, &union, self.synth_count, self.policy.substitution());
        keep_newest(&mut frames, MAX_DC_FRAMES);
        info!(
            player_id,
            last_genuine = ?record.last_genuine_frame,
            first_synthesized = record.first_synthesized,
            last_synthesized = record.last_synthesized,
            "Disconnect resolved"
        );
        self.resolved.insert(player_id, ResolvedDisconnect { record, frames });
    }
}

// =============================================================================
// CLIENT SIDE
// =============================================================================

/// Frames a survivor reports for a disconnected player: the newest frames it
/// still holds for them, as many as one datagram carries.
pub fn collect_report(window: &FrameInputWindow) -> BTreeMap<FrameNum, FrameInput> {
    let mut frames = window.slice(0, FrameNum::MAX, usize::MAX);
    keep_newest(&mut frames, MAX_DC_FRAMES);
    frames
}

/// Adopt the server's authoritative frames for a disconnected player.
///
/// Everything after the last genuine frame is replaced. Returns the number of
/// frames that disagreed with what the window held.
pub fn apply_authoritative(
    window: &mut FrameInputWindow,
    record: &DisconnectRecord,
    frames: &BTreeMap<FrameNum, FrameInput>,
) -> usize {
    let mut replaced = 0;
    for (&frame, &input) in frames.range(record.first_synthesized..) {
        if window.get(frame).map_or(false, |held| held != input) {
            replaced += 1;
        }
    }

    window.truncate_from(record.first_synthesized);
    for (&frame, &input) in frames {
        window.insert(frame, input);
    }
    replaced
}

/// Extend a disconnected player's window through `through` with locally
/// synthesized input. Only extends a window that already holds the
/// authoritative slice without gaps. Returns frames added.
pub fn extend_synthesized(
    window: &mut FrameInputWindow,
    record: &DisconnectRecord,
    through: FrameNum,
    substitution: &dyn InputSubstitution,
) -> usize {
    let Some(last) = window.last_contiguous() else {
        return 0;
    };
    if last < record.last_synthesized {
        return 0;
    }

    let mut previous = window.get(last).unwrap_or(FrameInput::NEUTRAL);
    let mut added = 0;
    for frame in last + 1..=through {
        previous = substitution.substitute(previous);
        window.insert(frame, previous);
        added += 1;
    }
    added
}

// =============================================================================
// TESTS
// =============================================================================
