//! Frame Inputs and Input Windows
//!
//! Per-frame player input and the per-sender window of frames that the
//! lockstep engine exchanges. Uses BTreeMap so iteration (and therefore
//! encoding) is always in frame order.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};

/// Simulation frame number. Monotonically increasing, unique per match.
pub type FrameNum = u32;

// =============================================================================
// FRAME INPUT
// =============================================================================

/// Logical buttons packed into a [`FrameInput`].
///
/// Bit layout is MSB-first: `Up` is bit 15, `ItemRight` is bit 6.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Button {
    /// Move up.
    Up = 0,
    /// Move down.
    Down = 1,
    /// Move left.
    Left = 2,
    /// Move right.
    Right = 3,
    /// Primary attack.
    Attack = 4,
    /// Context action (talk, lift, open).
    Action = 5,
    /// Use selected item.
    Item = 6,
    /// Throw held object.
    Toss = 7,
    /// Cycle item selection left.
    ItemLeft = 8,
    /// Cycle item selection right.
    ItemRight = 9,
}

impl Button {
    /// All buttons in bit order.
    pub const ALL: [Button; 10] = [
        Button::Up,
        Button::Down,
        Button::Left,
        Button::Right,
        Button::Attack,
        Button::Action,
        Button::Item,
        Button::Toss,
        Button::ItemLeft,
        Button::ItemRight,
    ];

    /// Bit mask for this button.
    #[inline]
    pub const fn mask(self) -> u16 {
        1 << (15 - self as u16)
    }
}

/// Input sampled for exactly one simulation frame.
///
/// Fixed-size (2 bytes). Immutable once produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameInput {
    /// Packed button state.
    pub bits: u16,
}

impl FrameInput {
    /// Size in bytes on the wire.
    pub const SIZE: usize = 2;

    /// Neutral input (nothing held).
    pub const NEUTRAL: FrameInput = FrameInput { bits: 0 };

    /// Create from raw bits.
    pub const fn new(bits: u16) -> Self {
        Self { bits }
    }

    /// Create from a set of held buttons.
    pub fn from_buttons(buttons: &[Button]) -> Self {
        let bits = buttons.iter().fold(0u16, |acc, b| acc | b.mask());
        Self { bits }
    }

    /// Check if a button is held.
    #[inline]
    pub fn is_held(&self, button: Button) -> bool {
        self.bits & button.mask() != 0
    }

    /// Set or clear a button.
    #[inline]
    pub fn set(&mut self, button: Button, held: bool) {
        if held {
            self.bits |= button.mask();
        } else {
            self.bits &= !button.mask();
        }
    }

    /// Check if nothing is held.
    #[inline]
    pub fn is_neutral(&self) -> bool {
        self.bits == 0
    }
}

/// Reads one player's input for a frame, with edge detection against the
/// previous frame.
#[derive(Clone, Copy, Debug)]
pub struct InputReader {
    current: FrameInput,
    previous: Option<FrameInput>,
}

impl InputReader {
    /// Create a reader. `previous` is `None` on frame 0.
    pub fn new(current: FrameInput, previous: Option<FrameInput>) -> Self {
        Self { current, previous }
    }

    /// Button is held this frame.
    pub fn is_held(&self, button: Button) -> bool {
        self.current.is_held(button)
    }

    /// Button went down this frame.
    pub fn is_pressed(&self, button: Button) -> bool {
        self.current.is_held(button)
            && !self.previous.map(|p| p.is_held(button)).unwrap_or(false)
    }

    /// Raw input for this frame.
    pub fn current(&self) -> FrameInput {
        self.current
    }
}

// =============================================================================
// ACK CURSOR
// =============================================================================

/// Highest frame a recipient has confirmed receiving from a sender.
///
/// `None` means nothing acknowledged yet. Never moves backwards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckCursor(Option<FrameNum>);

impl AckCursor {
    /// Cursor with nothing acknowledged.
    pub const fn new() -> Self {
        Self(None)
    }

    /// Highest acknowledged frame.
    pub fn get(&self) -> Option<FrameNum> {
        self.0
    }

    /// First frame not yet acknowledged.
    pub fn next_unacked(&self) -> FrameNum {
        self.0.map(|f| f + 1).unwrap_or(0)
    }

    /// Move forward to `frame`. Older values are ignored.
    ///
    /// Returns true if the cursor moved.
    pub fn advance_to(&mut self, frame: Option<FrameNum>) -> bool {
        match (self.0, frame) {
            (_, None) => false,
            (None, Some(f)) => {
                self.0 = Some(f);
                true
            }
            (Some(cur), Some(f)) if f > cur => {
                self.0 = Some(f);
                true
            }
            _ => false,
        }
    }
}

// =============================================================================
// FRAME INPUT WINDOW
// =============================================================================

/// Result of inserting a frame into a window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Frame was new.
    Inserted,
    /// Frame already present with the same value.
    Duplicate,
    /// Frame already present with a different value. The stored value is kept.
    Conflict {
        /// Value already in the window.
        existing: FrameInput,
    },
    /// Frame was already pruned.
    Stale,
}

/// One sender's inputs keyed by frame.
///
/// Frames are pruned from the front once no longer needed. A pruned frame
/// number is never re-introduced.
#[derive(Clone, Debug, Default)]
pub struct FrameInputWindow {
    frames: BTreeMap<FrameNum, FrameInput>,
    /// Highest frame removed by pruning.
    pruned_through: Option<FrameNum>,
    /// Cached end of the contiguous prefix.
    contiguous_through: Option<FrameNum>,
}

impl FrameInputWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert input for a frame. Idempotent for identical values.
    pub fn insert(&mut self, frame: FrameNum, input: FrameInput) -> InsertOutcome {
        if self.pruned_through.map_or(false, |p| frame <= p) {
            return InsertOutcome::Stale;
        }

        match self.frames.get(&frame) {
            Some(existing) if *existing == input => InsertOutcome::Duplicate,
            Some(existing) => InsertOutcome::Conflict { existing: *existing },
            None => {
                self.frames.insert(frame, input);
                self.extend_contiguous();
                InsertOutcome::Inserted
            }
        }
    }

    /// Input for a frame, if present.
    pub fn get(&self, frame: FrameNum) -> Option<FrameInput> {
        self.frames.get(&frame).copied()
    }

    /// Check whether a frame is present.
    pub fn contains(&self, frame: FrameNum) -> bool {
        self.frames.contains_key(&frame)
    }

    /// Highest frame K such that every frame up to K is present or was pruned.
    pub fn last_contiguous(&self) -> Option<FrameNum> {
        self.contiguous_through
    }

    /// Highest frame present.
    pub fn last_frame(&self) -> Option<FrameNum> {
        self.frames.keys().next_back().copied()
    }

    /// Lowest frame still held.
    pub fn first_frame(&self) -> Option<FrameNum> {
        self.frames.keys().next().copied()
    }

    /// Highest frame removed by pruning.
    pub fn pruned_through(&self) -> Option<FrameNum> {
        self.pruned_through
    }

    /// Number of frames held.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Check if the window holds no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Copy frames in `start..=end`, at most `limit` of them, oldest first.
    pub fn slice(&self, start: FrameNum, end: FrameNum, limit: usize) -> BTreeMap<FrameNum, FrameInput> {
        if start > end {
            return BTreeMap::new();
        }
        self.frames
            .range(start..=end)
            .take(limit)
            .map(|(f, i)| (*f, *i))
            .collect()
    }

    /// Iterate over held frames in order.
    pub fn iter(&self) -> impl Iterator<Item = (FrameNum, FrameInput)> + '_ {
        self.frames.iter().map(|(f, i)| (*f, *i))
    }

    /// Remove every frame up to and including `frame`.
    ///
    /// Never prunes past the contiguous prefix, so no gap can be hidden.
    /// Returns the number of frames removed.
    pub fn prune_through(&mut self, frame: FrameNum) -> usize {
        let limit = match self.contiguous_through {
            Some(c) => c.min(frame),
            None => return 0,
        };
        if self.pruned_through.map_or(false, |p| limit <= p) {
            return 0;
        }

        let kept = self.frames.split_off(&(limit + 1));
        let removed = self.frames.len();
        self.frames = kept;
        self.pruned_through = Some(limit);
        removed
    }

    /// Drop every held frame at or after `first`. Pruned history is untouched.
    ///
    /// Used when an authoritative source replaces the tail of a window.
    pub fn truncate_from(&mut self, first: FrameNum) -> usize {
        let removed = self.frames.split_off(&first).len();
        let keep_through = first.checked_sub(1);
        self.contiguous_through = match (self.contiguous_through, keep_through) {
            (Some(c), Some(k)) => Some(c.min(k)),
            _ => None,
        }
        .max(self.pruned_through);
        removed
    }

    fn extend_contiguous(&mut self) {
        let mut next = match self.contiguous_through.or(self.pruned_through) {
            Some(f) => f + 1,
            None => 0,
        };
        while self.frames.contains_key(&next) {
            self.contiguous_through = Some(next);
            next += 1;
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
