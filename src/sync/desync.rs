//! Desync Detection
//!
//! Every `desync_interval` completed frames each participant reports a digest
//! of its simulation state. The server compares all reports for the same
//! frame; any disagreement latches the match as desynced for good. Nothing is
//! rolled back, the flag is only surfaced through the sync broadcast.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::core::frame::FrameNum;
use crate::core::hash::{short_hex, StateDigest};
use crate::network::protocol::{DesyncReportMessage, PlayerId};

/// Default number of distinct frames tracked at once.
pub const DEFAULT_MAX_TRACKED_FRAMES: usize = 32;

/// Comparison result for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesyncVerdict {
    /// Frame boundary compared.
    pub frame: FrameNum,
    /// Digest per reporting player.
    pub digests: BTreeMap<PlayerId, StateDigest>,
    /// All reported digests are equal.
    pub agreed: bool,
}

impl DesyncVerdict {
    /// Digest reported by the most players. Ties go to the smallest digest.
    pub fn majority(&self) -> Option<StateDigest> {
        let mut counts: BTreeMap<StateDigest, usize> = BTreeMap::new();
        for digest in self.digests.values() {
            *counts.entry(*digest).or_default() += 1;
        }
        let best = counts.values().copied().max()?;
        counts.into_iter().find(|(_, n)| *n == best).map(|(d, _)| d)
    }

    /// Players whose digest differs from the majority.
    pub fn outliers(&self) -> Vec<PlayerId> {
        let Some(majority) = self.majority() else {
            return Vec::new();
        };
        self.digests
            .iter()
            .filter(|(_, d)| **d != majority)
            .map(|(id, _)| *id)
            .collect()
    }
}

// =============================================================================
// SERVER SIDE
// =============================================================================

/// Per-match digest comparison with a sticky latch.
#[derive(Debug)]
pub struct DesyncDetector {
    reports: BTreeMap<FrameNum, BTreeMap<PlayerId, StateDigest>>,
    max_tracked_frames: usize,
    detected: bool,
    first_divergent_frame: Option<FrameNum>,
}

impl Default for DesyncDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRACKED_FRAMES)
    }
}

impl DesyncDetector {
    /// Create a detector tracking at most `max_tracked_frames` frames.
    pub fn new(max_tracked_frames: usize) -> Self {
        Self {
            reports: BTreeMap::new(),
            max_tracked_frames: max_tracked_frames.max(1),
            detected: false,
            first_divergent_frame: None,
        }
    }

    /// Latched flag. Never reverts to false.
    pub fn desync_detected(&self) -> bool {
        self.detected
    }

    /// First frame at which divergence was seen.
    pub fn first_divergent_frame(&self) -> Option<FrameNum> {
        self.first_divergent_frame
    }

    /// Frames with outstanding reports.
    pub fn tracked_frames(&self) -> usize {
        self.reports.len()
    }

    /// Record a report. `live` is the set of connected players.
    ///
    /// Returns a verdict once the frame is decided: as soon as two digests
    /// differ, or once every live player reported the same digest.
    pub fn record(
        &mut self,
        player_id: PlayerId,
        frame: FrameNum,
        digest: StateDigest,
        live: &BTreeSet<PlayerId>,
    ) -> Option<DesyncVerdict> {
        if !live.contains(&player_id) {
            return None;
        }

        let entry = self.reports.entry(frame).or_default();
        if entry.contains_key(&player_id) {
            // Resent report; the first one stands
            return None;
        }
        entry.insert(player_id, digest);

        let agreed = entry.values().all(|d| *d == digest);
        let complete = live.iter().all(|p| entry.contains_key(p));

        let verdict = if !agreed {
            let verdict = DesyncVerdict { frame, digests: entry.clone(), agreed: false };
            if !self.detected {
                self.first_divergent_frame = Some(frame);
            }
            self.detected = true;
            warn!(
                frame,
                outliers = ?verdict.outliers(),
                majority = %verdict.majority().map(|d| short_hex(&d)).unwrap_or_default(),
                "Desync detected"
            );
            Some(verdict)
        } else if complete {
            let digests = self.reports.remove(&frame).unwrap_or_default();
            debug!(frame, digest = %short_hex(&digest), "Digests agree");
            Some(DesyncVerdict { frame, digests, agreed: true })
        } else {
            None
        };

        while self.reports.len() > self.max_tracked_frames {
            self.reports.pop_first();
        }
        verdict
    }
}

// =============================================================================
// CLIENT SIDE
// =============================================================================

/// Decides when the local participant reports its digest.
#[derive(Debug, Clone)]
pub struct DesyncReporter {
    player_id: PlayerId,
    interval: u32,
    last_reported: Option<FrameNum>,
}

impl DesyncReporter {
    /// Report every `interval` completed frames.
    pub fn new(player_id: PlayerId, interval: u32) -> Self {
        Self {
            player_id,
            interval: interval.max(1),
            last_reported: None,
        }
    }

    /// Whether the state after completing `frame` should be reported.
    pub fn is_due(&self, frame: FrameNum) -> bool {
        (frame + 1) % self.interval == 0 && self.last_reported.map_or(true, |f| frame > f)
    }

    /// Build a report if one is due for `frame`.
    pub fn report(&mut self, frame: FrameNum, digest: StateDigest) -> Option<DesyncReportMessage> {
        if !self.is_due(frame) {
            return None;
        }
        self.last_reported = Some(frame);
        Some(DesyncReportMessage { sender_id: self.player_id, frame, digest })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn live(ids: &[PlayerId]) -> BTreeSet<PlayerId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_agreement_releases_frame() {
        let mut detector = DesyncDetector::default();
        let players = live(&[0, 1]);

        assert!(detector.record(0, 59, [1; 32], &players).is_none());
        assert_eq!(detector.tracked_frames(), 1);

        let verdict = detector.record(1, 59, [1; 32], &players).unwrap();
        assert!(verdict.agreed);
        assert_eq!(detector.tracked_frames(), 0);
        assert!(!detector.desync_detected());
    }

    #[test]
    fn test_differing_digests_latch() {
        let mut detector = DesyncDetector::default();
        let players = live(&[0, 1]);

        detector.record(0, 100, [1; 32], &players);
        let verdict = detector.record(1, 100, [2; 32], &players).unwrap();
        assert!(!verdict.agreed);
        assert!(detector.desync_detected());
        assert_eq!(detector.first_divergent_frame(), Some(100));

        // Later agreement never clears the latch
        detector.record(0, 160, [3; 32], &players);
        detector.record(1, 160, [3; 32], &players);
        assert!(detector.desync_detected());
        assert_eq!(detector.first_divergent_frame(), Some(100));
    }

    #[test]
    fn test_majority_names_outlier() {
        let mut detector = DesyncDetector::default();
        let players = live(&[0, 1, 2]);

        detector.record(0, 60, [7; 32], &players);
        let verdict = detector.record(2, 60, [9; 32], &players).unwrap();
        assert!(!verdict.agreed);

        let complete = DesyncVerdict {
            frame: 60,
            digests: [(0, [7; 32]), (1, [7; 32]), (2, [9; 32])].into_iter().collect(),
            agreed: false,
        };
        assert_eq!(complete.majority(), Some([7; 32]));
        assert_eq!(complete.outliers(), vec![2]);
    }

    #[test]
    fn test_duplicate_and_outsider_reports_ignored() {
        let mut detector = DesyncDetector::default();
        let players = live(&[0, 1]);

        detector.record(0, 10, [1; 32], &players);
        assert!(detector.record(0, 10, [2; 32], &players).is_none());
        assert!(detector.record(5, 10, [2; 32], &players).is_none());
        assert!(!detector.desync_detected());
    }

    #[test]
    fn test_tracking_is_bounded() {
        let mut detector = DesyncDetector::new(4);
        let players = live(&[0, 1]);

        for frame in 0..10 {
            detector.record(0, frame * 60, [0; 32], &players);
        }
        assert_eq!(detector.tracked_frames(), 4);
    }

    #[test]
    fn test_reporter_cadence() {
        let mut reporter = DesyncReporter::new(3, 60);
        assert!(reporter.report(58, [0; 32]).is_none());

        let report = reporter.report(59, [4; 32]).unwrap();
        assert_eq!(report.sender_id, 3);
        assert_eq!(report.frame, 59);

        assert!(reporter.report(59, [4; 32]).is_none());
        assert!(reporter.report(119, [4; 32]).is_some());
    }
}
