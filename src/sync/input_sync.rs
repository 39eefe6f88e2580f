//! Input Synchronization Engine
//!
//! Exchanges per-frame input between all participants over the unreliable
//! channel. Reliability comes from redundant inclusion: every packet to a
//! peer carries all of our frames that peer has not acknowledged yet, plus a
//! piggy-backed ack of the peer's own frames. A single delivered packet fills
//! every earlier gap, so no retransmission timers exist.
//!
//! Single-writer discipline: the frame loop writes the local window
//! ([`InputSyncer::record_local_input`]); the receive path writes only the
//! mirrors of other participants' windows. The simulation reads through
//! [`InputSyncer::try_advance`], which takes a complete [`FrameStep`] and
//! advances in one move.

use std::collections::BTreeMap;

use tracing::{debug, warn};
#[cfg(feature = "debug-tracing")]
use tracing::trace;

use super::disconnect::{apply_authoritative, collect_report, extend_synthesized, DisconnectPolicy, DisconnectRecord};
use super::ProtocolError;
use crate::core::frame::{AckCursor, FrameInput, FrameInputWindow, FrameNum, InputReader, InsertOutcome};
use crate::network::protocol::{
    ClientDcFramesMessage, MatchSettings, PeerInputMessage, PlayerId, ServerDcFramesMessage,
    SyncedPlayerData, WireMessage,
};

/// Engine tuning that does not need to agree across participants.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Most frames carried by one input packet (oldest unacknowledged first).
    pub max_frames_per_packet: usize,
    /// Send rounds a live peer may stay silent before it is reported unresponsive.
    pub unacked_ceiling: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_frames_per_packet: 180,
            unacked_ceiling: 120,
        }
    }
}

/// Frames of history kept in each remote mirror beyond the input-delay ceiling,
/// so a disconnect report always covers what survivors might still need.
pub const REMOTE_HISTORY_MARGIN: FrameNum = 4;

// =============================================================================
// FRAME STEP
// =============================================================================

/// Everything the simulation needs to advance exactly one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameStep {
    /// Frame being simulated.
    pub frame: FrameNum,
    /// Input per participant, genuine or synthesized.
    pub inputs: BTreeMap<PlayerId, FrameInput>,
    /// Inputs of the previous frame (empty on frame 0).
    pub previous: BTreeMap<PlayerId, FrameInput>,
}

impl FrameStep {
    /// Input for a player.
    pub fn input(&self, player_id: PlayerId) -> Option<FrameInput> {
        self.inputs.get(&player_id).copied()
    }

    /// Edge-detecting reader for a player.
    pub fn reader(&self, player_id: PlayerId) -> Option<InputReader> {
        let current = self.input(player_id)?;
        Some(InputReader::new(current, self.previous.get(&player_id).copied()))
    }
}

// =============================================================================
// PEER STATE
// =============================================================================

/// How a remote participant's input is sourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Genuine input over the network.
    Live,
    /// Dropped; genuine input frozen, waiting for the server's frames.
    Disconnected,
    /// Dropped; authoritative frames applied, further input synthesized.
    Resolved(DisconnectRecord),
}

/// Signal raised when a live peer has gone quiet for too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerUnresponsive {
    /// Silent peer.
    pub player_id: PlayerId,
    /// Send rounds since anything arrived from it.
    pub silent_rounds: u32,
}

#[derive(Debug, Clone)]
struct PeerState {
    /// Mirror of the peer's input.
    window: FrameInputWindow,
    /// Highest of our frames the peer acknowledged.
    ack: AckCursor,
    status: PeerStatus,
    silent_rounds: u32,
}

impl PeerState {
    fn new() -> Self {
        Self {
            window: FrameInputWindow::new(),
            ack: AckCursor::new(),
            status: PeerStatus::Live,
            silent_rounds: 0,
        }
    }

    fn is_live(&self) -> bool {
        self.status == PeerStatus::Live
    }
}

/// Result of handling one input packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveSummary {
    /// New frames stored.
    pub inserted: usize,
    /// Frames already held with the same value.
    pub duplicates: usize,
    /// Frames already held with a different value (kept as first seen).
    pub conflicts: usize,
    /// Frames older than the mirror's pruned history.
    pub stale: usize,
    /// The piggy-backed ack moved forward.
    pub ack_advanced: bool,
}

/// Estimated traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    /// Input packets built.
    pub packets_sent: u64,
    /// Estimated bytes in built packets.
    pub bytes_sent: u64,
    /// Input packets accepted.
    pub packets_received: u64,
    /// Estimated bytes in accepted packets.
    pub bytes_received: u64,
}

// =============================================================================
// INPUT SYNCER
// =============================================================================

/// One participant's lockstep input engine.
#[derive(Debug)]
pub struct InputSyncer {
    local_id: PlayerId,
    delay_frames: u16,
    max_delay_frames: u16,
    policy: DisconnectPolicy,
    config: SyncConfig,
    local: FrameInputWindow,
    peers: BTreeMap<PlayerId, PeerState>,
    /// Next frame to simulate.
    frame: FrameNum,
    last_inputs: BTreeMap<PlayerId, FrameInput>,
    stats: TrafficStats,
}

impl InputSyncer {
    /// Create an engine for `local_id` with the match's agreed settings.
    pub fn new(local_id: PlayerId, settings: &MatchSettings, config: SyncConfig) -> Self {
        Self {
            local_id,
            delay_frames: settings.delay_frames.min(settings.max_delay_frames),
            max_delay_frames: settings.max_delay_frames,
            policy: settings.disconnect_policy,
            config,
            local: FrameInputWindow::new(),
            peers: BTreeMap::new(),
            frame: 0,
            last_inputs: BTreeMap::new(),
            stats: TrafficStats::default(),
        }
    }

    /// Local player id.
    pub fn local_id(&self) -> PlayerId {
        self.local_id
    }

    /// Next frame to simulate.
    pub fn frame(&self) -> FrameNum {
        self.frame
    }

    /// Last fully simulated frame.
    pub fn last_complete_frame(&self) -> Option<FrameNum> {
        self.frame.checked_sub(1)
    }

    /// Current input delay.
    pub fn delay_frames(&self) -> u16 {
        self.delay_frames
    }

    /// Change the input delay, clamped to the match ceiling.
    pub fn set_delay_frames(&mut self, delay: u16) {
        self.delay_frames = delay.min(self.max_delay_frames);
    }

    /// Traffic counters.
    pub fn stats(&self) -> TrafficStats {
        self.stats
    }

    /// Local input window.
    pub fn local_window(&self) -> &FrameInputWindow {
        &self.local
    }

    /// Mirror of a peer's window.
    pub fn peer_window(&self, player_id: PlayerId) -> Option<&FrameInputWindow> {
        self.peers.get(&player_id).map(|p| &p.window)
    }

    /// Highest local frame a peer acknowledged.
    pub fn peer_ack(&self, player_id: PlayerId) -> Option<AckCursor> {
        self.peers.get(&player_id).map(|p| p.ack)
    }

    /// Input source of a peer.
    pub fn peer_status(&self, player_id: PlayerId) -> Option<PeerStatus> {
        self.peers.get(&player_id).map(|p| p.status)
    }

    /// Ids of peers still sending genuine input.
    pub fn live_peers(&self) -> Vec<PlayerId> {
        self.peers.iter().filter(|(_, p)| p.is_live()).map(|(id, _)| *id).collect()
    }

    /// Reconcile the peer set with the server's player list.
    ///
    /// Returns players that were live and are now reported disconnected.
    pub fn apply_player_data(&mut self, players: &[SyncedPlayerData]) -> Vec<PlayerId> {
        let mut dropped = Vec::new();
        for player in players.iter().filter(|p| p.id != self.local_id) {
            let peer = self.peers.entry(player.id).or_insert_with(PeerState::new);
            if !player.is_connected() && peer.is_live() {
                peer.status = PeerStatus::Disconnected;
                dropped.push(player.id);
            }
        }
        self.peers.retain(|id, _| players.iter().any(|p| p.id == *id));

        for id in &dropped {
            debug!(player_id = id, frame = self.frame, "Peer marked disconnected");
        }
        dropped
    }

    /// Stop accepting genuine input from a peer. Returns false if it was not live.
    pub fn mark_disconnected(&mut self, player_id: PlayerId) -> bool {
        match self.peers.get_mut(&player_id) {
            Some(peer) if peer.is_live() => {
                peer.status = PeerStatus::Disconnected;
                true
            }
            _ => false,
        }
    }

    /// Record local input for the frame `delay_frames` ahead of the simulation.
    ///
    /// Missing earlier frames are back-filled with neutral input so the window
    /// stays gap-free. A frame already recorded is never overwritten; returns
    /// false in that case.
    pub fn record_local_input(&mut self, input: FrameInput) -> bool {
        let target = self.frame + self.delay_frames as FrameNum;
        if self.local.contains(target) || self.local.pruned_through().map_or(false, |p| target <= p) {
            return false;
        }

        let start = self.local.last_contiguous().map(|f| f + 1).unwrap_or(0);
        for frame in start..target {
            self.local.insert(frame, FrameInput::NEUTRAL);
        }
        self.local.insert(target, input) == InsertOutcome::Inserted
    }

    /// Build one input packet per live peer.
    ///
    /// Each carries our frames from that peer's ack + 1 onward (capped at
    /// `max_frames_per_packet`, oldest first) and our ack of the peer.
    pub fn outgoing_inputs(&mut self) -> Vec<PeerInputMessage> {
        let mut out = Vec::with_capacity(self.peers.len());
        for (&id, peer) in self.peers.iter_mut().filter(|(_, p)| p.is_live()) {
            peer.silent_rounds = peer.silent_rounds.saturating_add(1);

            let inputs = match self.local.last_frame() {
                Some(last) => self.local.slice(peer.ack.next_unacked(), last, self.config.max_frames_per_packet),
                None => BTreeMap::new(),
            };
            let msg = PeerInputMessage {
                sender_id: self.local_id,
                recipient_id: id,
                inputs,
                last_acked_frame: peer.window.last_contiguous(),
            };

            self.stats.packets_sent += 1;
            self.stats.bytes_sent += msg.estimated_size() as u64;
            out.push(msg);
        }
        out
    }

    /// Handle an input packet from a peer.
    ///
    /// Duplicates and reordering are expected and absorbed. Input from a peer
    /// that is no longer live is ignored, but its ack still counts.
    pub fn receive_peer_input(&mut self, msg: &PeerInputMessage) -> Result<ReceiveSummary, ProtocolError> {
        if msg.recipient_id != self.local_id {
            return Err(ProtocolError::WrongRecipient {
                recipient: msg.recipient_id,
                local: self.local_id,
            });
        }
        let peer = self
            .peers
            .get_mut(&msg.sender_id)
            .ok_or(ProtocolError::UnknownPlayer(msg.sender_id))?;

        self.stats.packets_received += 1;
        self.stats.bytes_received += msg.estimated_size() as u64;
        peer.silent_rounds = 0;

        let mut summary = ReceiveSummary::default();
        // An ack beyond anything we produced is bogus
        let ack = msg.last_acked_frame.filter(|f| Some(*f) <= self.local.last_frame());
        summary.ack_advanced = peer.ack.advance_to(ack);

        if peer.is_live() {
            for (&frame, &input) in &msg.inputs {
                match peer.window.insert(frame, input) {
                    InsertOutcome::Inserted => summary.inserted += 1,
                    InsertOutcome::Duplicate => summary.duplicates += 1,
                    InsertOutcome::Stale => summary.stale += 1,
                    InsertOutcome::Conflict { existing } => {
                        summary.conflicts += 1;
                        warn!(
                            sender = msg.sender_id,
                            frame,
                            kept = existing.bits,
                            received = input.bits,
                            "Conflicting input for frame"
                        );
                    }
                }
            }
        }

        #[cfg(feature = "debug-tracing")]
        trace!(
            sender = msg.sender_id,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            ack = ?peer.ack.get(),
            "Peer input received"
        );

        if summary.ack_advanced {
            self.prune_local();
        }
        Ok(summary)
    }

    /// Take the inputs for the next frame and advance, if every participant's
    /// input for it is known.
    pub fn try_advance(&mut self) -> Option<FrameStep> {
        let frame = self.frame;
        let substitution = self.policy.substitution();

        let mut inputs = BTreeMap::new();
        inputs.insert(self.local_id, self.local.get(frame)?);
        for (&id, peer) in self.peers.iter_mut() {
            if let PeerStatus::Resolved(record) = peer.status {
                extend_synthesized(&mut peer.window, &record, frame, substitution);
            }
            inputs.insert(id, peer.window.get(frame)?);
        }

        let previous = std::mem::replace(&mut self.last_inputs, inputs.clone());
        self.frame += 1;
        self.prune_local();
        self.prune_remote();

        Some(FrameStep { frame, inputs, previous })
    }

    /// Live peers that have been silent past the ceiling.
    pub fn unresponsive_peers(&self) -> Vec<PeerUnresponsive> {
        self.peers
            .iter()
            .filter(|(_, p)| p.is_live() && p.silent_rounds > self.config.unacked_ceiling)
            .map(|(&player_id, p)| PeerUnresponsive { player_id, silent_rounds: p.silent_rounds })
            .collect()
    }

    /// Disconnect reports to send to the server: one per dropped peer still
    /// awaiting authoritative frames, plus one per unresponsive live peer.
    pub fn disconnect_reports(&self) -> Vec<ClientDcFramesMessage> {
        self.peers
            .iter()
            .filter(|(_, p)| {
                p.status == PeerStatus::Disconnected
                    || (p.is_live() && p.silent_rounds > self.config.unacked_ceiling)
            })
            .map(|(&id, p)| ClientDcFramesMessage {
                sender_id: self.local_id,
                disconnector_id: id,
                inputs: collect_report(&p.window),
            })
            .collect()
    }

    /// Adopt the server's authoritative frames for a dropped peer.
    ///
    /// Returns false if that peer was already resolved.
    pub fn apply_server_dc_frames(&mut self, msg: &ServerDcFramesMessage) -> Result<bool, ProtocolError> {
        if msg.recipient_id != self.local_id {
            return Err(ProtocolError::WrongRecipient {
                recipient: msg.recipient_id,
                local: self.local_id,
            });
        }
        let player_id = msg.record.player_id;
        let peer = self
            .peers
            .get_mut(&player_id)
            .ok_or(ProtocolError::UnknownPlayer(player_id))?;
        if matches!(peer.status, PeerStatus::Resolved(_)) {
            return Ok(false);
        }

        let replaced = apply_authoritative(&mut peer.window, &msg.record, &msg.frames);
        if replaced > 0 && msg.record.first_synthesized < self.frame {
            warn!(
                player_id,
                first_synthesized = msg.record.first_synthesized,
                frame = self.frame,
                "Authoritative frames replace input already simulated"
            );
        }
        peer.status = PeerStatus::Resolved(msg.record);
        debug!(
            player_id,
            last_genuine = ?msg.record.last_genuine_frame,
            last_synthesized = msg.record.last_synthesized,
            "Disconnect frames applied"
        );
        Ok(true)
    }

    /// Drop local frames every live peer acknowledged and the simulation used.
    fn prune_local(&mut self) {
        let Some(done) = self.last_complete_frame() else {
            return;
        };
        let mut limit = done;
        for peer in self.peers.values().filter(|p| p.is_live()) {
            match peer.ack.get() {
                Some(ack) => limit = limit.min(ack),
                None => return,
            }
        }
        self.local.prune_through(limit);
    }

    /// Keep a bounded tail of each mirror behind the simulation.
    fn prune_remote(&mut self) {
        let keep = self.max_delay_frames as FrameNum + REMOTE_HISTORY_MARGIN;
        let Some(limit) = self.last_complete_frame().and_then(|f| f.checked_sub(keep)) else {
            return;
        };
        for peer in self.peers.values_mut() {
            peer.window.prune_through(limit);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
