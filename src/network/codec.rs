//! Wire Codec
//!
//! Every frame on either channel has the same layout:
//!
//! ```text
//! ┌──────────┬───────────────┬──────────────────────────┐
//! │ kind: u8 │ len: u16 (LE) │ payload: bincode, len B  │
//! └──────────┴───────────────┴──────────────────────────┘
//! ```
//!
//! Payloads use bincode with fixed-width little-endian integers. All keyed
//! collections are `BTreeMap`, so a logical value always encodes to the same
//! bytes. Realtime frames are capped at [`MAX_DATAGRAM_SIZE`].

use std::ops::Range;

use bincode::Options;
use thiserror::Error;

use super::protocol::{
    Channel, ClientDcFramesMessage, ControlMessage, CreateMatchRequest, CreateMatchResponse,
    DesyncReportMessage, ErrorResponse, HelloMessage, JoinMatchRequest, JoinMatchResponse,
    LeaveMatchRequest, LeaveMatchResponse, MatchSyncMessage, MessageKind, PeerInputMessage,
    RealtimeMessage, ServerDcFramesMessage, StartMatchRequest, StartMatchResponse, WireMessage,
    MAX_DATAGRAM_SIZE,
};

/// Bytes before the payload.
pub const HEADER_SIZE: usize = 3;

/// Largest payload the length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

/// Size ceiling for a whole frame on the given channel.
pub fn frame_limit(channel: Channel) -> usize {
    match channel {
        Channel::Unreliable => MAX_DATAGRAM_SIZE,
        Channel::Reliable => HEADER_SIZE + MAX_PAYLOAD_SIZE,
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Encoding failure.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Payload could not be serialized.
    #[error("serialization failed: {0}")]
    Serialize(#[from] bincode::Error),

    /// Encoded frame exceeds the channel ceiling.
    #[error("{kind:?} frame is {size} bytes, limit is {limit}")]
    Oversized {
        /// Message kind.
        kind: MessageKind,
        /// Encoded size including header.
        size: usize,
        /// Channel limit.
        limit: usize,
    },
}

/// Decoding failure. Every variant names the offending byte range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer bytes than a header.
    #[error("truncated header at bytes {range:?}")]
    TruncatedHeader {
        /// Bytes that were present.
        range: Range<usize>,
    },

    /// Kind byte not in the closed set.
    #[error("unknown message kind {id:#04x} at bytes {range:?}")]
    UnknownKind {
        /// Raw kind byte.
        id: u8,
        /// Location of the kind byte.
        range: Range<usize>,
    },

    /// Kind is valid but not the one the caller asked for.
    #[error("expected {expected:?}, found {found:?} at bytes {range:?}")]
    UnexpectedKind {
        /// Requested kind.
        expected: MessageKind,
        /// Kind on the wire.
        found: MessageKind,
        /// Location of the kind byte.
        range: Range<usize>,
    },

    /// Declared length disagrees with the bytes present.
    #[error("declared payload length {declared}, found {actual} at bytes {range:?}")]
    LengthMismatch {
        /// Length field value.
        declared: usize,
        /// Payload bytes actually present.
        actual: usize,
        /// Location of the length field.
        range: Range<usize>,
    },

    /// Frame exceeds the channel ceiling.
    #[error("{size}-byte frame exceeds limit {limit} at bytes {range:?}")]
    Oversized {
        /// Frame size.
        size: usize,
        /// Channel limit.
        limit: usize,
        /// Bytes beyond the limit.
        range: Range<usize>,
    },

    /// Payload bytes do not form the declared message.
    #[error("malformed {kind:?} payload at bytes {range:?}: {reason}")]
    Payload {
        /// Message kind.
        kind: MessageKind,
        /// Location of the payload.
        range: Range<usize>,
        /// Deserializer message.
        reason: String,
    },
}

impl DecodeError {
    /// Offending byte range.
    pub fn range(&self) -> Range<usize> {
        match self {
            Self::TruncatedHeader { range }
            | Self::UnknownKind { range, .. }
            | Self::UnexpectedKind { range, .. }
            | Self::LengthMismatch { range, .. }
            | Self::Oversized { range, .. }
            | Self::Payload { range, .. } => range.clone(),
        }
    }
}

// =============================================================================
// FRAMING
// =============================================================================

/// Encode one message into a framed buffer.
pub fn encode_message<M: WireMessage>(msg: &M) -> Result<Vec<u8>, EncodeError> {
    let payload = options().serialize(msg)?;
    let size = HEADER_SIZE + payload.len();
    let limit = frame_limit(M::KIND.channel());
    if size > limit {
        return Err(EncodeError::Oversized { kind: M::KIND, size, limit });
    }

    let mut out = Vec::with_capacity(size);
    out.push(M::KIND.id());
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Size of the framed message without building it.
pub fn encoded_size<M: WireMessage>(msg: &M) -> Result<usize, EncodeError> {
    Ok(HEADER_SIZE + options().serialized_size(msg)? as usize)
}

/// Validate the header and return the kind plus the payload slice.
pub fn split_frame(bytes: &[u8]) -> Result<(MessageKind, &[u8]), DecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(DecodeError::TruncatedHeader { range: 0..bytes.len() });
    }

    let id = bytes[0];
    let kind = MessageKind::from_byte(id).ok_or(DecodeError::UnknownKind { id, range: 0..1 })?;

    let limit = frame_limit(kind.channel());
    if bytes.len() > limit {
        return Err(DecodeError::Oversized {
            size: bytes.len(),
            limit,
            range: limit..bytes.len(),
        });
    }

    let declared = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
    let actual = bytes.len() - HEADER_SIZE;
    if declared != actual {
        return Err(DecodeError::LengthMismatch { declared, actual, range: 1..3 });
    }

    Ok((kind, &bytes[HEADER_SIZE..]))
}

/// Read just the kind byte.
pub fn peek_kind(bytes: &[u8]) -> Result<MessageKind, DecodeError> {
    split_frame(bytes).map(|(kind, _)| kind)
}

fn decode_payload<M: WireMessage>(payload: &[u8]) -> Result<M, DecodeError> {
    options().deserialize(payload).map_err(|e| DecodeError::Payload {
        kind: M::KIND,
        range: HEADER_SIZE..HEADER_SIZE + payload.len(),
        reason: e.to_string(),
    })
}

/// Decode one framed message of a known type.
pub fn decode_message<M: WireMessage>(bytes: &[u8]) -> Result<M, DecodeError> {
    let (kind, payload) = split_frame(bytes)?;
    if kind != M::KIND {
        return Err(DecodeError::UnexpectedKind { expected: M::KIND, found: kind, range: 0..1 });
    }
    decode_payload(payload)
}

// =============================================================================
// CLOSED ENUMS
// =============================================================================

impl RealtimeMessage {
    /// Encode to a datagram.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        match self {
            Self::MatchSync(m) => encode_message(m),
            Self::PeerInput(m) => encode_message(m),
            Self::ClientDcFrames(m) => encode_message(m),
            Self::ServerDcFrames(m) => encode_message(m),
            Self::DesyncReport(m) => encode_message(m),
            Self::Hello(m) => encode_message(m),
        }
    }

    /// Decode a datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (kind, payload) = split_frame(bytes)?;
        Ok(match kind {
            MessageKind::MatchSync => Self::MatchSync(decode_payload::<MatchSyncMessage>(payload)?),
            MessageKind::PeerInput => Self::PeerInput(decode_payload::<PeerInputMessage>(payload)?),
            MessageKind::ClientDcFrames => {
                Self::ClientDcFrames(decode_payload::<ClientDcFramesMessage>(payload)?)
            }
            MessageKind::ServerDcFrames => {
                Self::ServerDcFrames(decode_payload::<ServerDcFramesMessage>(payload)?)
            }
            MessageKind::DesyncReport => {
                Self::DesyncReport(decode_payload::<DesyncReportMessage>(payload)?)
            }
            MessageKind::Hello => Self::Hello(decode_payload::<HelloMessage>(payload)?),
            other => {
                return Err(DecodeError::UnexpectedKind {
                    expected: MessageKind::PeerInput,
                    found: other,
                    range: 0..1,
                })
            }
        })
    }
}

impl ControlMessage {
    /// Encode to a binary control frame.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        match self {
            Self::CreateMatch(m) => encode_message(m),
            Self::JoinMatch(m) => encode_message(m),
            Self::StartMatch(m) => encode_message(m),
            Self::LeaveMatch(m) => encode_message(m),
            Self::MatchCreated(m) => encode_message(m),
            Self::MatchJoined(m) => encode_message(m),
            Self::MatchStarted(m) => encode_message(m),
            Self::MatchLeft(m) => encode_message(m),
            Self::Error(m) => encode_message(m),
        }
    }

    /// Decode a binary control frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (kind, payload) = split_frame(bytes)?;
        Ok(match kind {
            MessageKind::CreateMatchRequest => {
                Self::CreateMatch(decode_payload::<CreateMatchRequest>(payload)?)
            }
            MessageKind::JoinMatchRequest => Self::JoinMatch(decode_payload::<JoinMatchRequest>(payload)?),
            MessageKind::StartMatchRequest => {
                Self::StartMatch(decode_payload::<StartMatchRequest>(payload)?)
            }
            MessageKind::LeaveMatchRequest => {
                Self::LeaveMatch(decode_payload::<LeaveMatchRequest>(payload)?)
            }
            MessageKind::CreateMatchResponse => {
                Self::MatchCreated(decode_payload::<CreateMatchResponse>(payload)?)
            }
            MessageKind::JoinMatchResponse => {
                Self::MatchJoined(decode_payload::<JoinMatchResponse>(payload)?)
            }
            MessageKind::StartMatchResponse => {
                Self::MatchStarted(decode_payload::<StartMatchResponse>(payload)?)
            }
            MessageKind::LeaveMatchResponse => {
                Self::MatchLeft(decode_payload::<LeaveMatchResponse>(payload)?)
            }
            MessageKind::ErrorResponse => Self::Error(decode_payload::<ErrorResponse>(payload)?),
            other => {
                return Err(DecodeError::UnexpectedKind {
                    expected: MessageKind::CreateMatchRequest,
                    found: other,
                    range: 0..1,
                })
            }
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use uuid::Uuid;

    use crate::core::frame::FrameInput;
    use crate::network::protocol::{ErrorCode, MatchSettings, PlayerIdentity};

    fn peer_input(frames: impl IntoIterator<Item = u32>) -> PeerInputMessage {
        PeerInputMessage {
            sender_id: 0,
            recipient_id: 1,
            inputs: frames.into_iter().map(|f| (f, FrameInput::new(f as u16))).collect(),
            last_acked_frame: Some(7),
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode_message(&peer_input(10..13)).unwrap();
        assert_eq!(bytes[0], MessageKind::PeerInput.id());
        let len = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
        assert_eq!(len, bytes.len() - HEADER_SIZE);
    }

    #[test]
    fn test_encoded_size_matches_frame() {
        let msg = peer_input(0..40);
        assert_eq!(encoded_size(&msg).unwrap(), encode_message(&msg).unwrap().len());
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let mut forward = BTreeMap::new();
        let mut backward = BTreeMap::new();
        for f in 0..20u32 {
            forward.insert(f, FrameInput::new(f as u16));
        }
        for f in (0..20u32).rev() {
            backward.insert(f, FrameInput::new(f as u16));
        }

        let a = PeerInputMessage { sender_id: 2, recipient_id: 3, inputs: forward, last_acked_frame: None };
        let b = PeerInputMessage { sender_id: 2, recipient_id: 3, inputs: backward, last_acked_frame: None };
        assert_eq!(encode_message(&a).unwrap(), encode_message(&b).unwrap());
    }

    #[test]
    fn test_realtime_decode_dispatches_by_kind() {
        let msg = RealtimeMessage::PeerInput(peer_input(10..13));
        let bytes = msg.encode().unwrap();
        assert_eq!(RealtimeMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_control_binary_form() {
        let settings = MatchSettings::new("friday", "hyrule_field");
        let msg = ControlMessage::CreateMatch(CreateMatchRequest {
            settings,
            player: PlayerIdentity::new("alice", "link"),
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(peek_kind(&bytes).unwrap(), MessageKind::CreateMatchRequest);
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_truncated_header() {
        let err = RealtimeMessage::decode(&[2, 0]).unwrap_err();
        assert_eq!(err, DecodeError::TruncatedHeader { range: 0..2 });
    }

    #[test]
    fn test_unknown_kind() {
        let err = RealtimeMessage::decode(&[0x99, 0, 0]).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownKind { id: 0x99, .. }));
        assert_eq!(err.range(), 0..1);
    }

    #[test]
    fn test_length_mismatch() {
        let mut bytes = encode_message(&peer_input(0..3)).unwrap();
        bytes.pop();
        let err = RealtimeMessage::decode(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::LengthMismatch { .. }));
        assert_eq!(err.range(), 1..3);
    }

    #[test]
    fn test_malformed_payload_names_payload_range() {
        // Hello needs a player id plus a 16-byte guid
        let bytes = [MessageKind::Hello.id(), 2, 0, 1, 2];
        let err = RealtimeMessage::decode(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::Payload { kind: MessageKind::Hello, .. }));
        assert_eq!(err.range(), 3..5);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let hello = HelloMessage { player_id: 1, guid: Uuid::nil() };
        let mut bytes = encode_message(&hello).unwrap();
        bytes.push(0xAA);
        let len = (bytes.len() - HEADER_SIZE) as u16;
        bytes[1..3].copy_from_slice(&len.to_le_bytes());

        assert!(matches!(
            RealtimeMessage::decode(&bytes),
            Err(DecodeError::Payload { .. })
        ));
    }

    #[test]
    fn test_wrong_kind_for_typed_decode() {
        let bytes = encode_message(&peer_input(0..1)).unwrap();
        let err = decode_message::<HelloMessage>(&bytes).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::UnexpectedKind { expected: MessageKind::Hello, found: MessageKind::PeerInput, .. }
        ));
    }

    #[test]
    fn test_control_frame_on_realtime_decoder() {
        let msg = ControlMessage::error(ErrorCode::MatchNotFound, "no such match");
        let bytes = msg.encode().unwrap();
        assert!(matches!(
            RealtimeMessage::decode(&bytes),
            Err(DecodeError::UnexpectedKind { found: MessageKind::ErrorResponse, .. })
        ));
    }

    #[test]
    fn test_oversized_realtime_frame_rejected() {
        let err = encode_message(&peer_input(0..400)).unwrap_err();
        assert!(matches!(err, EncodeError::Oversized { kind: MessageKind::PeerInput, .. }));

        // A full default-size packet fits
        assert!(encode_message(&peer_input(0..180)).unwrap().len() <= MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_oversized_datagram_rejected_on_decode() {
        let mut bytes = vec![MessageKind::PeerInput.id(), 0, 0];
        bytes.resize(MAX_DATAGRAM_SIZE + 10, 0);
        let err = RealtimeMessage::decode(&bytes).unwrap_err();
        assert_eq!(err.range(), MAX_DATAGRAM_SIZE..MAX_DATAGRAM_SIZE + 10);
    }
}
