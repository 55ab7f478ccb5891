//! ISO 15765-2 (ISO-TP) segmentation and reassembly.
//!
//! Takes the ordered, per-frame hex strings an ELM327 adapter prints for a
//! multi-frame CAN response (with the CAN ID already stripped by the caller)
//! and reassembles them into a single UDS payload. Frame kinds are a closed
//! sum over the four ISO-TP PCI types, modeled as a tagged enum rather than
//! an inheritance hierarchy; reassembly state is a single struct that evolves
//! through explicit transitions.

use log::debug;
use std::fmt;

/// Maximum ISO-TP payload length this engine will reassemble (spec limit).
pub const MAX_PAYLOAD_LEN: usize = 4095;

/// A single ISO-TP frame, tagged by PCI type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoTpFrame {
    /// Complete payload in one frame. `n` is in `1..=7`.
    Single { payload: Vec<u8> },
    /// First frame of a multi-frame message. `length` is the declared total
    /// payload length in `8..=4095`; `payload` carries exactly 6 bytes.
    First { length: u16, payload: Vec<u8> },
    /// A continuation frame. `sequence` is in `0..=15`; `payload` carries up
    /// to 7 bytes (the last frame of a message may be shorter).
    Consecutive { sequence: u8, payload: Vec<u8> },
    /// Flow control frame. Parsed but not acted upon — the adapter manages
    /// flow control transparently (spec §9).
    FlowControl {
        flag: u8,
        block_size: u8,
        separation_time: u8,
    },
}

/// Errors raised while parsing or reassembling ISO-TP frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoTpError {
    /// A hex string didn't decode to valid hex bytes.
    InvalidHex(String),
    /// A frame was empty (no PCI byte).
    EmptyFrame,
    /// The PCI type nibble wasn't one of `0,1,2,3`.
    UnknownPciType(u8),
    /// A Consecutive frame arrived before any First/Single frame.
    ConsecutiveBeforeFirst,
    /// A First/Single frame arrived after reassembly had already started.
    UnexpectedFirstFrame,
    /// A Consecutive frame's sequence number didn't match the expected next
    /// value (dropped, duplicated, or misordered).
    SequenceMismatch { expected: u8, actual: u8 },
    /// All input frames were consumed but the declared length was never
    /// reached.
    IncompleteMessage { expected: usize, got: usize },
}

impl fmt::Display for IsoTpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHex(s) => write!(f, "invalid hex frame: {s:?}"),
            Self::EmptyFrame => write!(f, "empty ISO-TP frame"),
            Self::UnknownPciType(t) => write!(f, "unknown PCI type: 0x{t:x}"),
            Self::ConsecutiveBeforeFirst => {
                write!(f, "consecutive frame arrived before a first/single frame")
            }
            Self::UnexpectedFirstFrame => {
                write!(f, "first/single frame arrived mid-reassembly")
            }
            Self::SequenceMismatch { expected, actual } => write!(
                f,
                "consecutive frame sequence mismatch: expected {expected}, got {actual}"
            ),
            Self::IncompleteMessage { expected, got } => write!(
                f,
                "incomplete ISO-TP message: expected {expected} bytes, got {got}"
            ),
        }
    }
}

impl std::error::Error for IsoTpError {}

/// Parse a single decoded CAN-frame payload (PCI byte first) into a tagged
/// [`IsoTpFrame`].
pub fn parse_frame(bytes: &[u8]) -> Result<IsoTpFrame, IsoTpError> {
    let Some(&byte0) = bytes.first() else {
        return Err(IsoTpError::EmptyFrame);
    };
    let pci_type = byte0 >> 4;

    match pci_type {
        0x0 => {
            let n = usize::from(byte0 & 0x0F);
            let payload = bytes.get(1..1 + n).unwrap_or(&bytes[1..]).to_vec();
            Ok(IsoTpFrame::Single { payload })
        }
        0x1 => {
            let byte1 = bytes.get(1).copied().unwrap_or(0);
            let length = (u16::from(byte0 & 0x0F) << 8) | u16::from(byte1);
            let payload = bytes.get(2..8).unwrap_or(&[]).to_vec();
            Ok(IsoTpFrame::First { length, payload })
        }
        0x2 => {
            let sequence = byte0 & 0x0F;
            let end = bytes.len().min(8);
            let payload = bytes.get(1..end).unwrap_or(&[]).to_vec();
            Ok(IsoTpFrame::Consecutive { sequence, payload })
        }
        0x3 => {
            let flag = byte0 & 0x0F;
            let block_size = bytes.get(1).copied().unwrap_or(0);
            let separation_time = bytes.get(2).copied().unwrap_or(0);
            Ok(IsoTpFrame::FlowControl {
                flag,
                block_size,
                separation_time,
            })
        }
        other => Err(IsoTpError::UnknownPciType(other)),
    }
}

/// Accumulator state for an in-progress ISO-TP reassembly.
#[derive(Debug, Clone, Default)]
pub struct IsoTpMessage {
    expected_length: Option<usize>,
    buffer: Vec<u8>,
    next_expected_sequence: u8,
    complete: bool,
}

impl IsoTpMessage {
    /// Create an empty accumulator, ready to be fed frames in arrival order.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the declared payload length has been fully buffered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Feed the next frame in arrival order.
    pub fn feed(&mut self, frame: &IsoTpFrame) -> Result<(), IsoTpError> {
        match frame {
            IsoTpFrame::Single { payload } => {
                if self.expected_length.is_some() {
                    return Err(IsoTpError::UnexpectedFirstFrame);
                }
                self.expected_length = Some(payload.len());
                self.buffer = payload.clone();
                self.finalize_if_ready();
                Ok(())
            }
            IsoTpFrame::First { length, payload } => {
                if self.expected_length.is_some() {
                    return Err(IsoTpError::UnexpectedFirstFrame);
                }
                self.expected_length = Some(usize::from(*length));
                self.buffer = payload.clone();
                self.next_expected_sequence = 1;
                self.finalize_if_ready();
                Ok(())
            }
            IsoTpFrame::Consecutive { sequence, payload } => {
                if self.expected_length.is_none() {
                    return Err(IsoTpError::ConsecutiveBeforeFirst);
                }
                if *sequence != self.next_expected_sequence {
                    return Err(IsoTpError::SequenceMismatch {
                        expected: self.next_expected_sequence,
                        actual: *sequence,
                    });
                }
                self.buffer.extend_from_slice(payload);
                self.next_expected_sequence = (self.next_expected_sequence + 1) % 16;
                self.finalize_if_ready();
                Ok(())
            }
            IsoTpFrame::FlowControl { .. } => {
                debug!("ignoring flow-control frame (adapter manages flow control)");
                Ok(())
            }
        }
    }

    fn finalize_if_ready(&mut self) {
        if let Some(expected) = self.expected_length {
            if self.buffer.len() >= expected {
                self.buffer.truncate(expected);
                self.complete = true;
            }
        }
    }

    /// Consume the accumulator, returning the reassembled payload if it is
    /// complete.
    pub fn into_payload(self) -> Result<Vec<u8>, IsoTpError> {
        let expected = self.expected_length.unwrap_or(0);
        if self.complete {
            Ok(self.buffer)
        } else {
            Err(IsoTpError::IncompleteMessage {
                expected,
                got: self.buffer.len(),
            })
        }
    }
}

/// Reassemble a list of per-frame hex strings (CAN ID already stripped) into
/// a single UDS payload.
pub fn parse_isotp_frames<S: AsRef<str>>(frames: &[S]) -> Result<Vec<u8>, IsoTpError> {
    let mut message = IsoTpMessage::new();

    for hex_str in frames {
        let hex_str = hex_str.as_ref();
        let bytes =
            hex::decode(hex_str).map_err(|_| IsoTpError::InvalidHex(hex_str.to_string()))?;
        let frame = parse_frame(&bytes)?;
        message.feed(&frame)?;
    }

    message.into_payload()
}

/// Chunk a payload into the hex-string frames an ELM327 response parser
/// would hand to [`parse_isotp_frames`]. Used to test the round-trip
/// invariant and by callers that need to synthesize ISO-TP traffic (e.g. the
/// mock connection backend).
///
/// # Panics
///
/// Panics if `payload.len() > MAX_PAYLOAD_LEN` or is empty.
#[must_use]
pub fn chunk_payload(payload: &[u8]) -> Vec<String> {
    assert!(!payload.is_empty(), "cannot chunk an empty payload");
    assert!(
        payload.len() <= MAX_PAYLOAD_LEN,
        "payload exceeds ISO-TP maximum length"
    );

    if payload.len() <= 7 {
        let n = u8::try_from(payload.len()).expect("checked <= 7");
        let mut frame = vec![n];
        frame.extend_from_slice(payload);
        return vec![hex::encode_upper(frame)];
    }

    let length = u16::try_from(payload.len()).expect("checked <= MAX_PAYLOAD_LEN");
    let mut frames = Vec::new();

    let mut first = vec![0x10 | ((length >> 8) as u8), (length & 0xFF) as u8];
    first.extend_from_slice(&payload[..6]);
    frames.push(hex::encode_upper(first));

    let mut sequence: u8 = 1;
    for chunk in payload[6..].chunks(7) {
        let mut frame = vec![0x20 | sequence];
        frame.extend_from_slice(chunk);
        frames.push(hex::encode_upper(frame));
        sequence = (sequence + 1) % 16;
    }

    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_roundtrip() {
        let payload = vec![0x41, 0x0D, 0x28];
        let frames = chunk_payload(&payload);
        assert_eq!(frames.len(), 1);
        let out = parse_isotp_frames(&frames).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn multi_frame_roundtrip_exact_lengths() {
        for len in [8usize, 13, 14, 100, 500, 4095] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let frames = chunk_payload(&payload);
            let out = parse_isotp_frames(&frames).expect("should reassemble");
            assert_eq!(out, payload, "len={len}");
        }
    }

    #[test]
    fn compact_single_frame_response() {
        // "7EC06410D000000" with the CAN ID already stripped: "06410D000000"
        let frames = ["06410D000000"];
        let out = parse_isotp_frames(&frames).unwrap();
        assert_eq!(out, hex::decode("410D000000").unwrap());
    }

    #[test]
    fn s1_scenario_multi_frame_soc_response() {
        let frames = [
            "103E620101EFFBE7",
            "21ED690000000000",
            "2200000E260D0C0D",
            "230D0D00000034BC",
            "2418BC5600007C00",
            "2502DE800002C955",
            "26000119AF000107",
            "27C300EC656F0000",
            "2803000000000BB8",
        ];
        let out = parse_isotp_frames(&frames).unwrap();
        assert_eq!(out.len(), 62);
        assert_eq!(out[0], 0x62);
        assert_eq!(out[1], 0x01);
        assert_eq!(out[2], 0x01);
        // UdsResponse.payload[4] (after service_echo + DID are stripped) is
        // raw reassembled-buffer offset 3 + 4 = 7.
        assert_eq!(out[7], 0x69);
    }

    /// Build a First frame hex string: PCI=0x1, declared length, 6 payload bytes.
    fn first_frame_hex(length: u16, fill: u8) -> String {
        let mut bytes = vec![0x10 | ((length >> 8) as u8), (length & 0xFF) as u8];
        bytes.extend(std::iter::repeat(fill).take(6));
        hex::encode_upper(bytes)
    }

    /// Build a Consecutive frame hex string: PCI=0x2, sequence, up to 7 payload bytes.
    fn consecutive_frame_hex(sequence: u8, fill: u8) -> String {
        let mut bytes = vec![0x20 | sequence];
        bytes.extend(std::iter::repeat(fill).take(7));
        hex::encode_upper(bytes)
    }

    #[test]
    fn sequence_gap_is_parse_error() {
        // S6: skip sequence 1, jump straight to 2.
        let frames = [first_frame_hex(16, 0xAA), consecutive_frame_hex(2, 0xBB)];
        let err = parse_isotp_frames(&frames).unwrap_err();
        assert_eq!(
            err,
            IsoTpError::SequenceMismatch {
                expected: 1,
                actual: 2
            }
        );
    }

    #[test]
    fn consecutive_before_first_is_error() {
        let frames = [consecutive_frame_hex(1, 0xAA)];
        let err = parse_isotp_frames(&frames).unwrap_err();
        assert_eq!(err, IsoTpError::ConsecutiveBeforeFirst);
    }

    #[test]
    fn duplicate_sequence_is_error() {
        let frames = [
            first_frame_hex(16, 0xAA),
            consecutive_frame_hex(1, 0xBB),
            consecutive_frame_hex(1, 0xCC),
        ];
        let err = parse_isotp_frames(&frames).unwrap_err();
        assert_eq!(
            err,
            IsoTpError::SequenceMismatch {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn incomplete_message_is_error() {
        let frames = [first_frame_hex(32, 0xAA), consecutive_frame_hex(1, 0xBB)];
        let err = parse_isotp_frames(&frames).unwrap_err();
        match err {
            IsoTpError::IncompleteMessage { expected, got } => {
                assert_eq!(expected, 32);
                assert!(got < expected);
            }
            other => panic!("expected IncompleteMessage, got {other:?}"),
        }
    }

    #[test]
    fn unknown_pci_type_is_error() {
        let frames = ["FF000000"];
        let err = parse_isotp_frames(&frames).unwrap_err();
        assert_eq!(err, IsoTpError::UnknownPciType(0xF));
    }

    #[test]
    fn invalid_hex_is_error() {
        let frames = ["ZZ"];
        let err = parse_isotp_frames(&frames).unwrap_err();
        assert!(matches!(err, IsoTpError::InvalidHex(_)));
    }

    #[test]
    fn flow_control_frame_is_ignored() {
        let mut message = IsoTpMessage::new();
        let single = parse_frame(&hex::decode("03410D28").unwrap()).unwrap();
        message.feed(&single).unwrap();
        let fc = parse_frame(&[0x30, 0x00, 0x0A]).unwrap();
        assert!(matches!(fc, IsoTpFrame::FlowControl { .. }));
        message.feed(&fc).unwrap();
        assert_eq!(message.into_payload().unwrap(), vec![0x41, 0x0D, 0x28]);
    }
}
