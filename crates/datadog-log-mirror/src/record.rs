// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Framed record codec for append-only log files.
//!
//! Producers write records as `[length][length crc][payload][payload crc]`:
//! an 8-byte little-endian payload length, a crc32 of those length bytes, the
//! MessagePack-encoded payload, and a crc32 of the payload. Because writers
//! may still be flushing, anything at the tail of a file that does not yet
//! resolve into a full valid frame is reported as [`FrameOutcome::Incomplete`]
//! rather than as an error; the bytes are left in place and re-attempted on
//! the next read.

use serde::{Deserialize, Serialize};

/// Length prefix plus its checksum.
pub const FRAME_HEADER_BYTES: usize = 8 + 4;
/// Payload checksum.
pub const FRAME_TRAILER_BYTES: usize = 4;

/// Result of attempting to decode one frame from a byte buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A full, checksum-valid frame. `consumed` covers header, payload and
    /// trailer.
    Complete { payload: Vec<u8>, consumed: usize },
    /// Not (yet) a full valid frame. Also returned for corrupt bytes, under
    /// the policy that a concurrent writer may still be flushing.
    Incomplete,
}

/// Attempts to decode the frame starting at the beginning of `buf`.
pub fn decode_frame(buf: &[u8]) -> FrameOutcome {
    if buf.len() < FRAME_HEADER_BYTES {
        return FrameOutcome::Incomplete;
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&buf[..8]);
    let payload_len = u64::from_le_bytes(len_bytes) as usize;

    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&buf[8..12]);
    if crc32fast::hash(&len_bytes) != u32::from_le_bytes(crc_bytes) {
        return FrameOutcome::Incomplete;
    }

    let total = FRAME_HEADER_BYTES + payload_len + FRAME_TRAILER_BYTES;
    if buf.len() < total {
        return FrameOutcome::Incomplete;
    }

    let payload = &buf[FRAME_HEADER_BYTES..FRAME_HEADER_BYTES + payload_len];
    crc_bytes.copy_from_slice(&buf[FRAME_HEADER_BYTES + payload_len..total]);
    if crc32fast::hash(payload) != u32::from_le_bytes(crc_bytes) {
        return FrameOutcome::Incomplete;
    }

    FrameOutcome::Complete {
        payload: payload.to_vec(),
        consumed: total,
    }
}

/// Wraps `payload` in a frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len_bytes = (payload.len() as u64).to_le_bytes();
    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len() + FRAME_TRAILER_BYTES);
    frame.extend_from_slice(&len_bytes);
    frame.extend_from_slice(&crc32fast::hash(&len_bytes).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame
}

/// One decoded unit of log data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEvent {
    /// Producer step counter. Not required to be unique across kinds.
    pub step: i64,
    /// Wall-clock time of the write, in seconds since the epoch.
    pub wall_time: f64,
    pub payload: RecordPayload,
}

/// Record payload, resolved into its kind once at decode time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordPayload {
    /// A small structured value, batched into size-bounded requests.
    Scalar {
        tag: String,
        value: f64,
        #[serde(default)]
        metadata: Option<String>,
    },
    /// A large binary payload, streamed in chunks.
    Blob {
        tag: String,
        data: Vec<u8>,
        #[serde(default)]
        metadata: Option<String>,
    },
}

impl RecordEvent {
    /// Decodes an event from the payload of a checksum-valid frame.
    pub fn from_payload(payload: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(payload)
    }

    /// Encodes this event as a complete frame, ready to append to a log file.
    pub fn to_frame(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        Ok(encode_frame(&rmp_serde::to_vec(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_event(step: i64, tag: &str, value: f64) -> RecordEvent {
        RecordEvent {
            step,
            wall_time: 1_700_000_000.5,
            payload: RecordPayload::Scalar {
                tag: tag.to_string(),
                value,
                metadata: None,
            },
        }
    }

    #[test]
    fn frame_round_trip() {
        let event = scalar_event(7, "loss", 0.25);
        let frame = event.to_frame().unwrap();
        match decode_frame(&frame) {
            FrameOutcome::Complete { payload, consumed } => {
                assert_eq!(consumed, frame.len());
                assert_eq!(RecordEvent::from_payload(&payload).unwrap(), event);
            }
            FrameOutcome::Incomplete => panic!("frame should be complete"),
        }
    }

    #[test]
    fn short_buffer_is_incomplete() {
        let frame = scalar_event(1, "loss", 1.0).to_frame().unwrap();
        for cut in 0..frame.len() {
            assert_eq!(decode_frame(&frame[..cut]), FrameOutcome::Incomplete);
        }
    }

    #[test]
    fn corrupt_length_crc_is_incomplete() {
        let mut frame = scalar_event(1, "loss", 1.0).to_frame().unwrap();
        frame[9] ^= 0xff;
        assert_eq!(decode_frame(&frame), FrameOutcome::Incomplete);
    }

    #[test]
    fn corrupt_payload_is_incomplete() {
        let mut frame = scalar_event(1, "loss", 1.0).to_frame().unwrap();
        let idx = FRAME_HEADER_BYTES + 2;
        frame[idx] ^= 0xff;
        assert_eq!(decode_frame(&frame), FrameOutcome::Incomplete);
    }

    #[test]
    fn blob_payload_round_trips() {
        let event = RecordEvent {
            step: 3,
            wall_time: 12.0,
            payload: RecordPayload::Blob {
                tag: "graph".to_string(),
                data: vec![0xde, 0xad, 0xbe, 0xef],
                metadata: Some("graph/v1".to_string()),
            },
        };
        let frame = event.to_frame().unwrap();
        let FrameOutcome::Complete { payload, .. } = decode_frame(&frame) else {
            panic!("frame should be complete");
        };
        assert_eq!(RecordEvent::from_payload(&payload).unwrap(), event);
    }

    #[test]
    fn decode_consumes_only_first_frame() {
        let first = scalar_event(1, "a", 1.0).to_frame().unwrap();
        let second = scalar_event(2, "b", 2.0).to_frame().unwrap();
        let mut buf = first.clone();
        buf.extend_from_slice(&second);
        let FrameOutcome::Complete { consumed, .. } = decode_frame(&buf) else {
            panic!("frame should be complete");
        };
        assert_eq!(consumed, first.len());
    }
}
