//! # Wire Frame Codec
//!
//! Parses the binary messages delivered by the transport. Every message starts
//! with a one-byte frame type; only type `6` carries audio and is decoded in
//! full. All integers are little-endian.
//!
//! ## Audio frame layout:
//! ```text
//! u8  frame_type (= 6)
//! u8  flag              0 = start, 1 = continue, 2 = end
//! u32 group_id_len      + bytes
//! u32 sender_id_len     + bytes
//! u32 sender_name_len   + UTF-8 bytes
//! u64 timestamp
//! u32 payload_len       + compressed audio bytes
//! ```
//!
//! Every length is checked against the bytes actually left in the message
//! before anything is allocated, so a hostile length prefix cannot trigger a
//! large allocation or an out-of-bounds read.

use crate::error::FrameError;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// Frame type discriminator for audio frames.
pub const AUDIO_FRAME_TYPE: u8 = 6;

/// Talk-burst lifecycle marker carried in every audio frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFlag {
    Start,
    Continue,
    End,
    /// Unknown marker; the frame still plays but does not touch recording
    Other(u8),
}

impl From<u8> for SessionFlag {
    fn from(value: u8) -> Self {
        match value {
            0 => SessionFlag::Start,
            1 => SessionFlag::Continue,
            2 => SessionFlag::End,
            other => SessionFlag::Other(other),
        }
    }
}

impl From<SessionFlag> for u8 {
    fn from(flag: SessionFlag) -> Self {
        match flag {
            SessionFlag::Start => 0,
            SessionFlag::Continue => 1,
            SessionFlag::End => 2,
            SessionFlag::Other(v) => v,
        }
    }
}

/// One decoded audio frame.
///
/// `group_id`, `sender_id` and `timestamp` are routed through untouched; the
/// pipeline only reads `flag`, `payload` and (for logs) `sender_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub flag: SessionFlag,
    pub group_id: Vec<u8>,
    pub sender_id: Vec<u8>,
    pub sender_name: String,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

/// Result of parsing one transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Audio(AudioFrame),
    /// Anything that is not an audio frame; its body is never inspected
    Other { frame_type: u8 },
}

impl AudioFrame {
    /// Parse one complete transport message.
    ///
    /// ## Returns:
    /// - **`WireMessage::Audio`** for a fully present audio frame
    /// - **`WireMessage::Other`** for every other frame type (body not read)
    /// - **`FrameError`** if the message is empty or any field is cut short
    pub fn parse(bytes: &[u8]) -> Result<WireMessage, FrameError> {
        let mut reader = FrameReader::new(bytes);

        let frame_type = reader.u8("frame_type").map_err(|_| FrameError::Empty)?;
        if frame_type != AUDIO_FRAME_TYPE {
            return Ok(WireMessage::Other { frame_type });
        }

        let flag = SessionFlag::from(reader.u8("flag")?);
        let group_id = reader.block("group_id")?;
        let sender_id = reader.block("sender_id")?;
        let sender_name = String::from_utf8_lossy(&reader.block("sender_name")?).into_owned();
        let timestamp = reader.u64("timestamp")?;
        let payload = reader.block("payload")?;

        Ok(WireMessage::Audio(AudioFrame {
            flag,
            group_id,
            sender_id,
            sender_name,
            timestamp,
            payload,
        }))
    }

    /// Serialize into the wire layout accepted by [`AudioFrame::parse`].
    pub fn encode(&self) -> Vec<u8> {
        let name = self.sender_name.as_bytes();
        let mut out = Vec::with_capacity(
            2 + 4 * 4 + 8 + self.group_id.len() + self.sender_id.len() + name.len() + self.payload.len(),
        );

        out.push(AUDIO_FRAME_TYPE);
        out.push(self.flag.into());
        write_block(&mut out, &self.group_id);
        write_block(&mut out, &self.sender_id);
        write_block(&mut out, name);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        write_block(&mut out, &self.payload);
        out
    }
}

fn write_block(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// Bounds-checked little-endian reader over one message.
struct FrameReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> FrameReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len() as u64;
        len.saturating_sub(self.cursor.position()) as usize
    }

    fn ensure(&self, field: &'static str, needed: usize) -> Result<(), FrameError> {
        let available = self.remaining();
        if available < needed {
            return Err(FrameError::Truncated {
                field,
                needed,
                available,
            });
        }
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, FrameError> {
        self.ensure(field, 1)?;
        self.cursor.read_u8().map_err(|_| truncated(field, 1))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, FrameError> {
        self.ensure(field, 4)?;
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated(field, 4))
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, FrameError> {
        self.ensure(field, 8)?;
        self.cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| truncated(field, 8))
    }

    /// Length-prefixed byte block.
    fn block(&mut self, field: &'static str) -> Result<Vec<u8>, FrameError> {
        let len = self.u32(field)? as usize;
        self.ensure(field, len)?;
        let mut buf = vec![0u8; len];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| truncated(field, len))?;
        Ok(buf)
    }
}

fn truncated(field: &'static str, needed: usize) -> FrameError {
    FrameError::Truncated {
        field,
        needed,
        available: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_frame(flag: SessionFlag, payload: &[u8]) -> AudioFrame {
        AudioFrame {
            flag,
            group_id: b"group-7".to_vec(),
            sender_id: b"teacher-42".to_vec(),
            sender_name: "王老师".to_string(),
            timestamp: 1_700_000_000_123,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn parses_hand_built_message() {
        let mut msg = vec![6u8, 1];
        msg.extend_from_slice(&2u32.to_le_bytes());
        msg.extend_from_slice(b"g1");
        msg.extend_from_slice(&1u32.to_le_bytes());
        msg.extend_from_slice(b"s");
        msg.extend_from_slice(&3u32.to_le_bytes());
        msg.extend_from_slice(b"Ann");
        msg.extend_from_slice(&99u64.to_le_bytes());
        msg.extend_from_slice(&4u32.to_le_bytes());
        msg.extend_from_slice(&[0xFF, 0xF1, 0x50, 0x80]);

        let WireMessage::Audio(frame) = AudioFrame::parse(&msg).unwrap() else {
            panic!("expected an audio frame");
        };
        assert_eq!(frame.flag, SessionFlag::Continue);
        assert_eq!(frame.group_id, b"g1");
        assert_eq!(frame.sender_id, b"s");
        assert_eq!(frame.sender_name, "Ann");
        assert_eq!(frame.timestamp, 99);
        assert_eq!(frame.payload, vec![0xFF, 0xF1, 0x50, 0x80]);
    }

    #[test]
    fn encodes_the_exact_wire_layout() {
        let frame = AudioFrame {
            flag: SessionFlag::End,
            group_id: b"g".to_vec(),
            sender_id: Vec::new(),
            sender_name: "A".to_string(),
            timestamp: 0x0102,
            payload: vec![0xAA, 0xBB],
        };
        assert_eq!(
            frame.encode(),
            vec![
                6, 2, //
                1, 0, 0, 0, b'g', //
                0, 0, 0, 0, //
                1, 0, 0, 0, b'A', //
                0x02, 0x01, 0, 0, 0, 0, 0, 0, //
                2, 0, 0, 0, 0xAA, 0xBB,
            ]
        );
    }

    #[test]
    fn non_audio_frames_are_not_inspected() {
        // Garbage after the type byte must not matter.
        let msg = [3u8, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(
            AudioFrame::parse(&msg).unwrap(),
            WireMessage::Other { frame_type: 3 }
        );
    }

    #[test]
    fn empty_message_is_rejected() {
        assert_eq!(AudioFrame::parse(&[]), Err(FrameError::Empty));
    }

    #[test]
    fn oversized_length_prefix_does_not_allocate() {
        let mut msg = vec![6u8, 0];
        msg.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = AudioFrame::parse(&msg).unwrap_err();
        assert_eq!(
            err,
            FrameError::Truncated {
                field: "group_id",
                needed: u32::MAX as usize,
                available: 0,
            }
        );
    }

    #[test]
    fn unknown_flag_survives_encoding() {
        let frame = sample_frame(SessionFlag::Other(9), b"x");
        let WireMessage::Audio(parsed) = AudioFrame::parse(&frame.encode()).unwrap() else {
            panic!("expected an audio frame");
        };
        assert_eq!(parsed.flag, SessionFlag::Other(9));
    }

    #[test]
    fn trailing_bytes_after_payload_are_ignored() {
        let mut bytes = sample_frame(SessionFlag::End, b"abc").encode();
        bytes.extend_from_slice(b"junk");
        let WireMessage::Audio(parsed) = AudioFrame::parse(&bytes).unwrap() else {
            panic!("expected an audio frame");
        };
        assert_eq!(parsed.payload, b"abc");
    }

    prop_compose! {
        fn arb_frame()(
            flag in 0u8..=2,
            group_id in prop::collection::vec(any::<u8>(), 0..32),
            sender_id in prop::collection::vec(any::<u8>(), 0..32),
            sender_name in "\\PC{0,16}",
            timestamp in any::<u64>(),
            payload in prop::collection::vec(any::<u8>(), 0..512),
        ) -> AudioFrame {
            AudioFrame {
                flag: SessionFlag::from(flag),
                group_id,
                sender_id,
                sender_name,
                timestamp,
                payload,
            }
        }
    }

    proptest! {
        #[test]
        fn encode_then_parse_preserves_fields(frame in arb_frame()) {
            let parsed = AudioFrame::parse(&frame.encode()).unwrap();
            prop_assert_eq!(parsed, WireMessage::Audio(frame));
        }

        #[test]
        fn every_strict_prefix_fails(frame in arb_frame(), cut in any::<prop::sample::Index>()) {
            let bytes = frame.encode();
            let len = cut.index(bytes.len());
            prop_assert!(AudioFrame::parse(&bytes[..len]).is_err());
        }
    }
}
