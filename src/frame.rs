//! Wire framing: message kinds, the 4-byte header, and the decode loop
//! that turns a [`RingBuffer`] into a stream of whole [`Frame`]s.
//!
//! Framing uses the host's native byte order — the transport is assumed
//! same-architecture (see SPEC_FULL.md §9 for the portability caveat).

use crate::error::ProtocolError;
use crate::ring::RingBuffer;
use std::io::{self, Write};

/// Size of the on-wire header: `u16` kind + `u16` length.
pub const HEADER_SIZE: usize = 4;

/// Largest payload a single frame may carry. Larger payloads (e.g. a
/// flashed image) are chunked by the sender into multiple frames.
pub const MAX_PAYLOAD: usize = 8 * 1024;

/// Closed enumeration of message kinds. Numeric codes are part of the
/// wire format and must stay stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    SelectBoard = 0,
    Console = 1,
    HardReset = 2,
    PowerOn = 3,
    PowerOff = 4,
    FastbootPresent = 5,
    FastbootDownload = 6,
    FastbootBoot = 7,
    FastbootContinue = 8,
    StatusUpdate = 9,
    VbusOn = 10,
    VbusOff = 11,
    SendBreak = 12,
    ListDevices = 13,
    BoardInfo = 14,
}

impl MessageKind {
    pub fn from_u16(v: u16) -> Result<Self, ProtocolError> {
        use MessageKind::*;
        Ok(match v {
            0 => SelectBoard,
            1 => Console,
            2 => HardReset,
            3 => PowerOn,
            4 => PowerOff,
            5 => FastbootPresent,
            6 => FastbootDownload,
            7 => FastbootBoot,
            8 => FastbootContinue,
            9 => StatusUpdate,
            10 => VbusOn,
            11 => VbusOff,
            12 => SendBreak,
            13 => ListDevices,
            14 => BoardInfo,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }
}

/// A decoded frame: kind plus an owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn empty(kind: MessageKind) -> Self {
        Self::new(kind, Vec::new())
    }

    /// Serialize header + payload into a single buffer.
    ///
    /// Splitting this into one or two underlying `write`s is left to the
    /// caller (the outbound work queue, §4.4); encoding itself is pure.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&(self.kind as u16).to_ne_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_ne_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn write_to(&self, w: &mut dyn Write) -> io::Result<()> {
        w.write_all(&self.encode())
    }
}

/// Decodes a [`RingBuffer`] into whole frames as bytes arrive.
///
/// The decode loop (§4.2): while at least a header is buffered, peek it;
/// if the full payload hasn't arrived yet, stop and wait for more bytes;
/// otherwise consume the whole frame and yield it.
pub struct FrameDecoder {
    ring: RingBuffer,
}

impl FrameDecoder {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RingBuffer::new(capacity),
        }
    }

    pub fn ring_mut(&mut self) -> &mut RingBuffer {
        &mut self.ring
    }

    /// Decode every whole frame currently buffered.
    ///
    /// Returns `Err` on the first malformed frame (unknown kind or
    /// over-length payload); per §4.2 this is fatal and the caller must
    /// terminate the session rather than attempt to resynchronize.
    pub fn decode_all(&mut self) -> Result<Vec<Frame>, ProtocolError> {
        let mut frames = Vec::new();
        loop {
            if self.ring.available() < HEADER_SIZE {
                break;
            }
            let header = self.ring.peek(HEADER_SIZE)?;
            let kind_raw = u16::from_ne_bytes([header[0], header[1]]);
            let len = u16::from_ne_bytes([header[2], header[3]]) as usize;

            if len > MAX_PAYLOAD {
                return Err(ProtocolError::PayloadTooLarge {
                    len,
                    max: MAX_PAYLOAD,
                });
            }

            if self.ring.available() < HEADER_SIZE + len {
                break; // partial frame; wait for more bytes
            }

            let kind = MessageKind::from_u16(kind_raw)?;
            self.ring.read(HEADER_SIZE)?;
            let payload = self.ring.read(len)?;
            frames.push(Frame::new(kind, payload));
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::io::Cursor;

    #[test]
    fn encodes_header_then_payload() {
        let frame = Frame::new(MessageKind::Console, vec![1, 2, 3]);
        let bytes = frame.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + 3);
        assert_eq!(&bytes[HEADER_SIZE..], &[1, 2, 3]);
    }

    #[test]
    fn decodes_a_single_frame_split_across_fills() {
        let mut decoder = FrameDecoder::new(crate::ring::MIN_CAPACITY);
        let encoded = Frame::new(MessageKind::StatusUpdate, b"hi".to_vec()).encode();

        // feed it one byte at a time to exercise the partial-frame path
        for byte in &encoded {
            let mut src = Cursor::new(vec![*byte]);
            decoder.ring_mut().fill(&mut src).unwrap();
            let frames = decoder.decode_all().unwrap();
            if frames.is_empty() {
                continue;
            }
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].kind, MessageKind::StatusUpdate);
            assert_eq!(frames[0].payload, b"hi");
        }
    }

    #[test]
    fn unknown_kind_is_fatal() {
        let mut decoder = FrameDecoder::new(crate::ring::MIN_CAPACITY);
        let mut bytes = 0xBEEFu16.to_ne_bytes().to_vec();
        bytes.extend_from_slice(&0u16.to_ne_bytes());
        let mut src = Cursor::new(bytes);
        decoder.ring_mut().fill(&mut src).unwrap();
        assert!(matches!(
            decoder.decode_all(),
            Err(ProtocolError::UnknownKind(0xBEEF))
        ));
    }

    #[quickcheck]
    fn round_trips_arbitrary_message_sequences(kinds: Vec<u8>, payload_seed: Vec<u8>) -> bool {
        // Build a sequence of valid frames from the fuzz input, encode
        // them all, then feed the result through the decoder one byte at
        // a time. The decoded sequence must match exactly.
        let kinds: Vec<MessageKind> = kinds
            .into_iter()
            .filter_map(|k| MessageKind::from_u16((k % 15) as u16).ok())
            .collect();
        if kinds.is_empty() {
            return true;
        }
        let chunk = (payload_seed.len() / kinds.len().max(1)).max(1);
        let frames: Vec<Frame> = kinds
            .iter()
            .enumerate()
            .map(|(i, k)| {
                let start = (i * chunk).min(payload_seed.len());
                let end = ((i + 1) * chunk).min(payload_seed.len());
                Frame::new(*k, payload_seed[start..end].to_vec())
            })
            .collect();

        let mut encoded = Vec::new();
        for f in &frames {
            encoded.extend(f.encode());
        }

        let mut decoder = FrameDecoder::new((encoded.len() + HEADER_SIZE).max(crate::ring::MIN_CAPACITY));
        let mut decoded = Vec::new();
        for byte in &encoded {
            let mut src = Cursor::new(vec![*byte]);
            if decoder.ring_mut().fill(&mut src).is_err() {
                return false;
            }
            match decoder.decode_all() {
                Ok(mut fs) => decoded.append(&mut fs),
                Err(_) => return false,
            }
        }

        decoded == frames
    }
}
