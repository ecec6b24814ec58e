//! Checksummed frame codec.
//!
//! Wire format:
//! ```text
//! ┌─────────┬──────────┬──────────────┬─────────────┬─────────────┬─────────────┐
//! │ Version │ Type     │ Sequence     │ Payload len │ Payload     │ CRC-16      │
//! │ u8      │ u8       │ LE u16       │ LE u16      │ N bytes     │ LE u16      │
//! └─────────┴──────────┴──────────────┴─────────────┴─────────────┴─────────────┘
//! ```
//!
//! The checksum is CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, no
//! reflection, no final XOR) over everything from `version` through the
//! last payload byte. One frame travels per transport notification, so
//! decoding works on whole buffers; bytes after the checksum are ignored.

use serde::Serialize;

use crate::error::FrameError;
use crate::protocol::cursor::put;

/// Protocol version this engine speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// version + type + sequence + payload_len.
pub const HEADER_LEN: usize = 6;

/// Trailing CRC-16.
pub const CHECKSUM_LEN: usize = 2;

/// Smallest decodable buffer (empty payload).
pub const MIN_FRAME_LEN: usize = HEADER_LEN + CHECKSUM_LEN;

/// Largest payload accepted in either direction. A full frame fits a
/// 512-byte notification.
pub const MAX_PAYLOAD_LEN: usize = 504;

/// Largest encoded frame.
pub const MAX_FRAME_LEN: usize = MIN_FRAME_LEN + MAX_PAYLOAD_LEN;

/// Frame payload storage.
pub type Payload = heapless::Vec<u8, MAX_PAYLOAD_LEN>;

/// Encoded frame bytes, ready for the transport.
pub type EncodedFrame = heapless::Vec<u8, MAX_FRAME_LEN>;

/// Message type carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum MessageType {
    /// Controller → console, periodic status.
    Telemetry = 0x01,
    /// Console → controller.
    Command = 0x10,
    /// Controller → console, correlated by acknowledged sequence.
    CommandAck = 0x11,
    /// Controller → console, asynchronous notification.
    Event = 0x20,
}

impl MessageType {
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(Self::Telemetry),
            0x10 => Some(Self::Command),
            0x11 => Some(Self::CommandAck),
            0x20 => Some(Self::Event),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A decoded (or about-to-be-encoded) frame. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    version: u8,
    msg_type: MessageType,
    sequence: u16,
    payload: Payload,
    checksum: u16,
}

impl Frame {
    /// Build an outbound frame for the current protocol version.
    pub fn new(msg_type: MessageType, sequence: u16, payload: &[u8]) -> Result<Self, FrameError> {
        let payload = Payload::from_slice(payload).map_err(|_| FrameError::PayloadTooLarge {
            len: payload.len(),
        })?;
        let checksum = frame_checksum(PROTOCOL_VERSION, msg_type, sequence, &payload);
        Ok(Self {
            version: PROTOCOL_VERSION,
            msg_type,
            sequence,
            payload,
            checksum,
        })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Serialise to wire bytes.
    pub fn encode(&self) -> Result<EncodedFrame, FrameError> {
        let too_large = FrameError::PayloadTooLarge {
            len: self.payload.len(),
        };
        let mut out = EncodedFrame::new();
        put(&mut out, &header_bytes(self.version, self.msg_type, self.sequence, self.payload.len()))
            .ok_or(too_large)?;
        put(&mut out, &self.payload).ok_or(too_large)?;
        put(&mut out, &self.checksum.to_le_bytes()).ok_or(too_large)?;
        Ok(out)
    }
}

/// Encode a frame in one step.
pub fn encode(
    msg_type: MessageType,
    sequence: u16,
    payload: &[u8],
) -> Result<EncodedFrame, FrameError> {
    Frame::new(msg_type, sequence, payload)?.encode()
}

/// Decode one frame from a received buffer.
///
/// Checks run in order: minimum length, declared length against the
/// buffer, checksum, version, message type. Version and type are only
/// judged on checksum-valid frames so line noise is never mistaken for an
/// incompatible peer.
pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
    if buf.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort { len: buf.len() });
    }

    let declared = u16::from_le_bytes([buf[4], buf[5]]) as usize;
    let body_end = HEADER_LEN + declared;
    let frame_end = body_end + CHECKSUM_LEN;
    if frame_end > buf.len() {
        return Err(FrameError::Truncated {
            declared,
            available: buf.len().saturating_sub(MIN_FRAME_LEN),
        });
    }

    let expected = crc16_ccitt_false(&buf[..body_end]);
    let actual = u16::from_le_bytes([buf[body_end], buf[body_end + 1]]);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    let version = buf[0];
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }

    let msg_type = MessageType::from_u8(buf[1]).ok_or(FrameError::UnknownType(buf[1]))?;
    let payload = Payload::from_slice(&buf[HEADER_LEN..body_end])
        .map_err(|_| FrameError::PayloadTooLarge { len: declared })?;

    Ok(Frame {
        version,
        msg_type,
        sequence: u16::from_le_bytes([buf[2], buf[3]]),
        payload,
        checksum: actual,
    })
}

/// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, MSB-first, no final XOR.
pub fn crc16_ccitt_false(bytes: &[u8]) -> u16 {
    crc16_update(0xFFFF, bytes)
}

fn crc16_update(mut crc: u16, bytes: &[u8]) -> u16 {
    for &b in bytes {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn header_bytes(version: u8, msg_type: MessageType, sequence: u16, len: usize) -> [u8; HEADER_LEN] {
    let seq = sequence.to_le_bytes();
    let len = (len as u16).to_le_bytes();
    [version, msg_type.as_u8(), seq[0], seq[1], len[0], len[1]]
}

fn frame_checksum(version: u8, msg_type: MessageType, sequence: u16, payload: &[u8]) -> u16 {
    let header = header_bytes(version, msg_type, sequence, payload.len());
    crc16_update(crc16_update(0xFFFF, &header), payload)
}
