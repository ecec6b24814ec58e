//! COMMAND, COMMAND_ACK and EVENT payload layouts, plus the typed
//! argument encoders for the well-known commands.
//!
//! ```text
//!  COMMAND     : cmd_id:u16 | flags:u16 (0) | data
//!  COMMAND_ACK : acked_sequence:u16 | cmd_id:u16 | status:u8 | detail:u16 | data
//!  EVENT       : event_id:u16 | severity:u8 | source:u8 | data
//! ```

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PayloadError;
use crate::protocol::cursor::{Cursor, put};
use crate::protocol::frame::{MAX_PAYLOAD_LEN, Payload};
use crate::protocol::telemetry::Fixed10;

/// Fixed COMMAND header bytes.
pub const COMMAND_HEADER_LEN: usize = 4;
/// Fixed COMMAND_ACK header bytes.
pub const ACK_HEADER_LEN: usize = 7;
/// Fixed EVENT header bytes.
pub const EVENT_HEADER_LEN: usize = 4;

pub const MAX_COMMAND_DATA: usize = MAX_PAYLOAD_LEN - COMMAND_HEADER_LEN;
pub const MAX_ACK_DATA: usize = MAX_PAYLOAD_LEN - ACK_HEADER_LEN;
pub const MAX_EVENT_DATA: usize = MAX_PAYLOAD_LEN - EVENT_HEADER_LEN;

pub type CommandData = heapless::Vec<u8, MAX_COMMAND_DATA>;
pub type AckData = heapless::Vec<u8, MAX_ACK_DATA>;
pub type EventData = heapless::Vec<u8, MAX_EVENT_DATA>;

// ---------------------------------------------------------------------------
// Command ids
// ---------------------------------------------------------------------------

/// Controller command identifier. Arbitrary ids can be sent; the
/// associated constants are the ones this engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(pub u16);

impl CommandId {
    pub const OPEN_SESSION: Self = Self(0x0001);
    pub const KEEPALIVE: Self = Self(0x0002);
    pub const CLOSE_SESSION: Self = Self(0x0003);
    pub const START_RUN: Self = Self(0x0100);
    pub const PAUSE_RUN: Self = Self(0x0101);
    pub const RESUME_RUN: Self = Self(0x0102);
    pub const STOP_RUN: Self = Self(0x0103);
    pub const SET_SETPOINT: Self = Self(0x0200);
    pub const SET_RELAY: Self = Self(0x0201);
    pub const ACK_ALARMS: Self = Self(0x0300);
    pub const SET_LAZY_POLL: Self = Self(0x0301);

    pub fn name(self) -> &'static str {
        match self {
            Self::OPEN_SESSION => "OPEN_SESSION",
            Self::KEEPALIVE => "KEEPALIVE",
            Self::CLOSE_SESSION => "CLOSE_SESSION",
            Self::START_RUN => "START_RUN",
            Self::PAUSE_RUN => "PAUSE_RUN",
            Self::RESUME_RUN => "RESUME_RUN",
            Self::STOP_RUN => "STOP_RUN",
            Self::SET_SETPOINT => "SET_SETPOINT",
            Self::SET_RELAY => "SET_RELAY",
            Self::ACK_ALARMS => "ACK_ALARMS",
            Self::SET_LAZY_POLL => "SET_LAZY_POLL",
            _ => "VENDOR",
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:04X})", self.name(), self.0)
    }
}

// ---------------------------------------------------------------------------
// COMMAND
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPayload {
    pub cmd_id: CommandId,
    /// Reserved, always 0 on send.
    pub flags: u16,
    pub data: CommandData,
}

impl CommandPayload {
    pub fn new(cmd_id: CommandId, data: &[u8]) -> Result<Self, PayloadError> {
        Ok(Self {
            cmd_id,
            flags: 0,
            data: CommandData::from_slice(data)
                .map_err(|_| PayloadError::DataTooLarge { len: data.len() })?,
        })
    }

    pub fn encode(&self) -> Result<Payload, PayloadError> {
        let mut out = Payload::new();
        let overflow = PayloadError::DataTooLarge {
            len: self.data.len(),
        };
        put(&mut out, &self.cmd_id.0.to_le_bytes()).ok_or(overflow)?;
        put(&mut out, &self.flags.to_le_bytes()).ok_or(overflow)?;
        put(&mut out, &self.data).ok_or(overflow)?;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        let short = PayloadError::TooShort {
            kind: "command",
            len: buf.len(),
        };
        let mut c = Cursor::new(buf);
        let cmd_id = CommandId(c.u16().ok_or(short)?);
        let flags = c.u16().ok_or(short)?;
        let rest = c.rest();
        Ok(Self {
            cmd_id,
            flags,
            data: CommandData::from_slice(rest)
                .map_err(|_| PayloadError::DataTooLarge { len: rest.len() })?,
        })
    }
}

// ---------------------------------------------------------------------------
// COMMAND_ACK
// ---------------------------------------------------------------------------

/// Acknowledgement status reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AckStatus {
    Ok,
    RejectedPolicy,
    InvalidArgs,
    Busy,
    HwFault,
    NotReady,
    TimeoutDownstream,
    Unknown(u8),
}

impl AckStatus {
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::RejectedPolicy,
            2 => Self::InvalidArgs,
            3 => Self::Busy,
            4 => Self::HwFault,
            5 => Self::NotReady,
            6 => Self::TimeoutDownstream,
            other => Self::Unknown(other),
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::RejectedPolicy => 1,
            Self::InvalidArgs => 2,
            Self::Busy => 3,
            Self::HwFault => 4,
            Self::NotReady => 5,
            Self::TimeoutDownstream => 6,
            Self::Unknown(raw) => raw,
        }
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Operator-facing reason for a non-OK status.
    pub const fn describe(self) -> &'static str {
        match self {
            Self::Ok => "accepted",
            Self::RejectedPolicy => "refused by controller safety policy",
            Self::InvalidArgs => "value out of range",
            Self::Busy => "controller busy",
            Self::HwFault => "controller hardware fault",
            Self::NotReady => "controller not ready",
            Self::TimeoutDownstream => "controller timed out on a downstream device",
            Self::Unknown(_) => "unrecognised controller status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPayload {
    pub acked_sequence: u16,
    pub cmd_id: CommandId,
    pub status: AckStatus,
    pub detail: u16,
    pub data: AckData,
}

impl AckPayload {
    pub fn encode(&self) -> Result<Payload, PayloadError> {
        let mut out = Payload::new();
        let overflow = PayloadError::DataTooLarge {
            len: self.data.len(),
        };
        put(&mut out, &self.acked_sequence.to_le_bytes()).ok_or(overflow)?;
        put(&mut out, &self.cmd_id.0.to_le_bytes()).ok_or(overflow)?;
        put(&mut out, &[self.status.as_u8()]).ok_or(overflow)?;
        put(&mut out, &self.detail.to_le_bytes()).ok_or(overflow)?;
        put(&mut out, &self.data).ok_or(overflow)?;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        let short = PayloadError::TooShort {
            kind: "ack",
            len: buf.len(),
        };
        let mut c = Cursor::new(buf);
        let acked_sequence = c.u16().ok_or(short)?;
        let cmd_id = CommandId(c.u16().ok_or(short)?);
        let status = AckStatus::from_u8(c.u8().ok_or(short)?);
        let detail = c.u16().ok_or(short)?;
        let rest = c.rest();
        Ok(Self {
            acked_sequence,
            cmd_id,
            status,
            detail,
            data: AckData::from_slice(rest)
                .map_err(|_| PayloadError::DataTooLarge { len: rest.len() })?,
        })
    }
}

// ---------------------------------------------------------------------------
// EVENT
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warn,
    Alarm,
    Critical,
}

impl Severity {
    /// Unknown codes degrade to `Info` rather than failing the event.
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Warn,
            2 => Self::Alarm,
            3 => Self::Critical,
            _ => Self::Info,
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Info => 0,
            Self::Warn => 1,
            Self::Alarm => 2,
            Self::Critical => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventPayload {
    pub event_id: u16,
    pub severity: Severity,
    pub source: u8,
    pub data: EventData,
}

impl EventPayload {
    pub fn encode(&self) -> Result<Payload, PayloadError> {
        let mut out = Payload::new();
        let overflow = PayloadError::DataTooLarge {
            len: self.data.len(),
        };
        put(&mut out, &self.event_id.to_le_bytes()).ok_or(overflow)?;
        put(&mut out, &[self.severity.as_u8(), self.source]).ok_or(overflow)?;
        put(&mut out, &self.data).ok_or(overflow)?;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        let short = PayloadError::TooShort {
            kind: "event",
            len: buf.len(),
        };
        let mut c = Cursor::new(buf);
        let event_id = c.u16().ok_or(short)?;
        let severity = Severity::from_u8(c.u8().ok_or(short)?);
        let source = c.u8().ok_or(short)?;
        let rest = c.rest();
        Ok(Self {
            event_id,
            severity,
            source,
            data: EventData::from_slice(rest)
                .map_err(|_| PayloadError::DataTooLarge { len: rest.len() })?,
        })
    }
}

// ---------------------------------------------------------------------------
// Well-known command arguments
// ---------------------------------------------------------------------------

/// OPEN_SESSION nonce length.
pub const NONCE_LEN: usize = 16;
/// HMAC-SHA256 tag length appended after the nonce when a key is configured.
pub const SESSION_TAG_LEN: usize = 32;

/// `nonce[16] | hmac[32]?`
pub fn open_session_data(
    nonce: &[u8; NONCE_LEN],
    tag: Option<&[u8; SESSION_TAG_LEN]>,
) -> heapless::Vec<u8, { NONCE_LEN + SESSION_TAG_LEN }> {
    let mut out = heapless::Vec::new();
    // Capacity covers both parts.
    let _ = out.extend_from_slice(nonce);
    if let Some(tag) = tag {
        let _ = out.extend_from_slice(tag);
    }
    out
}

/// Session grant carried in the OPEN_SESSION ack's optional data:
/// `session_id:u32 | lease_ms:u32?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionGrant {
    pub session_id: u32,
    pub lease_ms: Option<u32>,
}

impl SessionGrant {
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut c = Cursor::new(data);
        let session_id = c.u32()?;
        let lease_ms = c.u32();
        Some(Self {
            session_id,
            lease_ms,
        })
    }

    pub fn encode(&self) -> heapless::Vec<u8, 8> {
        let mut out = heapless::Vec::new();
        let _ = out.extend_from_slice(&self.session_id.to_le_bytes());
        if let Some(lease) = self.lease_ms {
            let _ = out.extend_from_slice(&lease.to_le_bytes());
        }
        out
    }
}

/// KEEPALIVE / CLOSE_SESSION argument.
pub fn session_id_data(session_id: u32) -> [u8; 4] {
    session_id.to_le_bytes()
}

/// START_RUN argument: `mill_ms:u32 | hold_ms:u32 | cycles:u16`.
pub fn start_run_data(mill_ms: u32, hold_ms: u32, cycles: u16) -> [u8; 10] {
    let mut out = [0u8; 10];
    out[0..4].copy_from_slice(&mill_ms.to_le_bytes());
    out[4..8].copy_from_slice(&hold_ms.to_le_bytes());
    out[8..10].copy_from_slice(&cycles.to_le_bytes());
    out
}

/// SET_SETPOINT argument: `controller_id:u8 | setpoint_x10:i16`.
pub fn setpoint_data(controller: u8, value: Fixed10) -> [u8; 3] {
    let raw = value.raw().to_le_bytes();
    [controller, raw[0], raw[1]]
}

/// SET_RELAY argument: `mask:u16 | state:u16`.
pub fn relay_data(mask: u16, state: u16) -> [u8; 4] {
    let m = mask.to_le_bytes();
    let s = state.to_le_bytes();
    [m[0], m[1], s[0], s[1]]
}

/// ACK_ALARMS argument.
pub fn alarm_mask_data(mask: u32) -> [u8; 4] {
    mask.to_le_bytes()
}

/// SET_LAZY_POLL argument.
pub fn lazy_poll_data(enabled: bool) -> [u8; 1] {
    [u8::from(enabled)]
}
