//! Telemetry payload decoder.
//!
//! ```text
//!  header (13)   : timestamp:u32 | digital_in:u16 | relay_out:u16 | alarm_bits:u32 | count:u8
//!  record (10)×N : id:u8 | pv_x10:i16 | sv_x10:i16 | out_x10:u16 | mode:u8 | age_ms:u16
//!  run state (16): machine_state:u8 | elapsed_ms:u32 | remaining_ms:u32 | target_x10:i16
//!                  | step:u8 | interlock:u8 | lazy_poll:u8 | idle_timeout_min:u8 | reserved:u8
//! ```
//!
//! The run-state block is optional and parsed only when enough bytes
//! remain after the controller records. A short controller section fails
//! the whole snapshot.

use serde::{Deserialize, Serialize};

use crate::error::TelemetryError;
use crate::protocol::cursor::{Cursor, put};
use crate::protocol::frame::{MAX_PAYLOAD_LEN, Payload};

pub const HEADER_LEN: usize = 13;
pub const CONTROLLER_RECORD_LEN: usize = 10;
pub const RUN_STATE_LEN: usize = 16;

/// Most controller records a single frame can carry.
pub const MAX_CONTROLLERS: usize = (MAX_PAYLOAD_LEN - HEADER_LEN) / CONTROLLER_RECORD_LEN;

/// Signed ×10 fixed-point value (25.3 → 253).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fixed10(pub i16);

impl Fixed10 {
    /// Round to the nearest tenth, saturating at the i16 range.
    pub fn from_f32(value: f32) -> Self {
        let scaled = (value * 10.0).round();
        Self(scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16)
    }

    pub fn to_f32(self) -> f32 {
        self.0 as f32 / 10.0
    }

    pub const fn raw(self) -> i16 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerMode {
    Off,
    Auto,
    Manual,
    Autotune,
    Unknown(u8),
}

impl ControllerMode {
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Off,
            1 => Self::Auto,
            2 => Self::Manual,
            3 => Self::Autotune,
            other => Self::Unknown(other),
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Auto => 1,
            Self::Manual => 2,
            Self::Autotune => 3,
            Self::Unknown(raw) => raw,
        }
    }
}

/// One thermal controller record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControllerSample {
    pub id: u8,
    pub process_value: Fixed10,
    pub setpoint: Fixed10,
    /// Output in tenths of a percent.
    pub output_x10: u16,
    pub mode: ControllerMode,
    /// Age of the reading at the controller, ms.
    pub age_ms: u16,
}

impl ControllerSample {
    pub fn output_percent(&self) -> f32 {
        self.output_x10 as f32 / 10.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MachineState {
    Idle,
    Running,
    Paused,
    Complete,
    Fault,
    Unknown(u8),
}

impl MachineState {
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Paused,
            3 => Self::Complete,
            4 => Self::Fault,
            other => Self::Unknown(other),
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Running => 1,
            Self::Paused => 2,
            Self::Complete => 3,
            Self::Fault => 4,
            Self::Unknown(raw) => raw,
        }
    }
}

/// Optional run-state extension block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunState {
    pub machine_state: MachineState,
    pub elapsed_ms: u32,
    pub remaining_ms: u32,
    pub target: Fixed10,
    pub step: u8,
    pub interlock_bits: u8,
    pub lazy_poll_active: bool,
    pub idle_timeout_min: u8,
}

/// One decoded telemetry frame. Replaced wholesale on every decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    /// Controller clock, ms.
    pub timestamp_ms: u32,
    pub digital_inputs: u16,
    pub relay_outputs: u16,
    pub alarm_bits: u32,
    pub controllers: heapless::Vec<ControllerSample, MAX_CONTROLLERS>,
    pub run_state: Option<RunState>,
}

impl TelemetrySnapshot {
    pub fn controller(&self, id: u8) -> Option<&ControllerSample> {
        self.controllers.iter().find(|c| c.id == id)
    }

    pub fn controller_mut(&mut self, id: u8) -> Option<&mut ControllerSample> {
        self.controllers.iter_mut().find(|c| c.id == id)
    }

    pub fn relay(&self, index: u8) -> bool {
        index < 16 && self.relay_outputs & (1 << index) != 0
    }

    pub fn digital_input(&self, index: u8) -> bool {
        index < 16 && self.digital_inputs & (1 << index) != 0
    }

    /// Decode a TELEMETRY payload.
    pub fn decode(buf: &[u8]) -> Result<Self, TelemetryError> {
        let mut c = Cursor::new(buf);
        let short = TelemetryError::HeaderTooShort { len: buf.len() };
        let timestamp_ms = c.u32().ok_or(short)?;
        let digital_inputs = c.u16().ok_or(short)?;
        let relay_outputs = c.u16().ok_or(short)?;
        let alarm_bits = c.u32().ok_or(short)?;
        let count = c.u8().ok_or(short)?;

        if count as usize > MAX_CONTROLLERS {
            return Err(TelemetryError::TooManyControllers {
                declared: count as usize,
            });
        }
        let truncated = TelemetryError::ControllersTruncated {
            declared: count,
            available: c.remaining(),
        };
        if c.remaining() < count as usize * CONTROLLER_RECORD_LEN {
            return Err(truncated);
        }

        let mut controllers = heapless::Vec::new();
        for _ in 0..count {
            let sample = read_controller(&mut c).ok_or(truncated)?;
            controllers.push(sample).map_err(|_| TelemetryError::TooManyControllers {
                declared: count as usize,
            })?;
        }

        let run_state = if c.remaining() >= RUN_STATE_LEN {
            read_run_state(&mut c)
        } else {
            None
        };

        Ok(Self {
            timestamp_ms,
            digital_inputs,
            relay_outputs,
            alarm_bits,
            controllers,
            run_state,
        })
    }

    /// Encode back to a payload. The engine never sends telemetry; this
    /// serves simulated peers and tests.
    pub fn encode(&self) -> Result<Payload, TelemetryError> {
        let too_many = TelemetryError::TooManyControllers {
            declared: self.controllers.len(),
        };
        let mut out = Payload::new();
        put(&mut out, &self.timestamp_ms.to_le_bytes()).ok_or(too_many)?;
        put(&mut out, &self.digital_inputs.to_le_bytes()).ok_or(too_many)?;
        put(&mut out, &self.relay_outputs.to_le_bytes()).ok_or(too_many)?;
        put(&mut out, &self.alarm_bits.to_le_bytes()).ok_or(too_many)?;
        put(&mut out, &[self.controllers.len() as u8]).ok_or(too_many)?;
        for s in &self.controllers {
            put(&mut out, &[s.id]).ok_or(too_many)?;
            put(&mut out, &s.process_value.raw().to_le_bytes()).ok_or(too_many)?;
            put(&mut out, &s.setpoint.raw().to_le_bytes()).ok_or(too_many)?;
            put(&mut out, &s.output_x10.to_le_bytes()).ok_or(too_many)?;
            put(&mut out, &[s.mode.as_u8()]).ok_or(too_many)?;
            put(&mut out, &s.age_ms.to_le_bytes()).ok_or(too_many)?;
        }
        if let Some(rs) = &self.run_state {
            put(&mut out, &[rs.machine_state.as_u8()]).ok_or(too_many)?;
            put(&mut out, &rs.elapsed_ms.to_le_bytes()).ok_or(too_many)?;
            put(&mut out, &rs.remaining_ms.to_le_bytes()).ok_or(too_many)?;
            put(&mut out, &rs.target.raw().to_le_bytes()).ok_or(too_many)?;
            put(
                &mut out,
                &[
                    rs.step,
                    rs.interlock_bits,
                    u8::from(rs.lazy_poll_active),
                    rs.idle_timeout_min,
                    0,
                ],
            )
            .ok_or(too_many)?;
        }
        Ok(out)
    }
}

fn read_controller(c: &mut Cursor<'_>) -> Option<ControllerSample> {
    Some(ControllerSample {
        id: c.u8()?,
        process_value: Fixed10(c.i16()?),
        setpoint: Fixed10(c.i16()?),
        output_x10: c.u16()?,
        mode: ControllerMode::from_u8(c.u8()?),
        age_ms: c.u16()?,
    })
}

fn read_run_state(c: &mut Cursor<'_>) -> Option<RunState> {
    let rs = RunState {
        machine_state: MachineState::from_u8(c.u8()?),
        elapsed_ms: c.u32()?,
        remaining_ms: c.u32()?,
        target: Fixed10(c.i16()?),
        step: c.u8()?,
        interlock_bits: c.u8()?,
        lazy_poll_active: c.u8()? != 0,
        idle_timeout_min: c.u8()?,
    };
    let _reserved = c.u8()?;
    Some(rs)
}
