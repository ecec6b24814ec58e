//! Controller wire protocol.
//!
//! ```text
//!  frame     : header(6) | payload(0..=504) | crc16(2)
//!  messages  : COMMAND / COMMAND_ACK / EVENT payload layouts
//!  telemetry : 13-byte header, N x 10-byte controller records, 16-byte run state
//! ```
//!
//! Multi-byte integers are little-endian throughout. This layer is pure:
//! no clocks, no I/O, no logging.

pub mod cursor;
pub mod frame;
pub mod messages;
pub mod telemetry;

pub use frame::{Frame, MessageType, crc16_ccitt_false};
pub use messages::{AckPayload, AckStatus, CommandId, CommandPayload, EventPayload, Severity};
pub use telemetry::{Fixed10, TelemetrySnapshot};
