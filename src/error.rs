//! Unified error types for the link engine.
//!
//! A single `Error` enum that every subsystem converts into, with one
//! focused enum per layer underneath it. Frame- and payload-level errors
//! are `Copy` so they can be counted and logged without allocation;
//! [`CommandError`] is `Clone` because it is delivered to waiting callers
//! across task boundaries.

use core::fmt;

use crate::protocol::messages::AckStatus;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the crate funnels into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Frame(FrameError),
    Payload(PayloadError),
    Telemetry(TelemetryError),
    Command(CommandError),
    Session(SessionError),
    Recipe(RecipeError),
    Transition(TransitionError),
    Config(ConfigError),
    Transport(TransportError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "frame: {e}"),
            Self::Payload(e) => write!(f, "payload: {e}"),
            Self::Telemetry(e) => write!(f, "telemetry: {e}"),
            Self::Command(e) => write!(f, "command: {e}"),
            Self::Session(e) => write!(f, "session: {e}"),
            Self::Recipe(e) => write!(f, "recipe: {e}"),
            Self::Transition(e) => write!(f, "link state: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Frame codec errors
// ---------------------------------------------------------------------------

/// Why a raw buffer could not be turned into a [`Frame`](crate::protocol::frame::Frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the fixed header plus checksum.
    TooShort { len: usize },
    /// The header declares more payload than the buffer holds.
    Truncated { declared: usize, available: usize },
    /// Trailing checksum does not match the computed CRC.
    ChecksumMismatch { expected: u16, actual: u16 },
    /// Checksum is valid but the peer speaks another protocol version.
    UnsupportedVersion(u8),
    /// Checksum is valid but the message type is not recognised.
    UnknownType(u8),
    /// Payload does not fit a single frame.
    PayloadTooLarge { len: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len } => write!(f, "buffer too short ({len} bytes)"),
            Self::Truncated {
                declared,
                available,
            } => write!(
                f,
                "truncated payload (declared {declared}, available {available})"
            ),
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "checksum mismatch (computed 0x{expected:04X}, trailer 0x{actual:04X})"
            ),
            Self::UnsupportedVersion(v) => write!(f, "unsupported protocol version {v}"),
            Self::UnknownType(t) => write!(f, "unknown message type 0x{t:02X}"),
            Self::PayloadTooLarge { len } => write!(f, "payload too large ({len} bytes)"),
        }
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

// ---------------------------------------------------------------------------
// Message payload errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadError {
    /// Payload shorter than the fixed fields of its message kind.
    TooShort { kind: &'static str, len: usize },
    /// Variable data does not fit the frame.
    DataTooLarge { len: usize },
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { kind, len } => write!(f, "{kind} payload too short ({len} bytes)"),
            Self::DataTooLarge { len } => write!(f, "data too large ({len} bytes)"),
        }
    }
}

impl From<PayloadError> for Error {
    fn from(e: PayloadError) -> Self {
        Self::Payload(e)
    }
}

// ---------------------------------------------------------------------------
// Telemetry decode errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryError {
    /// Fewer than the 13 fixed header bytes.
    HeaderTooShort { len: usize },
    /// The declared controller records do not fit the remaining bytes.
    ControllersTruncated { declared: u8, available: usize },
    /// More controllers than a single frame can carry.
    TooManyControllers { declared: usize },
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeaderTooShort { len } => write!(f, "header too short ({len} bytes)"),
            Self::ControllersTruncated {
                declared,
                available,
            } => write!(
                f,
                "{declared} controllers declared, only {available} bytes of records"
            ),
            Self::TooManyControllers { declared } => {
                write!(f, "too many controllers ({declared})")
            }
        }
    }
}

impl From<TelemetryError> for Error {
    fn from(e: TelemetryError) -> Self {
        Self::Telemetry(e)
    }
}

// ---------------------------------------------------------------------------
// Command outcome errors
// ---------------------------------------------------------------------------

/// Typed failure of a single command. These are local outcomes and never
/// tear the connection down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No acknowledgement arrived before the command's deadline.
    Timeout { sequence: u16 },
    /// The controller answered with a non-OK status.
    Rejected { status: AckStatus, detail: u16 },
    /// The transport dropped while the command was pending.
    Disconnected,
    /// The link is not connected.
    NotConnected,
    /// The link is connected but no session is open.
    NoSession,
    /// The transport refused the outbound bytes.
    Transport(TransportError),
    /// Too many commands already awaiting acknowledgement.
    Busy,
    /// Outbound command rate exceeded.
    RateLimited,
    /// Command data does not fit a frame.
    PayloadTooLarge { len: usize },
    /// The session grant could not be accepted.
    Session(SessionError),
    /// The engine task has shut down.
    EngineStopped,
}

impl CommandError {
    /// Short operator-facing reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "controller did not respond",
            Self::Rejected { status, .. } => status.describe(),
            Self::Disconnected => "connection lost",
            Self::NotConnected => "controller offline",
            Self::NoSession => "session not open",
            Self::Transport(_) => "radio write failed",
            Self::Busy => "too many commands in flight",
            Self::RateLimited => "commands sent too quickly",
            Self::PayloadTooLarge { .. } => "command too large",
            Self::Session(_) => "session could not be opened",
            Self::EngineStopped => "link engine stopped",
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { sequence } => write!(f, "timed out waiting for ack of #{sequence}"),
            Self::Rejected { status, detail } => {
                write!(f, "rejected: {status:?} (detail 0x{detail:04X})")
            }
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::PayloadTooLarge { len } => write!(f, "payload too large ({len} bytes)"),
            Self::Session(e) => write!(f, "session: {e}"),
            other => f.write_str(other.reason()),
        }
    }
}

impl From<CommandError> for Error {
    fn from(e: CommandError) -> Self {
        Self::Command(e)
    }
}

impl From<SessionError> for CommandError {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

impl From<TransportError> for CommandError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ---------------------------------------------------------------------------
// Session errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// An OPEN_SESSION is already awaiting its acknowledgement.
    AlreadyOpening,
    /// A session is already active.
    AlreadyActive,
    /// An acknowledgement arrived while no open was in progress.
    NotOpening,
    /// The grant in the ack's optional data is malformed.
    MalformedGrant { len: usize },
    /// The peer granted a zero-length lease.
    ZeroLease,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyOpening => write!(f, "session open already in progress"),
            Self::AlreadyActive => write!(f, "session already active"),
            Self::NotOpening => write!(f, "no session open in progress"),
            Self::MalformedGrant { len } => write!(f, "malformed session grant ({len} bytes)"),
            Self::ZeroLease => write!(f, "peer granted a zero lease"),
        }
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

// ---------------------------------------------------------------------------
// Recipe errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeError {
    ZeroCycles,
    ZeroMillDuration,
    DurationOverflow,
}

impl fmt::Display for RecipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroCycles => write!(f, "cycle count must be at least 1"),
            Self::ZeroMillDuration => write!(f, "mill duration must be non-zero"),
            Self::DurationOverflow => write!(f, "duration exceeds protocol range"),
        }
    }
}

impl From<RecipeError> for Error {
    fn from(e: RecipeError) -> Self {
        Self::Recipe(e)
    }
}

// ---------------------------------------------------------------------------
// Link state transition errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: crate::link::state::LinkState,
    pub to: crate::link::state::LinkState,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal transition {:?} -> {:?}", self.from, self.to)
    }
}

impl From<TransitionError> for Error {
    fn from(e: TransitionError) -> Self {
        Self::Transition(e)
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field failed range validation. Names the field and the rule.
    ValidationFailed(&'static str),
    /// JSON or binary config could not be parsed.
    Malformed(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationFailed(msg) => write!(f, "validation failed: {msg}"),
            Self::Malformed(msg) => write!(f, "malformed: {msg}"),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// Failures reported by the transport collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    NotConnected,
    ConnectFailed,
    ServiceNotFound,
    SubscribeFailed,
    WriteFailed,
    TimedOut,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::ConnectFailed => write!(f, "connect failed"),
            Self::ServiceNotFound => write!(f, "controller service not found"),
            Self::SubscribeFailed => write!(f, "notification subscribe failed"),
            Self::WriteFailed => write!(f, "write failed"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
