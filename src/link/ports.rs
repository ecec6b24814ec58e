//! Port traits for the link engine.
//!
//! The engine core never touches a radio stack or a wall clock directly.
//! Adapters implement these traits to bridge it to concrete platforms:
//! the loopback peer for tests and demos, a BLE central in the host app.

use crate::error::TransportError;
use crate::link::engine::InboundPort;
use crate::link::events::LinkEvent;

// ───────────────────────────────────────────────────────────────
// Outbound frames
// ───────────────────────────────────────────────────────────────

/// Write side of a connected transport.
///
/// The supervisor only ever needs to hand a fully encoded frame to the
/// radio and occasionally ask for signal strength, so this half is
/// object-safe and synchronous.
pub trait FrameSink {
    /// Queue one encoded frame for transmission.
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Received signal strength, dBm. `None` when unknown.
    fn rssi(&mut self) -> Option<i16> {
        None
    }
}

// ───────────────────────────────────────────────────────────────
// Transport lifecycle
// ───────────────────────────────────────────────────────────────

/// Connect / discover / subscribe sequence of a concrete transport.
///
/// Each step is awaited under the configured step timeout. Once
/// subscribed, the transport pushes inbound notifications and the
/// disconnect signal through the supplied [`InboundPort`].
#[allow(async_fn_in_trait)]
pub trait LinkTransport: FrameSink {
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Locate the service and its characteristics.
    async fn discover(&mut self) -> Result<(), TransportError>;

    /// Enable notifications, delivering them to `inbound`.
    async fn subscribe(&mut self, inbound: InboundPort) -> Result<(), TransportError>;

    /// Drop the connection. Must be safe to call in any state.
    async fn disconnect(&mut self);
}

// ───────────────────────────────────────────────────────────────
// Time
// ───────────────────────────────────────────────────────────────

/// Monotonic millisecond clock.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

// ───────────────────────────────────────────────────────────────
// Event sink
// ───────────────────────────────────────────────────────────────

/// Receives every [`LinkEvent`] the supervisor produces, synchronously
/// and in order. Used for logging and for test capture; subscribers on
/// the handle see the same events through the pub/sub channel.
pub trait EventSink {
    fn emit(&mut self, event: &LinkEvent);
}

/// Captures events in memory.
impl EventSink for Vec<LinkEvent> {
    fn emit(&mut self, event: &LinkEvent) {
        self.push(event.clone());
    }
}

/// Discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: &LinkEvent) {}
}
