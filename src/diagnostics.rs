//! Link diagnostics counters.
//!
//! Bad frames on a noisy radio link are dropped, never raised; every drop
//! increments a per-reason counter here so the host can surface link
//! health. Counters are published in every status snapshot.

use serde::Serialize;

use crate::error::{FrameError, TelemetryError};

/// Monotonic counters since the engine started. Never reset on reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkCounters {
    pub frames_rx: u64,
    pub frames_tx: u64,
    pub dropped_too_short: u32,
    pub dropped_truncated: u32,
    pub dropped_checksum: u32,
    pub dropped_unknown_type: u32,
    pub dropped_bad_version: u32,
    pub dropped_malformed_payload: u32,
    pub telemetry_decode_errors: u32,
    pub telemetry_frames: u64,
    pub acks_matched: u32,
    pub late_acks: u32,
    pub command_timeouts: u32,
    pub command_rejections: u32,
    pub keepalives_sent: u32,
    pub peer_events: u32,
    pub reconnect_attempts: u32,
    pub sessions_opened: u32,
}

impl LinkCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a frame that failed to decode.
    pub fn record_frame_error(&mut self, err: FrameError) {
        let slot = match err {
            FrameError::TooShort { .. } => &mut self.dropped_too_short,
            FrameError::Truncated { .. } | FrameError::PayloadTooLarge { .. } => {
                &mut self.dropped_truncated
            }
            FrameError::ChecksumMismatch { .. } => &mut self.dropped_checksum,
            FrameError::UnknownType(_) => &mut self.dropped_unknown_type,
            FrameError::UnsupportedVersion(_) => &mut self.dropped_bad_version,
        };
        *slot = slot.saturating_add(1);
    }

    pub fn record_telemetry_error(&mut self, _err: TelemetryError) {
        self.telemetry_decode_errors = self.telemetry_decode_errors.saturating_add(1);
    }

    /// Total frames discarded at the codec or payload layer.
    pub fn frames_dropped(&self) -> u64 {
        [
            self.dropped_too_short,
            self.dropped_truncated,
            self.dropped_checksum,
            self.dropped_unknown_type,
            self.dropped_bad_version,
            self.dropped_malformed_payload,
            self.telemetry_decode_errors,
        ]
        .iter()
        .map(|&n| n as u64)
        .sum()
    }
}
