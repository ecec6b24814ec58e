//! Published events and the immutable status snapshot.
//!
//! Events describe *transitions*; [`LinkStatus`] describes *state*. A
//! subscriber that misses events can always recover by reading the
//! latest status, which is replaced wholesale after every step of the
//! owner task and never mutated in place.

use std::sync::Arc;

use serde::Serialize;

use crate::diagnostics::LinkCounters;
use crate::error::CommandError;
use crate::link::alarms::AlarmHistoryEntry;
use crate::link::run_progress::{Recipe, RunProgress};
use crate::link::session::{LeaseState, SessionInfo};
use crate::link::state::LinkState;
use crate::protocol::messages::{CommandId, EventPayload};
use crate::protocol::telemetry::{MachineState, TelemetrySnapshot};

/// Below this RSSI the link is graded `Fair` at best.
pub const WEAK_RSSI_DBM: i16 = -70;

// ── Events ───────────────────────────────────────────────────

/// Why a run stopped advancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    /// Every cycle ran to the end of its milling phase.
    Completed { cycles: u16 },
    /// STOP_RUN was acknowledged.
    Stopped,
    /// Controller telemetry reported the run over.
    ControllerStopped(MachineState),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged { from: LinkState, to: LinkState },
    SessionOpened(SessionInfo),
    SessionClosed { id: u32 },
    /// A new authoritative snapshot was folded in. Read it from status.
    TelemetryUpdated { timestamp_ms: u32 },
    Alarm(AlarmHistoryEntry),
    RunStarted(Recipe),
    RunProgress(RunProgress),
    RunPaused,
    RunResumed,
    RunFinished(RunOutcome),
    /// Unsolicited EVENT frame from the controller.
    Peer(EventPayload),
    CommandFailed { cmd_id: CommandId, error: CommandError },
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    ProtocolIncompatible { version: u8 },
}

// ── Quality ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum QualityGrade {
    Good,
    /// Session healthy but the radio is weak.
    Fair,
    /// Lease lapsed or telemetry stale.
    Poor,
    #[default]
    Lost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkQuality {
    pub lease: Option<LeaseState>,
    pub lease_age_ms: Option<u64>,
    pub telemetry_age_ms: Option<u64>,
    pub rssi_dbm: Option<i16>,
    pub grade: QualityGrade,
}

impl LinkQuality {
    pub fn assess(
        session: Option<&SessionInfo>,
        telemetry_fresh: bool,
        telemetry_age_ms: Option<u64>,
        rssi_dbm: Option<i16>,
    ) -> Self {
        let grade = match session {
            None => QualityGrade::Lost,
            Some(s) if s.lease == LeaseState::Degraded || !telemetry_fresh => QualityGrade::Poor,
            Some(_) if rssi_dbm.is_some_and(|r| r < WEAK_RSSI_DBM) => QualityGrade::Fair,
            Some(_) => QualityGrade::Good,
        };
        Self {
            lease: session.map(|s| s.lease),
            lease_age_ms: session.map(|s| s.lease_age_ms),
            telemetry_age_ms,
            rssi_dbm,
            grade,
        }
    }
}

// ── Status snapshot ──────────────────────────────────────────

/// Latest telemetry as displayed: the authoritative snapshot with any
/// optimistic relay/setpoint patches applied on top.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryView {
    pub snapshot: TelemetrySnapshot,
    pub received_at_ms: u64,
    /// `true` when at least one patch is applied.
    pub optimistic: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlarmView {
    pub active: u32,
    pub unacknowledged: u32,
    pub probe_faults: Vec<u8>,
    /// Newest first. Shared with the tracker until the next entry lands.
    pub history: Arc<[AlarmHistoryEntry]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunView {
    pub recipe: Recipe,
    pub progress: Option<RunProgress>,
    pub paused: bool,
    /// Local minus controller-reported remaining time.
    pub drift_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkStatus {
    pub state: LinkState,
    pub session: Option<SessionInfo>,
    pub quality: LinkQuality,
    pub telemetry: Option<TelemetryView>,
    pub alarms: AlarmView,
    pub run: Option<RunView>,
    pub counters: LinkCounters,
    pub pending_commands: usize,
    pub keepalive_enabled: bool,
    /// Retries consumed since the link was last `Live`.
    pub reconnect_attempt: u32,
    pub updated_at_ms: u64,
}
