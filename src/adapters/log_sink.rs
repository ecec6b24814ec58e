//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing one structured line per
//! [`LinkEvent`] to the `log` facade. The host application picks the
//! logger; a UI adapter would implement the same trait.

use log::{error, info, warn};

use crate::link::events::{LinkEvent, RunOutcome};
use crate::link::ports::EventSink;
use crate::protocol::messages::Severity;

/// Adapter that logs every [`LinkEvent`].
#[derive(Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &LinkEvent) {
        match event {
            LinkEvent::StateChanged { from, to } => {
                info!("STATE | {} -> {}", from.name(), to.name());
            }
            LinkEvent::SessionOpened(s) => {
                info!("SESSION | opened id=0x{:08X} lease={}ms", s.id, s.lease_ms);
            }
            LinkEvent::SessionClosed { id } => {
                info!("SESSION | closed id=0x{id:08X}");
            }
            LinkEvent::TelemetryUpdated { .. } => {}
            LinkEvent::Alarm(a) => {
                let edge = if a.asserted { "ASSERT" } else { "clear" };
                match (a.asserted, a.severity) {
                    (true, Severity::Critical) => {
                        error!("ALARM | {edge} {} ({:?}) {:?}", a.name, a.severity, a.source);
                    }
                    (true, _) => warn!("ALARM | {edge} {} ({:?}) {:?}", a.name, a.severity, a.source),
                    (false, _) => info!("ALARM | {edge} {} {:?}", a.name, a.source),
                }
            }
            LinkEvent::RunStarted(r) => {
                info!(
                    "RUN | start cycles={} mill={}ms hold={}ms total={}ms",
                    r.cycles,
                    r.mill_ms,
                    r.hold_ms,
                    r.total_runtime_ms()
                );
            }
            LinkEvent::RunProgress(p) => {
                info!(
                    "RUN | cycle {}/{} {:?} phase_left={}s total_left={}s",
                    p.current_cycle,
                    p.total_cycles,
                    p.phase,
                    p.phase_remaining_ms / 1000,
                    p.total_remaining_ms / 1000
                );
            }
            LinkEvent::RunPaused => info!("RUN | paused"),
            LinkEvent::RunResumed => info!("RUN | resumed"),
            LinkEvent::RunFinished(outcome) => match outcome {
                RunOutcome::Completed { cycles } => info!("RUN | complete, {cycles} cycle(s)"),
                RunOutcome::Stopped => info!("RUN | stopped"),
                RunOutcome::ControllerStopped(state) => {
                    warn!("RUN | controller ended run ({state:?})");
                }
            },
            LinkEvent::Peer(e) => {
                info!(
                    "PEER | event=0x{:04X} severity={:?} source={} data={}B",
                    e.event_id,
                    e.severity,
                    e.source,
                    e.data.len()
                );
            }
            LinkEvent::CommandFailed { cmd_id, error } => {
                warn!("CMD | {cmd_id} failed: {error}");
            }
            LinkEvent::ReconnectScheduled { attempt, delay_ms } => {
                info!("LINK | reconnect attempt {attempt} in {delay_ms}ms");
            }
            LinkEvent::ProtocolIncompatible { version } => {
                error!("LINK | incompatible peer protocol v{version}");
            }
        }
    }
}
