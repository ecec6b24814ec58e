//! Synchronous link core.
//!
//! `LinkSupervisor` owns every piece of mutable link state: the state
//! machine, the pending-command table, the session, the alarm tracker,
//! the run tracker and the counters. It never awaits and never reads a
//! clock; the owner task in [`engine`](super::engine) feeds it inbound
//! frames, requests and the current time, and it writes frames through a
//! [`FrameSink`] and reports transitions through an [`EventSink`].
//!
//! Keeping the core synchronous makes every interleaving reproducible in
//! plain unit tests.

use core::mem;

use log::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::diagnostics::LinkCounters;
use crate::error::{CommandError, ConfigError, FrameError};
use crate::link::alarms::{AlarmTracker, ProbeLimits};
use crate::link::commands::{CommandRequest, LinkRequest};
use crate::link::correlator::{Correlator, LocalEffect, PendingCommand, Reply, Waiter};
use crate::link::events::{
    AlarmView, LinkEvent, LinkQuality, LinkStatus, RunOutcome, RunView, TelemetryView,
};
use crate::link::ports::{EventSink, FrameSink};
use crate::link::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::link::run_progress::{Reconciled, RunProgressTracker, RunTick};
use crate::link::session::{SessionInfo, SessionManager};
use crate::link::state::{LinkFsm, LinkState};
use crate::protocol::frame::{self, MessageType};
use crate::protocol::messages::{AckPayload, CommandId, EventPayload, Severity, session_id_data};
use crate::protocol::telemetry::{Fixed10, TelemetrySnapshot};

/// Longest sleep while nothing is scheduled.
const IDLE_WAKE_MS: u64 = 5_000;

/// What the owner task must do after a supervisor step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    /// The automatic OPEN_SESSION of a connect attempt failed.
    SessionFailed,
    /// The peer speaks another protocol version.
    Incompatible { version: u8 },
}

// ── Optimistic patches ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum Patch {
    Relay { mask: u16, state: u16 },
    Setpoint { controller: u8, value: Fixed10 },
}

impl Patch {
    fn from_effect(effect: LocalEffect) -> Option<Self> {
        match effect {
            LocalEffect::Relay { mask, state } => Some(Self::Relay { mask, state }),
            LocalEffect::Setpoint { controller, value } => Some(Self::Setpoint { controller, value }),
            _ => None,
        }
    }

    fn apply(self, snapshot: &mut TelemetrySnapshot) {
        match self {
            Self::Relay { mask, state } => {
                snapshot.relay_outputs = (snapshot.relay_outputs & !mask) | (state & mask);
            }
            Self::Setpoint { controller, value } => {
                if let Some(c) = snapshot.controller_mut(controller) {
                    c.setpoint = value;
                }
            }
        }
    }
}

struct LatestTelemetry {
    snapshot: TelemetrySnapshot,
    received_at_ms: u64,
}

// ── Supervisor ───────────────────────────────────────────────

pub struct LinkSupervisor {
    config: LinkConfig,
    fsm: LinkFsm,
    correlator: Correlator,
    session: SessionManager,
    alarms: AlarmTracker,
    run: RunProgressTracker,
    reconnect: ReconnectPolicy,
    counters: LinkCounters,
    latest: Option<LatestTelemetry>,
    /// Keyed by the sequence of the command that created them.
    patches: Vec<(u16, Patch)>,
    rssi: Option<i16>,
    next_rssi_poll_ms: u64,
    /// The pending OPEN_SESSION belongs to a connect attempt.
    establishing: bool,
}

impl LinkSupervisor {
    pub fn new(config: LinkConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let key = config.session_key_bytes()?;
        Ok(Self {
            fsm: LinkFsm::new(),
            correlator: Correlator::new(config.max_in_flight),
            session: SessionManager::new(
                config.keepalive_interval_ms,
                config.default_lease_ms,
                key,
            ),
            alarms: AlarmTracker::new(ProbeLimits {
                low_c: config.probe_low_limit_c,
                high_c: config.probe_high_limit_c,
                cryogenic_controller: config.cryogenic_controller,
            }),
            run: RunProgressTracker::new(config.run_tick_ms),
            reconnect: ReconnectPolicy::new(
                config.reconnect_max_attempts as u32,
                config.reconnect_delay_ms as u64,
            ),
            counters: LinkCounters::new(),
            latest: None,
            patches: Vec::new(),
            rssi: None,
            next_rssi_poll_ms: 0,
            establishing: false,
            config,
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        self.fsm.current()
    }

    pub fn counters(&self) -> &LinkCounters {
        &self.counters
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn alarms(&self) -> &AlarmTracker {
        &self.alarms
    }

    pub fn run(&self) -> &RunProgressTracker {
        &self.run
    }

    pub fn pending_commands(&self) -> usize {
        self.correlator.pending_len()
    }

    // ── Connection lifecycle ─────────────────────────────────

    /// A user connect: arm retries and enter `Connecting`.
    pub fn begin_connect(&mut self, now_ms: u64, out: &mut dyn EventSink) -> bool {
        self.reconnect.arm();
        self.enter(LinkState::Connecting, now_ms, out)
    }

    /// Re-enter `Connecting` for an automatic retry.
    pub fn retry_connect(&mut self, now_ms: u64, out: &mut dyn EventSink) -> bool {
        self.enter(LinkState::Connecting, now_ms, out)
    }

    /// Move one step along the establish chain.
    pub fn advance(&mut self, to: LinkState, now_ms: u64, out: &mut dyn EventSink) -> bool {
        self.enter(to, now_ms, out)
    }

    /// Subscribed: enter `OpeningSession` and send the automatic
    /// OPEN_SESSION.
    pub fn establish_session(
        &mut self,
        now_ms: u64,
        tx: &mut dyn FrameSink,
        out: &mut dyn EventSink,
    ) -> Control {
        if !self.enter(LinkState::OpeningSession, now_ms, out) {
            return Control::SessionFailed;
        }
        self.open_session(None, true, now_ms, tx, out)
    }

    /// Transport gone. Fails every pending command with `Disconnected`
    /// and drops the session before `Disconnected` is published.
    pub fn on_link_lost(&mut self, now_ms: u64, out: &mut dyn EventSink) {
        self.abandon_link(CommandError::Disconnected, now_ms, out);
    }

    /// Unrecoverable version mismatch: tear down and park in `Error`.
    pub fn on_incompatible(&mut self, version: u8, now_ms: u64, out: &mut dyn EventSink) {
        error!(
            "LINK: peer speaks protocol v{version}, expected v{}",
            frame::PROTOCOL_VERSION
        );
        self.abandon_link(CommandError::Disconnected, now_ms, out);
        self.reconnect.disarm();
        out.emit(&LinkEvent::ProtocolIncompatible { version });
        self.enter(LinkState::Error, now_ms, out);
    }

    /// User disconnect.
    pub fn on_user_disconnect(&mut self, now_ms: u64, out: &mut dyn EventSink) {
        self.reconnect.disarm();
        self.abandon_link(CommandError::Disconnected, now_ms, out);
    }

    /// Engine stopping: everything outstanding resolves `EngineStopped`.
    pub fn on_shutdown(&mut self, now_ms: u64, out: &mut dyn EventSink) {
        self.reconnect.disarm();
        self.abandon_link(CommandError::EngineStopped, now_ms, out);
    }

    /// Consult the reconnect policy after an unexpected loss.
    pub fn after_unexpected_loss(&mut self, out: &mut dyn EventSink) -> ReconnectDecision {
        let decision = self.reconnect.on_unexpected_loss();
        if let ReconnectDecision::RetryAfter { delay_ms, attempt } = decision {
            self.counters.reconnect_attempts = self.counters.reconnect_attempts.saturating_add(1);
            out.emit(&LinkEvent::ReconnectScheduled { attempt, delay_ms });
        }
        decision
    }

    pub fn cancel_reconnect(&mut self) {
        self.reconnect.disarm();
    }

    fn abandon_link(&mut self, err: CommandError, now_ms: u64, out: &mut dyn EventSink) {
        for entry in self.correlator.drain() {
            entry.waiter.fail(err.clone());
        }
        self.patches.clear();
        self.latest = None;
        self.alarms.reset_baseline();
        self.establishing = false;
        self.rssi = None;
        if let Some(id) = self.session.teardown() {
            out.emit(&LinkEvent::SessionClosed { id });
        }
        // An abort during open leaves the manager in Opening.
        self.session.abort_open();
        if self.fsm.current() != LinkState::Disconnected {
            self.enter(LinkState::Disconnected, now_ms, out);
        }
    }

    fn enter(&mut self, to: LinkState, now_ms: u64, out: &mut dyn EventSink) -> bool {
        match self.fsm.transition(to, now_ms) {
            Ok(from) => {
                out.emit(&LinkEvent::StateChanged { from, to });
                true
            }
            Err(e) => {
                warn!("LINK: {e}");
                false
            }
        }
    }

    // ── Requests ─────────────────────────────────────────────

    /// Apply a request from the handle. `Connect`, `Disconnect` and
    /// `Shutdown` belong to the owner task and are ignored here.
    pub fn submit(
        &mut self,
        request: LinkRequest,
        now_ms: u64,
        tx: &mut dyn FrameSink,
        out: &mut dyn EventSink,
    ) -> Control {
        match request {
            LinkRequest::OpenSession(reply) => self.request_open(reply, now_ms, tx, out),
            LinkRequest::CloseSession(reply) => {
                self.request_close(reply, now_ms, tx, out);
                Control::Continue
            }
            LinkRequest::Command(req) => {
                self.request_command(req, now_ms, tx);
                Control::Continue
            }
            LinkRequest::FireAndForget { cmd_id, data } => {
                if self.gate().is_ok() {
                    self.send_untracked(cmd_id, &data, tx);
                } else {
                    debug!("CMD: dropping {cmd_id}, no session");
                }
                Control::Continue
            }
            LinkRequest::SetKeepaliveEnabled(enabled) => {
                info!("SESSION: keepalive {}", if enabled { "enabled" } else { "disabled" });
                self.session.set_keepalive_enabled(enabled, now_ms);
                Control::Continue
            }
            LinkRequest::Connect | LinkRequest::Disconnect | LinkRequest::Shutdown => {
                Control::Continue
            }
        }
    }

    /// Commands need an established session.
    fn gate(&self) -> Result<(), CommandError> {
        match self.fsm.current() {
            LinkState::Live | LinkState::Degraded => Ok(()),
            LinkState::OpeningSession => Err(CommandError::NoSession),
            _ => Err(CommandError::NotConnected),
        }
    }

    fn request_open(
        &mut self,
        reply: Reply<SessionInfo>,
        now_ms: u64,
        tx: &mut dyn FrameSink,
        out: &mut dyn EventSink,
    ) -> Control {
        if let Some(info) = self.session.info(now_ms) {
            reply.signal(Ok(info));
            return Control::Continue;
        }
        if self.fsm.current() != LinkState::OpeningSession {
            reply.signal(Err(CommandError::NotConnected));
            return Control::Continue;
        }
        if self.session.is_opening() {
            reply.signal(Err(CommandError::Busy));
            return Control::Continue;
        }
        self.open_session(Some(reply), false, now_ms, tx, out)
    }

    fn open_session(
        &mut self,
        reply: Option<Reply<SessionInfo>>,
        establishing: bool,
        now_ms: u64,
        tx: &mut dyn FrameSink,
        out: &mut dyn EventSink,
    ) -> Control {
        let data = match self.session.begin_open(now_ms) {
            Ok(data) => data,
            Err(e) => {
                warn!("SESSION: {e}");
                if let Some(reply) = reply {
                    reply.signal(Err(e.into()));
                }
                return if establishing {
                    Control::SessionFailed
                } else {
                    Control::Continue
                };
            }
        };
        self.establishing = establishing;
        let sent = self.send_tracked(
            CommandId::OPEN_SESSION,
            &data,
            self.config.session_open_timeout_ms,
            Waiter::SessionOpen(reply),
            LocalEffect::None,
            now_ms,
            tx,
        );
        match sent {
            Ok(_) => Control::Continue,
            Err(e) => {
                out.emit(&LinkEvent::CommandFailed {
                    cmd_id: CommandId::OPEN_SESSION,
                    error: e,
                });
                self.session.abort_open();
                if mem::take(&mut self.establishing) {
                    Control::SessionFailed
                } else {
                    Control::Continue
                }
            }
        }
    }

    fn request_close(
        &mut self,
        reply: Reply<()>,
        now_ms: u64,
        tx: &mut dyn FrameSink,
        out: &mut dyn EventSink,
    ) {
        if let Err(e) = self.gate() {
            reply.signal(Err(e));
            return;
        }
        let Some(id) = self.session.session().map(|s| s.id) else {
            reply.signal(Err(CommandError::NoSession));
            return;
        };
        // Failure is delivered through the waiter; the session is cleared
        // regardless of how CLOSE_SESSION fares.
        let _ = self.send_tracked(
            CommandId::CLOSE_SESSION,
            &session_id_data(id),
            self.config.command_timeout_ms,
            Waiter::SessionClose(reply),
            LocalEffect::None,
            now_ms,
            tx,
        );
        if let Some(id) = self.session.teardown() {
            out.emit(&LinkEvent::SessionClosed { id });
        }
        self.enter(LinkState::OpeningSession, now_ms, out);
    }

    fn request_command(&mut self, req: CommandRequest, now_ms: u64, tx: &mut dyn FrameSink) {
        let CommandRequest {
            cmd_id,
            data,
            timeout_ms,
            effect,
            reply,
        } = req;
        if let Err(e) = self.gate() {
            reply.signal(Err(e));
            return;
        }
        let timeout = timeout_ms.unwrap_or(self.config.command_timeout_ms);
        let sent = self.send_tracked(
            cmd_id,
            &data,
            timeout,
            Waiter::Caller(reply),
            effect,
            now_ms,
            tx,
        );
        if let (Ok(sequence), Some(patch)) = (sent, Patch::from_effect(effect)) {
            debug!("CMD: optimistic patch for #{sequence}");
            self.patches.push((sequence, patch));
        }
    }

    /// Admit, build, register and write a tracked command. On failure the
    /// waiter has already been answered.
    #[allow(clippy::too_many_arguments)]
    fn send_tracked(
        &mut self,
        cmd_id: CommandId,
        data: &[u8],
        timeout_ms: u32,
        waiter: Waiter,
        effect: LocalEffect,
        now_ms: u64,
        tx: &mut dyn FrameSink,
    ) -> Result<u16, CommandError> {
        let built = self
            .correlator
            .admit(now_ms)
            .and_then(|()| self.correlator.build(cmd_id, data));
        let (sequence, bytes) = match built {
            Ok(built) => built,
            Err(e) => {
                warn!("CMD: {cmd_id} not sent: {e}");
                waiter.fail(e.clone());
                return Err(e);
            }
        };
        let entry = PendingCommand {
            sequence,
            cmd_id,
            sent_at_ms: now_ms,
            deadline_ms: now_ms.saturating_add(timeout_ms as u64),
            waiter,
            effect,
        };
        if let Err(entry) = self.correlator.track(entry) {
            entry.waiter.fail(CommandError::Busy);
            return Err(CommandError::Busy);
        }
        if let Err(e) = tx.write_frame(&bytes) {
            warn!("CMD: {cmd_id} #{sequence} write failed: {e}");
            let err = CommandError::Transport(e);
            if let Some(entry) = self.correlator.cancel(sequence) {
                entry.waiter.fail(err.clone());
            }
            return Err(err);
        }
        self.counters.frames_tx += 1;
        debug!("CMD: {cmd_id} sent as #{sequence}");
        Ok(sequence)
    }

    fn send_untracked(&mut self, cmd_id: CommandId, data: &[u8], tx: &mut dyn FrameSink) -> bool {
        let (sequence, bytes) = match self.correlator.build(cmd_id, data) {
            Ok(built) => built,
            Err(e) => {
                warn!("CMD: {cmd_id} not sent: {e}");
                return false;
            }
        };
        match tx.write_frame(&bytes) {
            Ok(()) => {
                self.counters.frames_tx += 1;
                debug!("CMD: {cmd_id} sent as #{sequence} (no reply)");
                true
            }
            Err(e) => {
                warn!("CMD: {cmd_id} #{sequence} write failed: {e}");
                false
            }
        }
    }

    // ── Inbound ──────────────────────────────────────────────

    /// Decode and dispatch one inbound notification. Bad frames are
    /// counted and dropped; only a version mismatch is escalated.
    pub fn handle_frame(
        &mut self,
        bytes: &[u8],
        now_ms: u64,
        tx: &mut dyn FrameSink,
        out: &mut dyn EventSink,
    ) -> Control {
        self.counters.frames_rx += 1;
        let frame = match frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.record_frame_error(e);
                if let FrameError::UnsupportedVersion(version) = e {
                    return Control::Incompatible { version };
                }
                debug!("RX: dropped frame ({} bytes): {e}", bytes.len());
                return Control::Continue;
            }
        };
        match frame.msg_type() {
            MessageType::Telemetry => {
                self.on_telemetry(frame.payload(), now_ms, out);
                Control::Continue
            }
            MessageType::CommandAck => self.on_ack(frame.payload(), now_ms, tx, out),
            MessageType::Event => {
                self.on_event(frame.payload(), out);
                Control::Continue
            }
            MessageType::Command => {
                debug!("RX: ignoring COMMAND #{} from peer", frame.sequence());
                self.counters.dropped_malformed_payload += 1;
                Control::Continue
            }
        }
    }

    fn on_telemetry(&mut self, payload: &[u8], now_ms: u64, out: &mut dyn EventSink) {
        let snapshot = match TelemetrySnapshot::decode(payload) {
            Ok(s) => s,
            Err(e) => {
                warn!("RX: telemetry dropped: {e}");
                self.counters.record_telemetry_error(e);
                return;
            }
        };
        self.counters.telemetry_frames += 1;
        // The controller's word replaces every optimistic patch.
        self.patches.clear();

        for entry in self.alarms.observe(&snapshot, now_ms) {
            out.emit(&LinkEvent::Alarm(entry));
        }
        if let Some(run_state) = &snapshot.run_state {
            match self.run.reconcile(run_state, now_ms) {
                Reconciled::Unchanged => {}
                Reconciled::Stopped(state) => {
                    out.emit(&LinkEvent::RunFinished(RunOutcome::ControllerStopped(state)));
                }
                Reconciled::Paused => out.emit(&LinkEvent::RunPaused),
                Reconciled::Resumed => out.emit(&LinkEvent::RunResumed),
            }
        }
        let timestamp_ms = snapshot.timestamp_ms;
        self.latest = Some(LatestTelemetry {
            snapshot,
            received_at_ms: now_ms,
        });
        out.emit(&LinkEvent::TelemetryUpdated { timestamp_ms });
        self.evaluate_health(now_ms, out);
    }

    fn on_ack(
        &mut self,
        payload: &[u8],
        now_ms: u64,
        tx: &mut dyn FrameSink,
        out: &mut dyn EventSink,
    ) -> Control {
        let ack = match AckPayload::decode(payload) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("RX: ack dropped: {e}");
                self.counters.dropped_malformed_payload += 1;
                return Control::Continue;
            }
        };
        let Some(entry) = self.correlator.resolve(&ack) else {
            debug!("RX: late ack for #{}", ack.acked_sequence);
            self.counters.late_acks += 1;
            return Control::Continue;
        };
        self.counters.acks_matched += 1;
        debug!(
            "CMD: {} #{} acked {} after {} ms",
            entry.cmd_id,
            entry.sequence,
            ack.status.describe(),
            now_ms.saturating_sub(entry.sent_at_ms)
        );
        if !ack.status.is_ok() {
            self.counters.command_rejections += 1;
            warn!(
                "CMD: {} #{} rejected: {} (detail {})",
                entry.cmd_id,
                entry.sequence,
                ack.status.describe(),
                ack.detail
            );
            let err = CommandError::Rejected {
                status: ack.status,
                detail: ack.detail,
            };
            return self.fail_pending(entry, err, out);
        }
        self.complete(entry, ack, now_ms, tx, out)
    }

    fn complete(
        &mut self,
        entry: PendingCommand,
        ack: AckPayload,
        now_ms: u64,
        tx: &mut dyn FrameSink,
        out: &mut dyn EventSink,
    ) -> Control {
        match entry.waiter {
            Waiter::Caller(reply) => {
                self.apply_effect(entry.effect, now_ms, out);
                reply.signal(Ok(ack));
                Control::Continue
            }
            Waiter::SessionClose(reply) => {
                reply.signal(Ok(()));
                Control::Continue
            }
            Waiter::SessionOpen(reply) => {
                let establishing = mem::take(&mut self.establishing);
                match self.session.activate(&ack.data, now_ms) {
                    Ok(info) => {
                        self.counters.sessions_opened += 1;
                        self.reconnect.on_established();
                        self.next_rssi_poll_ms = now_ms;
                        self.enter(LinkState::Live, now_ms, out);
                        out.emit(&LinkEvent::SessionOpened(info));
                        if let Some(reply) = reply {
                            reply.signal(Ok(info));
                        }
                        // Sample signal strength straight away.
                        self.poll_rssi(now_ms, tx);
                        Control::Continue
                    }
                    Err(e) => {
                        warn!("SESSION: grant refused: {e}");
                        if let Some(reply) = reply {
                            reply.signal(Err(e.into()));
                        }
                        if establishing {
                            Control::SessionFailed
                        } else {
                            Control::Continue
                        }
                    }
                }
            }
        }
    }

    /// Resolve a pending command with a failure (rejected or timed out).
    fn fail_pending(
        &mut self,
        entry: PendingCommand,
        err: CommandError,
        out: &mut dyn EventSink,
    ) -> Control {
        self.drop_patch(entry.sequence);
        out.emit(&LinkEvent::CommandFailed {
            cmd_id: entry.cmd_id,
            error: err.clone(),
        });
        match entry.waiter {
            Waiter::SessionOpen(reply) => {
                self.session.abort_open();
                if let Some(reply) = reply {
                    reply.signal(Err(err));
                }
                if mem::take(&mut self.establishing) {
                    return Control::SessionFailed;
                }
                Control::Continue
            }
            waiter => {
                waiter.fail(err);
                Control::Continue
            }
        }
    }

    fn apply_effect(&mut self, effect: LocalEffect, now_ms: u64, out: &mut dyn EventSink) {
        match effect {
            LocalEffect::StartRun(recipe) => {
                self.run.start(recipe, now_ms);
                out.emit(&LinkEvent::RunStarted(recipe));
            }
            LocalEffect::PauseRun => {
                if self.run.pause(now_ms) {
                    out.emit(&LinkEvent::RunPaused);
                }
            }
            LocalEffect::ResumeRun => {
                if self.run.resume(now_ms) {
                    out.emit(&LinkEvent::RunResumed);
                }
            }
            LocalEffect::StopRun => {
                if self.run.stop() {
                    out.emit(&LinkEvent::RunFinished(RunOutcome::Stopped));
                }
            }
            LocalEffect::AcknowledgeAlarms(mask) => {
                self.alarms.acknowledge(mask);
            }
            // Patches stay until the next snapshot replaces them.
            LocalEffect::Relay { .. } | LocalEffect::Setpoint { .. } | LocalEffect::None => {}
        }
    }

    fn drop_patch(&mut self, sequence: u16) {
        self.patches.retain(|(seq, _)| *seq != sequence);
    }

    fn on_event(&mut self, payload: &[u8], out: &mut dyn EventSink) {
        let event = match EventPayload::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("RX: event dropped: {e}");
                self.counters.dropped_malformed_payload += 1;
                return;
            }
        };
        self.counters.peer_events += 1;
        match event.severity {
            Severity::Critical => error!(
                "PEER: critical event 0x{:04X} from {}",
                event.event_id, event.source
            ),
            Severity::Alarm => warn!("PEER: alarm event 0x{:04X} from {}", event.event_id, event.source),
            Severity::Info | Severity::Warn => {
                info!("PEER: event 0x{:04X} from {}", event.event_id, event.source);
            }
        }
        out.emit(&LinkEvent::Peer(event));
    }

    // ── Periodic work ────────────────────────────────────────

    /// Expire deadlines, heartbeat, sample RSSI, tick the run timer and
    /// re-grade the link. Safe to call at any time, in any state.
    pub fn poll(&mut self, now_ms: u64, tx: &mut dyn FrameSink, out: &mut dyn EventSink) -> Control {
        let mut control = Control::Continue;
        for entry in self.correlator.expire(now_ms) {
            self.counters.command_timeouts += 1;
            warn!("CMD: {} #{} timed out", entry.cmd_id, entry.sequence);
            let err = CommandError::Timeout {
                sequence: entry.sequence,
            };
            if self.fail_pending(entry, err, out) == Control::SessionFailed {
                control = Control::SessionFailed;
            }
        }

        if self.fsm.current().has_session() {
            if let Some(id) = self.session.keepalive_due(now_ms) {
                self.send_keepalive(id, now_ms, tx);
            }
            if now_ms >= self.next_rssi_poll_ms {
                self.poll_rssi(now_ms, tx);
            }
        }

        if self.run.tick_due(now_ms) {
            match self.run.tick(now_ms) {
                RunTick::Idle => {}
                RunTick::Progress(p) => out.emit(&LinkEvent::RunProgress(p)),
                RunTick::Completed { cycles } => {
                    out.emit(&LinkEvent::RunFinished(RunOutcome::Completed { cycles }));
                }
            }
        }

        self.evaluate_health(now_ms, out);
        control
    }

    fn send_keepalive(&mut self, id: u32, now_ms: u64, tx: &mut dyn FrameSink) {
        if self.send_untracked(CommandId::KEEPALIVE, &session_id_data(id), tx) {
            self.counters.keepalives_sent += 1;
            self.session.record_keepalive_sent(now_ms);
        } else {
            self.session.defer_keepalive(now_ms);
        }
    }

    fn poll_rssi(&mut self, now_ms: u64, tx: &mut dyn FrameSink) {
        self.rssi = tx.rssi();
        self.next_rssi_poll_ms = now_ms.saturating_add(self.config.signal_poll_interval_ms as u64);
    }

    /// Instant from which telemetry freshness is measured: the later of
    /// the last snapshot and the session open.
    fn telemetry_baseline(&self) -> Option<u64> {
        let opened = self.session.session()?.opened_at_ms;
        Some(
            self.latest
                .as_ref()
                .map_or(opened, |t| t.received_at_ms.max(opened)),
        )
    }

    fn telemetry_fresh(&self, now_ms: u64) -> bool {
        self.telemetry_baseline()
            .is_some_and(|b| now_ms.saturating_sub(b) < self.config.telemetry_stale_ms as u64)
    }

    fn is_healthy(&self, now_ms: u64) -> bool {
        self.session
            .session()
            .is_some_and(|s| s.is_lease_valid(now_ms))
            && self.telemetry_fresh(now_ms)
    }

    fn evaluate_health(&mut self, now_ms: u64, out: &mut dyn EventSink) {
        match self.fsm.current() {
            LinkState::Live if !self.is_healthy(now_ms) => {
                warn!("LINK: lease lapsed or telemetry stale");
                self.enter(LinkState::Degraded, now_ms, out);
            }
            LinkState::Degraded if self.is_healthy(now_ms) => {
                info!("LINK: recovered");
                self.enter(LinkState::Live, now_ms, out);
            }
            _ => {}
        }
    }

    /// Next instant the owner task must call [`poll`](Self::poll).
    pub fn next_wake(&self, now_ms: u64) -> u64 {
        let state = self.fsm.current();
        let mut wake = now_ms.saturating_add(IDLE_WAKE_MS);
        let mut consider = |at: Option<u64>| {
            if let Some(at) = at {
                wake = wake.min(at);
            }
        };
        consider(self.correlator.next_deadline());
        consider(self.run.next_tick_at());
        if state.has_session() {
            consider(self.session.next_keepalive_at());
            consider(Some(self.next_rssi_poll_ms));
        }
        if state == LinkState::Live {
            consider(self.session.session().map(|s| s.lease_expires_at_ms()));
            consider(
                self.telemetry_baseline()
                    .map(|b| b.saturating_add(self.config.telemetry_stale_ms as u64)),
            );
        }
        wake.max(now_ms)
    }

    // ── Status ───────────────────────────────────────────────

    fn telemetry_view(&self) -> Option<TelemetryView> {
        let latest = self.latest.as_ref()?;
        let mut snapshot = latest.snapshot.clone();
        for (_, patch) in &self.patches {
            patch.apply(&mut snapshot);
        }
        Some(TelemetryView {
            snapshot,
            received_at_ms: latest.received_at_ms,
            optimistic: !self.patches.is_empty(),
        })
    }

    /// Build a fresh immutable snapshot of everything observable.
    pub fn status(&self, now_ms: u64) -> LinkStatus {
        let session = self.session.info(now_ms);
        let telemetry_age_ms = self
            .latest
            .as_ref()
            .map(|t| now_ms.saturating_sub(t.received_at_ms));
        let quality = LinkQuality::assess(
            session.as_ref(),
            self.telemetry_fresh(now_ms),
            telemetry_age_ms,
            self.rssi,
        );
        let run = self.run.recipe().map(|recipe| RunView {
            recipe: *recipe,
            progress: self.run.progress(),
            paused: self.run.is_paused(),
            drift_ms: self.run.drift_ms(),
        });
        LinkStatus {
            state: self.fsm.current(),
            session,
            quality,
            telemetry: self.telemetry_view(),
            alarms: AlarmView {
                active: self.alarms.active(),
                unacknowledged: self.alarms.unacknowledged(),
                probe_faults: self.alarms.probe_faults().collect(),
                history: self.alarms.shared_history(),
            },
            run,
            counters: self.counters.clone(),
            pending_commands: self.correlator.pending_len(),
            keepalive_enabled: self.session.keepalive_enabled(),
            reconnect_attempt: self.reconnect.attempts(),
            updated_at_ms: now_ms,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
