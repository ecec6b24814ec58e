//! Async owner task and the handle the presentation layer holds.
//!
//! One task owns the [`LinkSupervisor`] and serialises every mutation.
//! Everything else talks to it through queues:
//!
//! ```text
//!  ┌───────────────┐  LinkRequest   ┌──────────────────────────┐
//!  │  LinkHandle   │──────────────▶│                          │
//!  │  (any thread) │◀──────────────│   LinkEngine::run()      │
//!  └───────────────┘  Reply signal  │                          │
//!          ▲                        │   idle ─► connect steps  │
//!          │ LinkEvent (pub/sub)    │        ─► serve loop     │
//!          │ Arc<LinkStatus>        │        ─► retry / idle   │
//!          └────────────────────────│                          │
//!  ┌───────────────┐  frames / lost │                          │
//!  │ InboundPort   │──────────────▶│                          │
//!  │ (transport)   │                └──────────────────────────┘
//!  └───────────────┘
//! ```
//!
//! The serve loop races inbound frames, requests, the transport-lost
//! signal and a timer armed for the supervisor's next deadline.

use core::cell::RefCell;
use core::future::Future;
use core::pin::pin;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::sync::Arc;

use async_io_mini::Timer;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::pubsub::{PubSubChannel, Subscriber};
use embassy_sync::signal::Signal;
use futures_lite::future::or;
use log::{info, warn};

use crate::config::LinkConfig;
use crate::error::{CommandError, ConfigError, TransportError};
use crate::link::commands::{CommandRequest, LinkRequest};
use crate::link::correlator::{LocalEffect, reply_slot};
use crate::link::events::{LinkEvent, LinkStatus};
use crate::link::ports::{Clock, EventSink, FrameSink, LinkTransport};
use crate::link::reconnect::ReconnectDecision;
use crate::link::run_progress::Recipe;
use crate::link::session::SessionInfo;
use crate::link::state::LinkState;
use crate::link::supervisor::{Control, LinkSupervisor};
use crate::protocol::frame::MAX_FRAME_LEN;
use crate::protocol::messages::{
    AckPayload, CommandData, CommandId, alarm_mask_data, lazy_poll_data, relay_data,
    setpoint_data,
};
use crate::protocol::telemetry::Fixed10;

/// Handle → engine request queue depth.
pub const REQUEST_QUEUE_DEPTH: usize = 8;
/// Transport → engine notification queue depth.
pub const INBOUND_QUEUE_DEPTH: usize = 16;
/// Per-subscriber event backlog before the oldest is overwritten.
pub const EVENT_QUEUE_DEPTH: usize = 32;
pub const MAX_SUBSCRIBERS: usize = 4;

type Raw = CriticalSectionRawMutex;

/// One inbound notification. Anything past a maximal frame is cut off;
/// the decoder ignores trailing bytes anyway.
pub type InboundFrame = heapless::Vec<u8, MAX_FRAME_LEN>;

type EventBus = PubSubChannel<Raw, LinkEvent, EVENT_QUEUE_DEPTH, MAX_SUBSCRIBERS, 0>;

pub type EventSubscriber<'a> =
    Subscriber<'a, Raw, LinkEvent, EVENT_QUEUE_DEPTH, MAX_SUBSCRIBERS, 0>;

struct Shared {
    requests: Channel<Raw, LinkRequest, REQUEST_QUEUE_DEPTH>,
    inbound: Channel<Raw, InboundFrame, INBOUND_QUEUE_DEPTH>,
    lost: Signal<Raw, ()>,
    events: EventBus,
    status: Mutex<Raw, RefCell<Arc<LinkStatus>>>,
    stopped: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            requests: Channel::new(),
            inbound: Channel::new(),
            lost: Signal::new(),
            events: PubSubChannel::new(),
            status: Mutex::new(RefCell::new(Arc::new(LinkStatus::default()))),
            stopped: AtomicBool::new(false),
        }
    }

    fn publish_status(&self, status: LinkStatus) {
        self.status.lock(|s| *s.borrow_mut() = Arc::new(status));
    }
}

// ═══════════════════════════════════════════════════════════════
//  Inbound port (transport side)
// ═══════════════════════════════════════════════════════════════

/// Given to the transport on subscribe. Never blocks, so it is safe to
/// call from a radio stack callback.
#[derive(Clone)]
pub struct InboundPort {
    shared: Arc<Shared>,
}

impl InboundPort {
    /// Queue one notification. Returns `false` if the queue was full and
    /// the notification was dropped.
    pub fn feed(&self, bytes: &[u8]) -> bool {
        let len = bytes.len().min(MAX_FRAME_LEN);
        let Ok(frame) = InboundFrame::from_slice(&bytes[..len]) else {
            return false;
        };
        if self.shared.inbound.try_send(frame).is_err() {
            warn!("RX: inbound queue full, dropping {} bytes", bytes.len());
            return false;
        }
        true
    }

    /// The transport went away underneath us.
    pub fn notify_disconnected(&self) {
        self.shared.lost.signal(());
    }
}

// ═══════════════════════════════════════════════════════════════
//  Handle (presentation side)
// ═══════════════════════════════════════════════════════════════

/// Cheap, cloneable, `Send + Sync` front end to the engine.
#[derive(Clone)]
pub struct LinkHandle {
    shared: Arc<Shared>,
}

impl LinkHandle {
    async fn enqueue(&self, request: LinkRequest) -> Result<(), CommandError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            request.fail(CommandError::EngineStopped);
            return Err(CommandError::EngineStopped);
        }
        self.shared.requests.send(request).await;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::Acquire)
    }

    /// Latest published status. Never blocks on the engine.
    pub fn status(&self) -> Arc<LinkStatus> {
        self.shared.status.lock(|s| s.borrow().clone())
    }

    /// `None` once [`MAX_SUBSCRIBERS`] are attached.
    pub fn subscribe(&self) -> Option<EventSubscriber<'_>> {
        self.shared.events.subscriber().ok()
    }

    // ── Link control ─────────────────────────────────────────

    pub async fn connect(&self) -> Result<(), CommandError> {
        self.enqueue(LinkRequest::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), CommandError> {
        self.enqueue(LinkRequest::Disconnect).await
    }

    pub async fn open_session(&self) -> Result<SessionInfo, CommandError> {
        let reply = reply_slot();
        self.enqueue(LinkRequest::OpenSession(reply.clone())).await?;
        reply.wait().await
    }

    pub async fn close_session(&self) -> Result<(), CommandError> {
        let reply = reply_slot();
        self.enqueue(LinkRequest::CloseSession(reply.clone())).await?;
        reply.wait().await
    }

    pub async fn set_keepalive_enabled(&self, enabled: bool) -> Result<(), CommandError> {
        self.enqueue(LinkRequest::SetKeepaliveEnabled(enabled)).await
    }

    /// Stop the engine. Outstanding commands resolve `EngineStopped`.
    pub async fn shutdown(&self) {
        let _ = self.enqueue(LinkRequest::Shutdown).await;
    }

    // ── Commands ─────────────────────────────────────────────

    async fn tracked(
        &self,
        cmd_id: CommandId,
        data: &[u8],
        timeout_ms: Option<u32>,
        effect: LocalEffect,
    ) -> Result<AckPayload, CommandError> {
        let data = CommandData::from_slice(data)
            .map_err(|_| CommandError::PayloadTooLarge { len: data.len() })?;
        let reply = reply_slot();
        self.enqueue(LinkRequest::Command(CommandRequest {
            cmd_id,
            data,
            timeout_ms,
            effect,
            reply: reply.clone(),
        }))
        .await?;
        reply.wait().await
    }

    /// Send any command and await its ack.
    pub async fn send_command(&self, cmd_id: CommandId, data: &[u8]) -> Result<AckPayload, CommandError> {
        self.tracked(cmd_id, data, None, LocalEffect::None).await
    }

    pub async fn send_command_with_timeout(
        &self,
        cmd_id: CommandId,
        data: &[u8],
        timeout: Duration,
    ) -> Result<AckPayload, CommandError> {
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX).max(1);
        self.tracked(cmd_id, data, Some(timeout_ms), LocalEffect::None).await
    }

    /// Queue a command without waiting for, or tracking, an ack. Fails
    /// with `Busy` rather than waiting when the request queue is full.
    pub fn send_command_no_reply(&self, cmd_id: CommandId, data: &[u8]) -> Result<(), CommandError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(CommandError::EngineStopped);
        }
        match self.status().state {
            LinkState::Live | LinkState::Degraded => {}
            LinkState::OpeningSession => return Err(CommandError::NoSession),
            _ => return Err(CommandError::NotConnected),
        }
        let data = CommandData::from_slice(data)
            .map_err(|_| CommandError::PayloadTooLarge { len: data.len() })?;
        self.shared
            .requests
            .try_send(LinkRequest::FireAndForget { cmd_id, data })
            .map_err(|_| CommandError::Busy)
    }

    pub async fn start_run(&self, recipe: Recipe) -> Result<AckPayload, CommandError> {
        self.tracked(
            CommandId::START_RUN,
            &recipe.to_command_data(),
            None,
            LocalEffect::StartRun(recipe),
        )
        .await
    }

    pub async fn pause_run(&self) -> Result<AckPayload, CommandError> {
        self.tracked(CommandId::PAUSE_RUN, &[], None, LocalEffect::PauseRun).await
    }

    pub async fn resume_run(&self) -> Result<AckPayload, CommandError> {
        self.tracked(CommandId::RESUME_RUN, &[], None, LocalEffect::ResumeRun).await
    }

    pub async fn stop_run(&self) -> Result<AckPayload, CommandError> {
        self.tracked(CommandId::STOP_RUN, &[], None, LocalEffect::StopRun).await
    }

    pub async fn acknowledge_alarms(&self, mask: u32) -> Result<AckPayload, CommandError> {
        self.tracked(
            CommandId::ACK_ALARMS,
            &alarm_mask_data(mask),
            None,
            LocalEffect::AcknowledgeAlarms(mask),
        )
        .await
    }

    /// Drive the relays in `mask` on or off. Shown optimistically until
    /// the next telemetry snapshot.
    pub async fn set_relay(&self, mask: u16, on: bool) -> Result<AckPayload, CommandError> {
        let state = if on { mask } else { 0 };
        self.tracked(
            CommandId::SET_RELAY,
            &relay_data(mask, state),
            None,
            LocalEffect::Relay { mask, state },
        )
        .await
    }

    pub async fn set_setpoint(&self, controller: u8, value: Fixed10) -> Result<AckPayload, CommandError> {
        self.tracked(
            CommandId::SET_SETPOINT,
            &setpoint_data(controller, value),
            None,
            LocalEffect::Setpoint { controller, value },
        )
        .await
    }

    pub async fn set_lazy_poll(&self, enabled: bool) -> Result<AckPayload, CommandError> {
        self.tracked(CommandId::SET_LAZY_POLL, &lazy_poll_data(enabled), None, LocalEffect::None)
            .await
    }
}

// ═══════════════════════════════════════════════════════════════
//  Engine (owner task)
// ═══════════════════════════════════════════════════════════════

/// Fans every supervisor event out to the local sink and the pub/sub bus.
struct Broadcast<'a, S> {
    sink: &'a mut S,
    bus: &'a EventBus,
}

impl<S: EventSink> EventSink for Broadcast<'_, S> {
    fn emit(&mut self, event: &LinkEvent) {
        self.sink.emit(event);
        self.bus.immediate_publisher().publish_immediate(event.clone());
    }
}

/// Stand-in while the transport is mid-step and cannot be written.
struct Unwritable;

impl FrameSink for Unwritable {
    fn write_frame(&mut self, _frame: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }
}

enum Wake {
    Frame(InboundFrame),
    Request(LinkRequest),
    Lost,
    Timer,
}

enum StepOutcome {
    Done,
    Failed(TransportError),
    Disconnect,
    Shutdown,
}

/// How a connected lifetime ended.
enum Exit {
    Lost,
    UserDisconnect,
    Incompatible(u8),
    Shutdown,
}

enum RetryWait {
    Retry,
    UserConnect,
    Cancelled,
    Shutdown,
}

pub struct LinkEngine<T, C, S> {
    transport: T,
    clock: C,
    sink: S,
    supervisor: LinkSupervisor,
    shared: Arc<Shared>,
}

impl<T: LinkTransport, C: Clock, S: EventSink> LinkEngine<T, C, S> {
    pub fn new(
        config: LinkConfig,
        transport: T,
        clock: C,
        sink: S,
    ) -> Result<(Self, LinkHandle), ConfigError> {
        let supervisor = LinkSupervisor::new(config)?;
        let shared = Arc::new(Shared::new());
        let handle = LinkHandle {
            shared: shared.clone(),
        };
        Ok((
            Self {
                transport,
                clock,
                sink,
                supervisor,
                shared,
            },
            handle,
        ))
    }

    /// Run until a handle asks for shutdown.
    pub async fn run(mut self) {
        info!("ENGINE: started");
        self.publish();
        loop {
            if !self.idle().await {
                break;
            }
            if !self.connected_lifetime().await {
                break;
            }
        }
        self.finish().await;
    }

    /// Drive [`run`](Self::run) on the current thread.
    pub fn run_blocking(self) {
        let executor: edge_executor::LocalExecutor<'_, 4> = edge_executor::LocalExecutor::new();
        futures_lite::future::block_on(executor.run(self.run()));
    }

    fn publish(&self) {
        let now = self.clock.now_ms();
        self.shared.publish_status(self.supervisor.status(now));
    }

    /// Disconnected or in `Error`: wait for a connect. Returns `false`
    /// on shutdown.
    async fn idle(&mut self) -> bool {
        loop {
            self.publish();
            let now = self.clock.now_ms();
            let wake = self.supervisor.next_wake(now);
            let shared = &self.shared;
            let woke = or(
                async { Wake::Request(shared.requests.receive().await) },
                async {
                    Timer::after(Duration::from_millis(wake - now)).await;
                    Wake::Timer
                },
            )
            .await;
            let now = self.clock.now_ms();
            let mut out = Broadcast {
                sink: &mut self.sink,
                bus: &self.shared.events,
            };
            match woke {
                Wake::Request(LinkRequest::Connect) => {
                    if self.supervisor.begin_connect(now, &mut out) {
                        return true;
                    }
                }
                Wake::Request(LinkRequest::Shutdown) => return false,
                Wake::Request(LinkRequest::Disconnect) => self.supervisor.cancel_reconnect(),
                Wake::Request(request) => {
                    self.supervisor.submit(request, now, &mut Unwritable, &mut out);
                }
                Wake::Frame(_) | Wake::Lost | Wake::Timer => {}
            }
            self.supervisor.poll(now, &mut Unwritable, &mut out);
        }
    }

    /// From `Connecting` until the link is given up. Returns `false` on
    /// shutdown.
    async fn connected_lifetime(&mut self) -> bool {
        loop {
            let exit = self.connect_and_serve().await;
            self.transport.disconnect().await;
            let now = self.clock.now_ms();
            let mut out = Broadcast {
                sink: &mut self.sink,
                bus: &self.shared.events,
            };
            match exit {
                Exit::Shutdown => return false,
                Exit::UserDisconnect => {
                    self.supervisor.on_user_disconnect(now, &mut out);
                    return true;
                }
                Exit::Incompatible(version) => {
                    self.supervisor.on_incompatible(version, now, &mut out);
                    return true;
                }
                Exit::Lost => {
                    self.supervisor.on_link_lost(now, &mut out);
                    let ReconnectDecision::RetryAfter { delay_ms, .. } =
                        self.supervisor.after_unexpected_loss(&mut out)
                    else {
                        return true;
                    };
                    self.publish();
                    let wait = self.wait_retry(delay_ms).await;
                    let now = self.clock.now_ms();
                    let mut out = Broadcast {
                        sink: &mut self.sink,
                        bus: &self.shared.events,
                    };
                    match wait {
                        RetryWait::Retry => {
                            if !self.supervisor.retry_connect(now, &mut out) {
                                return true;
                            }
                        }
                        RetryWait::UserConnect => {
                            if !self.supervisor.begin_connect(now, &mut out) {
                                return true;
                            }
                        }
                        RetryWait::Cancelled => return true,
                        RetryWait::Shutdown => return false,
                    }
                }
            }
        }
    }

    /// Sit out the reconnect delay while still answering requests.
    async fn wait_retry(&mut self, delay_ms: u64) -> RetryWait {
        let deadline = self.clock.now_ms().saturating_add(delay_ms);
        loop {
            let now = self.clock.now_ms();
            if now >= deadline {
                return RetryWait::Retry;
            }
            let shared = &self.shared;
            let woke = or(
                async { Wake::Request(shared.requests.receive().await) },
                async {
                    Timer::after(Duration::from_millis(deadline - now)).await;
                    Wake::Timer
                },
            )
            .await;
            let now = self.clock.now_ms();
            let mut out = Broadcast {
                sink: &mut self.sink,
                bus: &self.shared.events,
            };
            match woke {
                Wake::Request(LinkRequest::Connect) => return RetryWait::UserConnect,
                Wake::Request(LinkRequest::Disconnect) => {
                    info!("RECONNECT: cancelled by user");
                    self.supervisor.cancel_reconnect();
                    return RetryWait::Cancelled;
                }
                Wake::Request(LinkRequest::Shutdown) => return RetryWait::Shutdown,
                Wake::Request(request) => {
                    self.supervisor.submit(request, now, &mut Unwritable, &mut out);
                }
                Wake::Frame(_) | Wake::Lost | Wake::Timer => {}
            }
            self.publish();
        }
    }

    /// Run the connect / discover / subscribe steps, open the session and
    /// serve until something ends the connection.
    async fn connect_and_serve(&mut self) -> Exit {
        self.shared.lost.reset();
        while self.shared.inbound.try_receive().is_ok() {}
        self.publish();

        let step_ms = self.supervisor.config().step_timeout_ms as u64;

        let outcome = run_step(
            self.transport.connect(),
            step_ms,
            &self.shared,
            &mut self.supervisor,
            &self.clock,
            &mut self.sink,
        )
        .await;
        if let Some(exit) = self.step_exit(outcome, "connect", Some(LinkState::Discovering)) {
            return exit;
        }

        let outcome = run_step(
            self.transport.discover(),
            step_ms,
            &self.shared,
            &mut self.supervisor,
            &self.clock,
            &mut self.sink,
        )
        .await;
        if let Some(exit) = self.step_exit(outcome, "discover", Some(LinkState::Subscribing)) {
            return exit;
        }

        let port = InboundPort {
            shared: self.shared.clone(),
        };
        let outcome = run_step(
            self.transport.subscribe(port),
            step_ms,
            &self.shared,
            &mut self.supervisor,
            &self.clock,
            &mut self.sink,
        )
        .await;
        if let Some(exit) = self.step_exit(outcome, "subscribe", None) {
            return exit;
        }

        let now = self.clock.now_ms();
        let mut out = Broadcast {
            sink: &mut self.sink,
            bus: &self.shared.events,
        };
        if self.supervisor.establish_session(now, &mut self.transport, &mut out) != Control::Continue {
            return Exit::Lost;
        }
        self.serve().await
    }

    /// Map a step outcome; on success advance to `next`, if given.
    fn step_exit(&mut self, outcome: StepOutcome, step: &str, next: Option<LinkState>) -> Option<Exit> {
        match outcome {
            StepOutcome::Done => {
                let next = next?;
                let now = self.clock.now_ms();
                let mut out = Broadcast {
                    sink: &mut self.sink,
                    bus: &self.shared.events,
                };
                if self.supervisor.advance(next, now, &mut out) {
                    None
                } else {
                    Some(Exit::Lost)
                }
            }
            StepOutcome::Failed(e) => {
                warn!("LINK: {step} failed: {e}");
                Some(Exit::Lost)
            }
            StepOutcome::Disconnect => Some(Exit::UserDisconnect),
            StepOutcome::Shutdown => Some(Exit::Shutdown),
        }
    }

    async fn serve(&mut self) -> Exit {
        loop {
            self.publish();
            let now = self.clock.now_ms();
            let wake = self.supervisor.next_wake(now);
            let shared = &self.shared;
            let woke = or(
                or(
                    async { Wake::Frame(shared.inbound.receive().await) },
                    async { Wake::Request(shared.requests.receive().await) },
                ),
                or(
                    async {
                        shared.lost.wait().await;
                        Wake::Lost
                    },
                    async {
                        Timer::after(Duration::from_millis(wake - now)).await;
                        Wake::Timer
                    },
                ),
            )
            .await;

            let now = self.clock.now_ms();
            let mut out = Broadcast {
                sink: &mut self.sink,
                bus: &self.shared.events,
            };
            let control = match woke {
                Wake::Frame(bytes) => {
                    self.supervisor
                        .handle_frame(&bytes, now, &mut self.transport, &mut out)
                }
                Wake::Request(LinkRequest::Disconnect) => return Exit::UserDisconnect,
                Wake::Request(LinkRequest::Shutdown) => return Exit::Shutdown,
                Wake::Request(LinkRequest::Connect) => Control::Continue,
                Wake::Request(request) => {
                    self.supervisor
                        .submit(request, now, &mut self.transport, &mut out)
                }
                Wake::Lost => {
                    warn!("LINK: transport lost");
                    return Exit::Lost;
                }
                Wake::Timer => Control::Continue,
            };
            let polled = self.supervisor.poll(now, &mut self.transport, &mut out);
            for c in [control, polled] {
                match c {
                    Control::Continue => {}
                    Control::SessionFailed => return Exit::Lost,
                    Control::Incompatible { version } => return Exit::Incompatible(version),
                }
            }
        }
    }

    async fn finish(&mut self) {
        let now = self.clock.now_ms();
        let connected = !self.supervisor.state().is_idle();
        let mut out = Broadcast {
            sink: &mut self.sink,
            bus: &self.shared.events,
        };
        self.supervisor.on_shutdown(now, &mut out);
        if connected {
            self.transport.disconnect().await;
        }
        self.shared.stopped.store(true, Ordering::Release);
        while let Ok(request) = self.shared.requests.try_receive() {
            request.fail(CommandError::EngineStopped);
        }
        self.publish();
        info!("ENGINE: stopped");
    }
}

/// Await one transport step under `timeout_ms`, answering requests that
/// arrive meanwhile. The step future is kept alive across wakeups.
async fn run_step<F, C, S>(
    step: F,
    timeout_ms: u64,
    shared: &Shared,
    supervisor: &mut LinkSupervisor,
    clock: &C,
    sink: &mut S,
) -> StepOutcome
where
    F: Future<Output = Result<(), TransportError>>,
    C: Clock,
    S: EventSink,
{
    enum StepWake {
        Step(Result<(), TransportError>),
        Lost,
        Request(LinkRequest),
        Timer,
    }

    let mut step = pin!(step);
    let deadline = clock.now_ms().saturating_add(timeout_ms);
    loop {
        let now = clock.now_ms();
        if now >= deadline {
            return StepOutcome::Failed(TransportError::TimedOut);
        }
        let woke = or(
            async { StepWake::Step(step.as_mut().await) },
            or(
                async {
                    shared.lost.wait().await;
                    StepWake::Lost
                },
                or(
                    async { StepWake::Request(shared.requests.receive().await) },
                    async {
                        Timer::after(Duration::from_millis(deadline - now)).await;
                        StepWake::Timer
                    },
                ),
            ),
        )
        .await;
        match woke {
            StepWake::Step(Ok(())) => return StepOutcome::Done,
            StepWake::Step(Err(e)) => return StepOutcome::Failed(e),
            StepWake::Lost => return StepOutcome::Failed(TransportError::NotConnected),
            StepWake::Request(LinkRequest::Disconnect) => return StepOutcome::Disconnect,
            StepWake::Request(LinkRequest::Shutdown) => return StepOutcome::Shutdown,
            StepWake::Request(LinkRequest::Connect) | StepWake::Timer => {}
            StepWake::Request(request) => {
                let mut out = Broadcast {
                    sink: &mut *sink,
                    bus: &shared.events,
                };
                supervisor.submit(request, clock.now_ms(), &mut Unwritable, &mut out);
            }
        }
    }
}
