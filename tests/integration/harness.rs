//! Test rig: one engine, one loopback controller, one recording sink.
//!
//! [`run`] spawns the engine on a local executor next to the test body,
//! shuts it down once the body returns and fails the test if either side
//! hangs.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_io_mini::Timer;
use cryolink::adapters::loopback::{LoopbackPeer, loopback};
use cryolink::adapters::time::MonotonicClock;
use cryolink::link::ports::EventSink;
use cryolink::link::{LinkEngine, LinkEvent, LinkHandle, LinkState};
use cryolink::LinkConfig;
use edge_executor::LocalExecutor;
use futures_lite::future::{block_on, or};

/// Upper bound on any single test body.
const TEST_DEADLINE: Duration = Duration::from_secs(10);
/// Upper bound on any single `wait_until`.
const WAIT_DEADLINE: Duration = Duration::from_secs(3);

// ── Recording sink ───────────────────────────────────────────

#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<LinkEvent>>>,
}

#[allow(dead_code)]
impl Recorder {
    pub fn snapshot(&self) -> Vec<LinkEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, pred: impl Fn(&LinkEvent) -> bool) -> usize {
        self.snapshot().iter().filter(|e| pred(e)).count()
    }

    pub fn any(&self, pred: impl Fn(&LinkEvent) -> bool) -> bool {
        self.count(pred) > 0
    }

    /// Every state the engine entered, in order.
    pub fn states(&self) -> Vec<LinkState> {
        self.snapshot()
            .iter()
            .filter_map(|e| match e {
                LinkEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for Recorder {
    fn emit(&mut self, event: &LinkEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

// ── Rig ──────────────────────────────────────────────────────

pub struct Rig {
    pub handle: LinkHandle,
    pub peer: LoopbackPeer,
    pub events: Recorder,
}

#[allow(dead_code)]
impl Rig {
    pub fn state(&self) -> LinkState {
        self.handle.status().state
    }

    pub async fn wait_for_state(&self, state: LinkState) {
        let handle = self.handle.clone();
        wait_until(&format!("{state:?}"), move || handle.status().state == state).await;
    }

    /// Connect and wait for the session to go live.
    pub async fn go_live(&self) {
        self.handle.connect().await.expect("engine running");
        self.wait_for_state(LinkState::Live).await;
    }
}

/// Short timings so a full lifecycle fits in well under a second.
pub fn fast_config() -> LinkConfig {
    LinkConfig {
        command_timeout_ms: 200,
        session_open_timeout_ms: 200,
        keepalive_interval_ms: 40,
        default_lease_ms: 400,
        telemetry_stale_ms: 250,
        signal_poll_interval_ms: 100,
        run_tick_ms: 50,
        step_timeout_ms: 200,
        reconnect_max_attempts: 3,
        reconnect_delay_ms: 30,
        ..LinkConfig::default()
    }
}

/// Poll `cond` every few milliseconds until it holds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_DEADLINE;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        Timer::after(Duration::from_millis(5)).await;
    }
}

pub async fn sleep_ms(ms: u64) {
    Timer::after(Duration::from_millis(ms)).await;
}

/// Run `body` against a fresh engine with the default fast config.
pub fn run<F, Fut>(body: F)
where
    F: FnOnce(Rig) -> Fut,
    Fut: Future<Output = ()>,
{
    run_with(fast_config(), |_| {}, body);
}

/// Run `body` against a fresh engine. `setup` configures the controller
/// before the engine starts.
pub fn run_with<F, Fut>(config: LinkConfig, setup: impl FnOnce(&LoopbackPeer), body: F)
where
    F: FnOnce(Rig) -> Fut,
    Fut: Future<Output = ()>,
{
    let (transport, peer) = loopback();
    setup(&peer);
    let events = Recorder::default();
    let (engine, handle) = LinkEngine::new(config, transport, MonotonicClock::new(), events.clone())
        .expect("test config is valid");

    let control = handle.clone();
    let rig = Rig {
        handle,
        peer,
        events,
    };

    let executor: LocalExecutor<'_, 8> = LocalExecutor::new();
    let engine_task = executor.spawn(engine.run());

    block_on(executor.run(async move {
        or(
            async move {
                body(rig).await;
                control.shutdown().await;
                engine_task.await;
            },
            async {
                Timer::after(TEST_DEADLINE).await;
                panic!("test did not finish within {TEST_DEADLINE:?}");
            },
        )
        .await;
    }));
}
