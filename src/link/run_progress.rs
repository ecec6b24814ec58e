//! Run progress timer.
//!
//! A recipe is `cycles` milling phases separated by `cycles - 1` holding
//! phases; there is no hold after the final mill. Progress is a pure
//! function of total run time ([`progress_at`]); the tracker only keeps
//! run time straight across pause/resume:
//!
//! ```text
//!  elapsed = banked + (now - phase_start)      while running
//!  pause  : banked += now - phase_start
//!  resume : phase_start = now
//!  stop   : banked = 0, progress cleared
//! ```

use core::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::RecipeError;
use crate::protocol::messages::start_run_data;
use crate::protocol::telemetry::{MachineState, RunState};

// ═══════════════════════════════════════════════════════════════
//  Recipe and progress types
// ═══════════════════════════════════════════════════════════════

/// Declared run: `cycles × (mill + hold)` minus the trailing hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub mill_ms: u32,
    pub hold_ms: u32,
    pub cycles: u16,
}

impl Recipe {
    pub fn new(mill: Duration, hold: Duration, cycles: u16) -> Result<Self, RecipeError> {
        if cycles == 0 {
            return Err(RecipeError::ZeroCycles);
        }
        if mill.is_zero() {
            return Err(RecipeError::ZeroMillDuration);
        }
        let mill_ms = u32::try_from(mill.as_millis()).map_err(|_| RecipeError::DurationOverflow)?;
        let hold_ms = u32::try_from(hold.as_millis()).map_err(|_| RecipeError::DurationOverflow)?;
        Ok(Self {
            mill_ms,
            hold_ms,
            cycles,
        })
    }

    /// `mill × cycles + hold × (cycles − 1)`.
    pub fn total_runtime_ms(&self) -> u64 {
        let cycles = self.cycles as u64;
        self.mill_ms as u64 * cycles + self.hold_ms as u64 * cycles.saturating_sub(1)
    }

    /// START_RUN argument bytes.
    pub fn to_command_data(&self) -> [u8; 10] {
        start_run_data(self.mill_ms, self.hold_ms, self.cycles)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Milling,
    Holding,
}

/// Where a run stands. Exists only while a run is active or paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    /// 1-based.
    pub current_cycle: u16,
    pub total_cycles: u16,
    pub phase: Phase,
    pub phase_elapsed_ms: u64,
    pub phase_remaining_ms: u64,
    pub total_elapsed_ms: u64,
    pub total_remaining_ms: u64,
}

/// Locate `elapsed_ms` within the recipe. `None` once every cycle has run.
pub fn progress_at(recipe: &Recipe, elapsed_ms: u64) -> Option<RunProgress> {
    let mill = recipe.mill_ms as u64;
    let hold = recipe.hold_ms as u64;
    let total = recipe.total_runtime_ms();
    let at = |cycle: u16, phase: Phase, phase_elapsed: u64, phase_len: u64| RunProgress {
        current_cycle: cycle,
        total_cycles: recipe.cycles,
        phase,
        phase_elapsed_ms: phase_elapsed,
        phase_remaining_ms: phase_len - phase_elapsed,
        total_elapsed_ms: elapsed_ms,
        total_remaining_ms: total - elapsed_ms,
    };

    let mut remainder = elapsed_ms;
    for cycle in 1..=recipe.cycles {
        if remainder < mill {
            return Some(at(cycle, Phase::Milling, remainder, mill));
        }
        remainder -= mill;
        if cycle == recipe.cycles {
            break;
        }
        if remainder < hold {
            return Some(at(cycle, Phase::Holding, remainder, hold));
        }
        remainder -= hold;
    }
    None
}

// ═══════════════════════════════════════════════════════════════
//  Tracker
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackerState {
    Stopped,
    Running { phase_start_ms: u64 },
    Paused,
}

/// Outcome of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTick {
    /// No run is advancing.
    Idle,
    Progress(RunProgress),
    /// The final milling phase just ended; progress is cleared.
    Completed { cycles: u16 },
}

/// What reconciliation against the controller's run state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Unchanged,
    Stopped(MachineState),
    Paused,
    Resumed,
}

pub struct RunProgressTracker {
    recipe: Option<Recipe>,
    state: TrackerState,
    /// Run time accumulated before the most recent resume.
    banked_ms: u64,
    last: Option<RunProgress>,
    /// Local minus controller-reported remaining time.
    drift_ms: Option<i64>,
    tick_ms: u64,
    next_tick_ms: u64,
}

impl RunProgressTracker {
    pub fn new(tick_ms: u32) -> Self {
        Self {
            recipe: None,
            state: TrackerState::Stopped,
            banked_ms: 0,
            last: None,
            drift_ms: None,
            tick_ms: tick_ms.max(1) as u64,
            next_tick_ms: 0,
        }
    }

    pub fn recipe(&self) -> Option<&Recipe> {
        self.recipe.as_ref()
    }

    pub fn progress(&self) -> Option<RunProgress> {
        self.last
    }

    pub fn drift_ms(&self) -> Option<i64> {
        self.drift_ms
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, TrackerState::Running { .. })
    }

    pub fn is_paused(&self) -> bool {
        self.state == TrackerState::Paused
    }

    pub fn is_active(&self) -> bool {
        self.state != TrackerState::Stopped
    }

    /// Total run time, excluding pauses.
    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        match self.state {
            TrackerState::Running { phase_start_ms } => {
                self.banked_ms + now_ms.saturating_sub(phase_start_ms)
            }
            TrackerState::Paused => self.banked_ms,
            TrackerState::Stopped => 0,
        }
    }

    pub fn start(&mut self, recipe: Recipe, now_ms: u64) {
        info!(
            "RUN: start {} cycle(s), mill {} ms, hold {} ms, total {} ms",
            recipe.cycles,
            recipe.mill_ms,
            recipe.hold_ms,
            recipe.total_runtime_ms()
        );
        self.recipe = Some(recipe);
        self.state = TrackerState::Running {
            phase_start_ms: now_ms,
        };
        self.banked_ms = 0;
        self.drift_ms = None;
        self.last = progress_at(&recipe, 0);
        self.next_tick_ms = now_ms + self.tick_ms;
    }

    /// Returns `false` when no run is advancing.
    pub fn pause(&mut self, now_ms: u64) -> bool {
        let TrackerState::Running { phase_start_ms } = self.state else {
            return false;
        };
        self.banked_ms += now_ms.saturating_sub(phase_start_ms);
        self.state = TrackerState::Paused;
        if let Some(recipe) = &self.recipe {
            if let Some(p) = progress_at(recipe, self.banked_ms) {
                self.last = Some(p);
            }
        }
        info!("RUN: paused at {} ms", self.banked_ms);
        true
    }

    /// Returns `false` when the run is not paused.
    pub fn resume(&mut self, now_ms: u64) -> bool {
        if self.state != TrackerState::Paused {
            return false;
        }
        self.state = TrackerState::Running {
            phase_start_ms: now_ms,
        };
        self.next_tick_ms = now_ms + self.tick_ms;
        info!("RUN: resumed at {} ms", self.banked_ms);
        true
    }

    /// Clear everything. Returns `false` when nothing was active.
    pub fn stop(&mut self) -> bool {
        let was_active = self.is_active();
        self.recipe = None;
        self.state = TrackerState::Stopped;
        self.banked_ms = 0;
        self.last = None;
        self.drift_ms = None;
        if was_active {
            info!("RUN: stopped");
        }
        was_active
    }

    pub fn next_tick_at(&self) -> Option<u64> {
        self.is_running().then_some(self.next_tick_ms)
    }

    pub fn tick_due(&self, now_ms: u64) -> bool {
        self.is_running() && now_ms >= self.next_tick_ms
    }

    /// Recompute progress. Call on every tick interval while running.
    pub fn tick(&mut self, now_ms: u64) -> RunTick {
        let (TrackerState::Running { .. }, Some(recipe)) = (self.state, self.recipe) else {
            return RunTick::Idle;
        };
        // Schedule from the previous deadline so ticks do not drift.
        while self.next_tick_ms <= now_ms {
            self.next_tick_ms += self.tick_ms;
        }
        match progress_at(&recipe, self.elapsed_ms(now_ms)) {
            Some(p) => {
                self.last = Some(p);
                RunTick::Progress(p)
            }
            None => {
                info!("RUN: complete ({} cycles)", recipe.cycles);
                self.stop();
                RunTick::Completed {
                    cycles: recipe.cycles,
                }
            }
        }
    }

    /// Fold in the controller's run-state block. The controller is
    /// authoritative for whether the run continues.
    pub fn reconcile(&mut self, peer: &RunState, now_ms: u64) -> Reconciled {
        if !self.is_active() {
            return Reconciled::Unchanged;
        }
        let outcome = match peer.machine_state {
            MachineState::Idle | MachineState::Complete | MachineState::Fault => {
                warn!("RUN: controller reports {:?}, stopping local timer", peer.machine_state);
                self.stop();
                return Reconciled::Stopped(peer.machine_state);
            }
            MachineState::Paused if self.is_running() => {
                self.pause(now_ms);
                Reconciled::Paused
            }
            MachineState::Running if self.is_paused() => {
                self.resume(now_ms);
                Reconciled::Resumed
            }
            _ => Reconciled::Unchanged,
        };
        if let Some(recipe) = &self.recipe {
            let local_remaining = recipe
                .total_runtime_ms()
                .saturating_sub(self.elapsed_ms(now_ms));
            self.drift_ms = Some(local_remaining as i64 - peer.remaining_ms as i64);
        }
        outcome
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
