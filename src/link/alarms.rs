//! Alarm transition tracker.
//!
//! Two independent streams feed one bounded history:
//!
//! 1. **Controller alarms.** Each snapshot's `alarm_bits` is XOR-ed
//!    against the previous one; every changed bit yields one entry.
//!    Newly asserted bits are OR-ed into an unacknowledged mask that only
//!    an explicit acknowledge clears.
//! 2. **Probe errors.** Each controller's process value is checked against
//!    fixed physical limits. The cryogenic controller is exempt from the
//!    low limit, since deep-negative readings are its normal range.
//!
//! History is newest-first and capped; the oldest entry is dropped when
//! full. Entries are never edited after being recorded.

use std::collections::BTreeSet;
use std::sync::Arc;

use heapless::Deque;
use log::{error, info, warn};
use serde::Serialize;

use crate::protocol::messages::Severity;
use crate::protocol::telemetry::{ControllerSample, TelemetrySnapshot};

/// History capacity.
pub const HISTORY_CAPACITY: usize = 100;

// ── Static bit table ─────────────────────────────────────────

/// Name and severity of a controller alarm bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmInfo {
    pub name: &'static str,
    pub severity: Severity,
}

const ALARM_TABLE: [AlarmInfo; 10] = [
    AlarmInfo { name: "E-stop", severity: Severity::Critical },
    AlarmInfo { name: "Door open", severity: Severity::Alarm },
    AlarmInfo { name: "Motor overload", severity: Severity::Alarm },
    AlarmInfo { name: "Motor stall", severity: Severity::Alarm },
    AlarmInfo { name: "Over-temperature", severity: Severity::Critical },
    AlarmInfo { name: "LN2 supply low", severity: Severity::Warn },
    AlarmInfo { name: "Heater fault", severity: Severity::Alarm },
    AlarmInfo { name: "Sensor fault", severity: Severity::Warn },
    AlarmInfo { name: "Controller comms fault", severity: Severity::Warn },
    AlarmInfo { name: "Supply power fault", severity: Severity::Critical },
];

const UNASSIGNED: AlarmInfo = AlarmInfo {
    name: "Controller alarm",
    severity: Severity::Warn,
};

const PROBE_ERROR: AlarmInfo = AlarmInfo {
    name: "Probe error",
    severity: Severity::Alarm,
};

/// Metadata for `bit` (0..32).
pub fn alarm_info(bit: u8) -> AlarmInfo {
    ALARM_TABLE.get(bit as usize).copied().unwrap_or(UNASSIGNED)
}

// ── History entries ──────────────────────────────────────────

/// Which stream produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlarmSource {
    /// Controller-reported alarm bit.
    Controller { bit: u8 },
    /// Client-detected out-of-range reading on a controller's probe.
    Probe { controller: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlarmHistoryEntry {
    pub timestamp_ms: u64,
    pub source: AlarmSource,
    pub name: &'static str,
    pub severity: Severity,
    /// `true` on assert, `false` on clear.
    pub asserted: bool,
}

// ── Probe limits ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeLimits {
    pub low_c: f32,
    pub high_c: f32,
    pub cryogenic_controller: Option<u8>,
}

impl ProbeLimits {
    pub fn is_out_of_range(&self, sample: &ControllerSample) -> bool {
        let pv = sample.process_value.to_f32();
        let exempt_low = self.cryogenic_controller == Some(sample.id);
        pv > self.high_c || (!exempt_low && pv < self.low_c)
    }
}

// ── Tracker ──────────────────────────────────────────────────

pub struct AlarmTracker {
    /// Alarm bits of the last snapshot; `None` until the first one.
    previous: Option<u32>,
    unacknowledged: u32,
    probe_faults: BTreeSet<u8>,
    history: Deque<AlarmHistoryEntry, HISTORY_CAPACITY>,
    /// Copy of `history` handed to status snapshots; rebuilt only when an
    /// entry is recorded.
    published: Arc<[AlarmHistoryEntry]>,
    limits: ProbeLimits,
}

impl AlarmTracker {
    pub fn new(limits: ProbeLimits) -> Self {
        Self {
            previous: None,
            unacknowledged: 0,
            probe_faults: BTreeSet::new(),
            history: Deque::new(),
            published: Arc::from([]),
            limits,
        }
    }

    /// Currently asserted controller alarm bits.
    pub fn active(&self) -> u32 {
        self.previous.unwrap_or(0)
    }

    pub fn unacknowledged(&self) -> u32 {
        self.unacknowledged
    }

    /// Controllers currently flagged with a probe error.
    pub fn probe_faults(&self) -> impl Iterator<Item = u8> + '_ {
        self.probe_faults.iter().copied()
    }

    pub fn has_probe_fault(&self, controller: u8) -> bool {
        self.probe_faults.contains(&controller)
    }

    /// Newest first.
    pub fn history(&self) -> impl Iterator<Item = &AlarmHistoryEntry> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Shared newest-first history for status snapshots.
    pub fn shared_history(&self) -> Arc<[AlarmHistoryEntry]> {
        Arc::clone(&self.published)
    }

    /// Forget the last connection's alarm bits and probe faults so the
    /// next snapshot is diffed against nothing. History and the
    /// unacknowledged mask are kept.
    pub fn reset_baseline(&mut self) {
        self.previous = None;
        self.probe_faults.clear();
    }

    /// Diff a new snapshot against the previous one. Returns the entries
    /// recorded, oldest first.
    pub fn observe(&mut self, snapshot: &TelemetrySnapshot, now_ms: u64) -> Vec<AlarmHistoryEntry> {
        let mut recorded = Vec::new();

        let bits = snapshot.alarm_bits;
        let changed = self.previous.unwrap_or(0) ^ bits;
        for bit in 0..32u8 {
            let mask = 1u32 << bit;
            if changed & mask == 0 {
                continue;
            }
            let asserted = bits & mask != 0;
            if asserted {
                self.unacknowledged |= mask;
            }
            let info = alarm_info(bit);
            recorded.push(self.record(AlarmHistoryEntry {
                timestamp_ms: now_ms,
                source: AlarmSource::Controller { bit },
                name: info.name,
                severity: info.severity,
                asserted,
            }));
        }
        self.previous = Some(bits);

        for sample in &snapshot.controllers {
            let faulted = self.limits.is_out_of_range(sample);
            let was = self.probe_faults.contains(&sample.id);
            if faulted == was {
                continue;
            }
            if faulted {
                self.probe_faults.insert(sample.id);
            } else {
                self.probe_faults.remove(&sample.id);
            }
            recorded.push(self.record_probe(sample.id, faulted, now_ms));
        }

        // A controller that vanished from the snapshot can no longer be
        // judged out of range.
        let vanished: Vec<u8> = self
            .probe_faults
            .iter()
            .copied()
            .filter(|id| snapshot.controller(*id).is_none())
            .collect();
        for id in vanished {
            self.probe_faults.remove(&id);
            recorded.push(self.record_probe(id, false, now_ms));
        }

        if !recorded.is_empty() {
            self.published = self.history.iter().cloned().collect();
        }
        recorded
    }

    /// Clear specific bits from the unacknowledged mask. Returns what remains.
    pub fn acknowledge(&mut self, mask: u32) -> u32 {
        self.unacknowledged &= !mask;
        info!(
            "ALARM: acknowledged 0x{mask:08X}, outstanding 0x{:08X}",
            self.unacknowledged
        );
        self.unacknowledged
    }

    pub fn acknowledge_all(&mut self) {
        self.acknowledge(u32::MAX);
    }

    fn record_probe(&mut self, controller: u8, asserted: bool, now_ms: u64) -> AlarmHistoryEntry {
        self.record(AlarmHistoryEntry {
            timestamp_ms: now_ms,
            source: AlarmSource::Probe { controller },
            name: PROBE_ERROR.name,
            severity: PROBE_ERROR.severity,
            asserted,
        })
    }

    fn record(&mut self, entry: AlarmHistoryEntry) -> AlarmHistoryEntry {
        match (entry.asserted, entry.severity) {
            (true, Severity::Critical) => error!("ALARM SET: {} {:?}", entry.name, entry.source),
            (true, _) => warn!("ALARM SET: {} {:?}", entry.name, entry.source),
            (false, _) => info!("ALARM CLEARED: {} {:?}", entry.name, entry.source),
        }
        if self.history.is_full() {
            self.history.pop_back();
        }
        // Room was made above.
        let _ = self.history.push_front(entry.clone());
        entry
    }
}
