//! Property and fuzz-style tests for the wire codec and the pure state
//! machines behind the link engine.

use std::time::Duration;

use cryolink::link::alarms::{AlarmTracker, HISTORY_CAPACITY, ProbeLimits};
use cryolink::link::run_progress::{Phase, Recipe, progress_at};
use cryolink::link::state::{LinkFsm, LinkState, is_allowed};
use cryolink::protocol::frame::{self, MAX_PAYLOAD_LEN, MessageType};
use cryolink::protocol::telemetry::{ControllerMode, ControllerSample, Fixed10, TelemetrySnapshot};
use proptest::prelude::*;

fn arb_msg_type() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Telemetry),
        Just(MessageType::Command),
        Just(MessageType::CommandAck),
        Just(MessageType::Event),
    ]
}

// ── Frame codec ──────────────────────────────────────────────

proptest! {
    #[test]
    fn frame_round_trips(
        msg_type in arb_msg_type(),
        sequence in any::<u16>(),
        payload in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_LEN),
    ) {
        let bytes = frame::encode(msg_type, sequence, &payload).expect("fits");
        let decoded = frame::decode(&bytes).expect("valid frame");
        prop_assert_eq!(decoded.msg_type(), msg_type);
        prop_assert_eq!(decoded.sequence(), sequence);
        prop_assert_eq!(decoded.payload(), payload.as_slice());
    }

    /// CRC-16 catches every single-bit error. The length field is left
    /// alone: changing it moves where the checksum is read from.
    #[test]
    fn single_bit_corruption_is_rejected(
        sequence in any::<u16>(),
        payload in proptest::collection::vec(any::<u8>(), 0..=64),
        pick in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let bytes = frame::encode(MessageType::Telemetry, sequence, &payload).expect("fits");
        let candidates: Vec<usize> = (0..bytes.len()).filter(|i| *i != 4 && *i != 5).collect();
        let at = candidates[pick.index(candidates.len())];

        let mut tampered = bytes.to_vec();
        tampered[at] ^= 1 << bit;
        prop_assert!(frame::decode(&tampered).is_err(), "flip at byte {} bit {} accepted", at, bit);
    }

    #[test]
    fn decoder_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..=600)) {
        if let Ok(f) = frame::decode(&bytes) {
            prop_assert!(f.payload().len() <= MAX_PAYLOAD_LEN);
        }
    }

    #[test]
    fn trailing_bytes_are_ignored(
        payload in proptest::collection::vec(any::<u8>(), 0..=32),
        trailer in proptest::collection::vec(any::<u8>(), 1..=16),
    ) {
        let mut bytes = frame::encode(MessageType::Event, 7, &payload).expect("fits").to_vec();
        bytes.extend_from_slice(&trailer);
        let decoded = frame::decode(&bytes).expect("valid prefix");
        prop_assert_eq!(decoded.payload(), payload.as_slice());
    }
}

// ── Telemetry ────────────────────────────────────────────────

proptest! {
    #[test]
    fn telemetry_decoder_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_LEN)) {
        if let Ok(snapshot) = TelemetrySnapshot::decode(&bytes) {
            prop_assert!(snapshot.controllers.len() <= cryolink::protocol::telemetry::MAX_CONTROLLERS);
        }
    }

    #[test]
    fn fixed_point_stays_within_a_tenth(value in -3000.0f32..3000.0f32) {
        let back = Fixed10::from_f32(value).to_f32();
        prop_assert!((back - value).abs() <= 0.05 + f32::EPSILON * 3000.0);
    }
}

// ── Run progress ─────────────────────────────────────────────

fn arb_recipe() -> impl Strategy<Value = Recipe> {
    (1u64..=600, 0u64..=120, 1u16..=6).prop_map(|(mill_s, hold_s, cycles)| {
        Recipe::new(Duration::from_secs(mill_s), Duration::from_secs(hold_s), cycles)
            .expect("valid recipe")
    })
}

proptest! {
    #[test]
    fn progress_is_monotonic_and_conserves_total(
        recipe in arb_recipe(),
        a in 0.0f64..1.0,
        b in 0.0f64..1.0,
    ) {
        let total = recipe.total_runtime_ms();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let t1 = (total as f64 * lo) as u64;
        let t2 = (total as f64 * hi) as u64;

        if let (Some(p1), Some(p2)) = (progress_at(&recipe, t1), progress_at(&recipe, t2)) {
            prop_assert!(p1.current_cycle <= p2.current_cycle);
            prop_assert!(p1.total_elapsed_ms <= p2.total_elapsed_ms);
            prop_assert_eq!(p2.total_elapsed_ms + p2.total_remaining_ms, total);
            prop_assert_eq!(p1.phase_elapsed_ms + p1.phase_remaining_ms,
                match p1.phase {
                    Phase::Milling => recipe.mill_ms as u64,
                    Phase::Holding => recipe.hold_ms as u64,
                });
            prop_assert!(p2.current_cycle >= 1 && p2.current_cycle <= recipe.cycles);
        }
    }

    #[test]
    fn progress_ends_exactly_at_total_runtime(recipe in arb_recipe()) {
        let total = recipe.total_runtime_ms();
        prop_assert!(progress_at(&recipe, total - 1).is_some());
        prop_assert!(progress_at(&recipe, total).is_none());
    }
}

// ── Alarm history ────────────────────────────────────────────

fn snapshot(alarm_bits: u32, pv: i16) -> TelemetrySnapshot {
    let mut controllers = heapless::Vec::new();
    let _ = controllers.push(ControllerSample {
        id: 1,
        process_value: Fixed10(pv),
        setpoint: Fixed10(0),
        output_x10: 0,
        mode: ControllerMode::Auto,
        age_ms: 0,
    });
    TelemetrySnapshot {
        timestamp_ms: 0,
        digital_inputs: 0,
        relay_outputs: 0,
        alarm_bits,
        controllers,
        run_state: None,
    }
}

proptest! {
    /// Arbitrary alarm streams never overflow the history and the
    /// unacknowledged mask only ever holds bits that were asserted.
    #[test]
    fn alarm_history_is_bounded(
        frames in proptest::collection::vec((any::<u32>(), -1000i16..6000, any::<bool>()), 1..=80),
    ) {
        let mut tracker = AlarmTracker::new(ProbeLimits {
            low_c: -40.0,
            high_c: 450.0,
            cryogenic_controller: None,
        });
        let mut ever_asserted = 0u32;
        for (i, (bits, pv, ack)) in frames.iter().enumerate() {
            ever_asserted |= bits;
            tracker.observe(&snapshot(*bits, *pv), i as u64);
            if *ack {
                tracker.acknowledge_all();
            }
            prop_assert!(tracker.history_len() <= HISTORY_CAPACITY);
            prop_assert_eq!(tracker.unacknowledged() & !ever_asserted, 0);
            prop_assert_eq!(tracker.active(), *bits);
        }

        // Newest first.
        let stamps: Vec<u64> = tracker.history().map(|e| e.timestamp_ms).collect();
        prop_assert!(stamps.windows(2).all(|w| w[0] >= w[1]));
    }
}

// ── Link state machine ───────────────────────────────────────

fn arb_state() -> impl Strategy<Value = LinkState> {
    prop_oneof![
        Just(LinkState::Disconnected),
        Just(LinkState::Connecting),
        Just(LinkState::Discovering),
        Just(LinkState::Subscribing),
        Just(LinkState::OpeningSession),
        Just(LinkState::Live),
        Just(LinkState::Degraded),
        Just(LinkState::Error),
    ]
}

proptest! {
    /// Random transition requests: illegal ones leave the FSM untouched,
    /// legal ones land, and `Disconnected` is always reachable.
    #[test]
    fn fsm_only_takes_allowed_edges(
        targets in proptest::collection::vec(arb_state(), 1..=40),
    ) {
        let mut fsm = LinkFsm::new();
        for (i, to) in targets.iter().enumerate() {
            let from = fsm.current();
            let now = i as u64;
            match fsm.transition(*to, now) {
                Ok(prev) => {
                    prop_assert!(is_allowed(from, *to));
                    prop_assert_eq!(prev, from);
                    prop_assert_eq!(fsm.current(), *to);
                    prop_assert_eq!(fsm.entered_at_ms(), now);
                }
                Err(e) => {
                    prop_assert!(!is_allowed(from, *to));
                    prop_assert_eq!(e.from, from);
                    prop_assert_eq!(fsm.current(), from);
                }
            }
            prop_assert!(from == LinkState::Disconnected || is_allowed(from, LinkState::Disconnected));
        }
    }
}
