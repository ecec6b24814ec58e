//! Session lifecycle, link health, alarms and peer events end to end.

use cryolink::CommandError;
use cryolink::link::alarms::AlarmSource;
use cryolink::link::{LinkEvent, LinkState, QualityGrade};
use cryolink::protocol::messages::{AckStatus, Severity};
use cryolink::protocol::telemetry::Fixed10;

use crate::harness::{fast_config, run, run_with, sleep_ms, wait_until};

// ── Session ──────────────────────────────────────────────────

#[test]
fn close_then_reopen_session_on_the_same_link() {
    run(|rig| async move {
        rig.go_live().await;

        rig.handle.close_session().await.expect("close acked");
        assert_eq!(rig.state(), LinkState::OpeningSession);
        assert!(rig.handle.status().session.is_none());
        assert_eq!(rig.peer.session_id(), None);
        assert!(rig.events.any(|e| matches!(e, LinkEvent::SessionClosed { id: 0x1000 })));

        // No session: tracked commands are refused locally.
        assert_eq!(
            rig.handle.set_lazy_poll(true).await,
            Err(CommandError::NoSession)
        );

        let info = rig.handle.open_session().await.expect("reopened");
        assert_eq!(info.id, 0x1001);
        assert_eq!(rig.state(), LinkState::Live);
        assert_eq!(rig.peer.connects(), 1, "transport stayed up");
    });
}

#[test]
fn open_session_while_live_returns_the_current_one() {
    run(|rig| async move {
        rig.go_live().await;
        let info = rig.handle.open_session().await.expect("already open");
        assert_eq!(info.id, 0x1000);
        assert_eq!(rig.peer.session_id(), Some(0x1000));
    });
}

#[test]
fn refused_session_counts_as_a_lost_link() {
    let config = cryolink::LinkConfig {
        reconnect_max_attempts: 1,
        ..fast_config()
    };
    run_with(
        config,
        |peer| peer.set_open_status(AckStatus::RejectedPolicy),
        |rig| async move {
            rig.handle.connect().await.expect("engine running");

            let peer = rig.peer.clone();
            let handle = rig.handle.clone();
            wait_until("retry budget spent", move || {
                peer.connects() == 2 && handle.status().state == LinkState::Disconnected
            })
            .await;

            sleep_ms(100).await;
            assert_eq!(rig.peer.connects(), 2);
            assert_eq!(rig.state(), LinkState::Disconnected);
            assert_eq!(
                rig.events.count(|e| matches!(e, LinkEvent::ReconnectScheduled { .. })),
                1
            );
            assert!(!rig.events.any(|e| matches!(e, LinkEvent::SessionOpened(_))));
        },
    );
}

#[test]
fn short_lease_from_the_controller_is_honoured() {
    run_with(
        fast_config(),
        |peer| peer.set_lease(Some(200)),
        |rig| async move {
            rig.go_live().await;
            let status = rig.handle.status();
            assert_eq!(status.session.as_ref().map(|s| s.lease_ms), Some(200));

            // Keepalives at 40 ms keep a 200 ms lease valid.
            sleep_ms(400).await;
            assert!(rig.state().has_session());
        },
    );
}

#[test]
fn missing_lease_falls_back_to_the_configured_default() {
    run_with(
        fast_config(),
        |peer| peer.set_lease(None),
        |rig| async move {
            rig.go_live().await;
            let status = rig.handle.status();
            assert_eq!(
                status.session.as_ref().map(|s| s.lease_ms),
                Some(fast_config().default_lease_ms)
            );
        },
    );
}

// ── Health ───────────────────────────────────────────────────

#[test]
fn stale_telemetry_degrades_then_recovers() {
    run(|rig| async move {
        rig.go_live().await;
        let handle = rig.handle.clone();
        wait_until("first snapshot", move || handle.status().telemetry.is_some()).await;

        rig.peer.set_telemetry_on_keepalive(false);
        rig.wait_for_state(LinkState::Degraded).await;
        assert_ne!(rig.handle.status().quality.grade, QualityGrade::Good);

        // Commands still flow while degraded.
        rig.handle.set_lazy_poll(false).await.expect("acked while degraded");

        rig.peer.set_telemetry_on_keepalive(true);
        rig.wait_for_state(LinkState::Live).await;
        assert_eq!(rig.handle.status().quality.grade, QualityGrade::Good);
    });
}

#[test]
fn disabling_keepalive_stops_the_heartbeat() {
    run(|rig| async move {
        rig.go_live().await;
        rig.handle.set_keepalive_enabled(false).await.expect("engine running");
        sleep_ms(20).await;
        assert!(!rig.handle.status().keepalive_enabled);

        let before = rig.peer.keepalives();
        sleep_ms(150).await;
        assert_eq!(rig.peer.keepalives(), before);

        rig.handle.set_keepalive_enabled(true).await.expect("engine running");
        let peer = rig.peer.clone();
        wait_until("heartbeat resumed", move || peer.keepalives() > before).await;
    });
}

#[test]
fn weak_signal_grades_the_link_fair() {
    run(|rig| async move {
        rig.peer.set_rssi(Some(-82));
        rig.go_live().await;

        let handle = rig.handle.clone();
        wait_until("fair grade", move || {
            let status = handle.status();
            status.quality.rssi_dbm == Some(-82) && status.quality.grade == QualityGrade::Fair
        })
        .await;
    });
}

// ── Alarms ───────────────────────────────────────────────────

#[test]
fn alarm_raise_and_acknowledge() {
    run(|rig| async move {
        rig.go_live().await;
        rig.peer.set_alarm_bits(0b100);

        let handle = rig.handle.clone();
        wait_until("alarm active", move || {
            let status = handle.status();
            status.alarms.active == 0b100 && status.alarms.unacknowledged == 0b100
        })
        .await;
        assert!(rig.events.any(|e| matches!(
            e,
            LinkEvent::Alarm(entry)
                if entry.asserted && entry.source == AlarmSource::Controller { bit: 2 }
        )));

        rig.handle.acknowledge_alarms(0b100).await.expect("ack acked");
        let status = rig.handle.status();
        assert_eq!(status.alarms.unacknowledged, 0);
        assert_eq!(status.alarms.active, 0b100);

        rig.peer.set_alarm_bits(0);
        let handle = rig.handle.clone();
        wait_until("alarm cleared", move || handle.status().alarms.active == 0).await;
        assert!(rig.handle.status().alarms.history.len() >= 2);
    });
}

#[test]
fn out_of_range_probe_is_flagged() {
    run(|rig| async move {
        rig.go_live().await;
        rig.peer.set_process_value(1, Fixed10(5000));

        let handle = rig.handle.clone();
        wait_until("probe fault", move || handle.status().alarms.probe_faults == vec![1]).await;

        rig.peer.set_process_value(1, Fixed10(210));
        let handle = rig.handle.clone();
        wait_until("probe recovered", move || handle.status().alarms.probe_faults.is_empty()).await;
    });
}

#[test]
fn cryogenic_chamber_is_exempt_from_the_low_limit() {
    run(|rig| async move {
        rig.go_live().await;
        let handle = rig.handle.clone();
        wait_until("snapshots", move || {
            handle.status().counters.telemetry_frames >= 3
        })
        .await;
        // Controller 0 idles at -185.0 C, far below the low limit.
        assert!(rig.handle.status().alarms.probe_faults.is_empty());
    });
}

// ── Peer events ──────────────────────────────────────────────

#[test]
fn unsolicited_events_are_forwarded() {
    run(|rig| async move {
        rig.go_live().await;
        assert!(rig.peer.send_event(0x0042, Severity::Warn, 3));

        let events = rig.events.clone();
        wait_until("peer event", move || {
            events.any(|e| matches!(e, LinkEvent::Peer(p) if p.event_id == 0x0042 && p.source == 3))
        })
        .await;
        assert_eq!(rig.handle.status().counters.peer_events, 1);
    });
}

#[test]
fn subscribers_see_the_same_events() {
    run(|rig| async move {
        let mut sub = rig.handle.subscribe().expect("subscriber slot");
        rig.go_live().await;

        let mut seen = Vec::new();
        while let Some(event) = sub.try_next_message_pure() {
            seen.push(event);
        }
        assert!(seen.iter().any(|e| matches!(e, LinkEvent::SessionOpened(_))));
        assert!(seen.iter().any(|e| matches!(
            e,
            LinkEvent::StateChanged {
                to: LinkState::Live,
                ..
            }
        )));
    });
}

#[test]
fn corrupt_notifications_are_counted_and_ignored() {
    run(|rig| async move {
        rig.go_live().await;
        assert!(rig.peer.inject(&[0x01, 0x03, 0x00]));
        assert!(rig.peer.inject(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x00, 0xDE, 0xAD]));

        let handle = rig.handle.clone();
        wait_until("drops counted", move || {
            let status = handle.status();
            status.counters.dropped_too_short == 1 && status.counters.dropped_checksum == 1
        })
        .await;
        assert!(rig.state().is_connected());
    });
}
