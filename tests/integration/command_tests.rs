//! Tracked and fire-and-forget commands through a live engine.

use std::time::Duration;

use cryolink::CommandError;
use cryolink::link::events::RunOutcome;
use cryolink::link::{LinkEvent, LinkState, Recipe};
use cryolink::protocol::messages::{AckStatus, CommandId};
use cryolink::protocol::telemetry::Fixed10;
use futures_lite::future::zip;

use crate::harness::{fast_config, run, run_with, sleep_ms, wait_until};

// ── Gating ───────────────────────────────────────────────────

#[test]
fn commands_fail_fast_while_offline() {
    run(|rig| async move {
        assert_eq!(
            rig.handle.send_command(CommandId::SET_LAZY_POLL, &[1]).await,
            Err(CommandError::NotConnected)
        );
        assert_eq!(
            rig.handle.send_command_no_reply(CommandId::SET_LAZY_POLL, &[1]),
            Err(CommandError::NotConnected)
        );
        assert!(rig.peer.received().is_empty());
    });
}

#[test]
fn oversized_command_is_refused_locally() {
    run(|rig| async move {
        rig.go_live().await;
        let data = vec![0u8; 600];
        let err = rig
            .handle
            .send_command(CommandId::SET_LAZY_POLL, &data)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::PayloadTooLarge { len: 600 }));
    });
}

// ── Outcomes ─────────────────────────────────────────────────

#[test]
fn relay_and_setpoint_reach_the_controller() {
    run(|rig| async move {
        rig.go_live().await;

        let ack = rig.handle.set_relay(0b101, true).await.expect("relay ack");
        assert!(ack.status.is_ok());
        assert_eq!(rig.peer.relay_outputs(), 0b101);

        rig.handle
            .set_setpoint(1, Fixed10(300))
            .await
            .expect("setpoint ack");

        let handle = rig.handle.clone();
        wait_until("telemetry reflects both writes", move || {
            handle.status().telemetry.as_ref().is_some_and(|t| {
                !t.optimistic
                    && t.snapshot.relay_outputs == 0b101
                    && t.snapshot.controller(1).map(|c| c.setpoint) == Some(Fixed10(300))
            })
        })
        .await;
    });
}

#[test]
fn rejection_surfaces_the_controller_status() {
    run(|rig| async move {
        rig.go_live().await;
        rig.peer.reject(CommandId::SET_LAZY_POLL, AckStatus::NotReady);

        let err = rig.handle.set_lazy_poll(true).await.unwrap_err();
        assert_eq!(
            err,
            CommandError::Rejected {
                status: AckStatus::NotReady,
                detail: 0
            }
        );
        assert!(rig.events.any(|e| matches!(
            e,
            LinkEvent::CommandFailed { cmd_id, .. } if *cmd_id == CommandId::SET_LAZY_POLL
        )));
        assert!(rig.state().is_connected());
        assert_eq!(rig.handle.status().counters.command_rejections, 1);
    });
}

#[test]
fn silent_controller_times_the_command_out() {
    run(|rig| async move {
        rig.go_live().await;
        rig.peer.ignore(CommandId::PAUSE_RUN);

        let err = rig
            .handle
            .send_command_with_timeout(CommandId::PAUSE_RUN, &[], Duration::from_millis(60))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));

        // A command timeout never drops the link.
        assert!(rig.state().is_connected());
        assert_eq!(rig.handle.status().pending_commands, 0);
        assert_eq!(rig.handle.status().counters.command_timeouts, 1);
    });
}

#[test]
fn concurrent_commands_resolve_independently() {
    run(|rig| async move {
        rig.go_live().await;
        rig.peer.reject(CommandId::SET_LAZY_POLL, AckStatus::Busy);

        let (relay, lazy) = zip(rig.handle.set_relay(0b10, true), rig.handle.set_lazy_poll(true)).await;
        assert!(relay.is_ok());
        assert!(matches!(
            lazy,
            Err(CommandError::Rejected {
                status: AckStatus::Busy,
                ..
            })
        ));
        let received = rig.peer.received();
        assert!(received.contains(&CommandId::SET_RELAY));
        assert!(received.contains(&CommandId::SET_LAZY_POLL));
    });
}

#[test]
fn fire_and_forget_is_never_tracked() {
    run(|rig| async move {
        rig.go_live().await;
        rig.handle
            .send_command_no_reply(CommandId::SET_LAZY_POLL, &[1])
            .expect("queued");

        let peer = rig.peer.clone();
        wait_until("controller received it", move || {
            peer.received().contains(&CommandId::SET_LAZY_POLL)
        })
        .await;
        sleep_ms(20).await;
        assert_eq!(rig.handle.status().pending_commands, 0);
        assert_eq!(rig.handle.status().counters.late_acks, 1);
    });
}

#[test]
fn pending_command_fails_when_the_link_drops() {
    let config = cryolink::LinkConfig {
        command_timeout_ms: 2000,
        ..fast_config()
    };
    run_with(config, |peer| peer.ignore(CommandId::STOP_RUN), |rig| async move {
        rig.go_live().await;
        let peer = rig.peer.clone();

        let (result, ()) = zip(rig.handle.stop_run(), async move {
            sleep_ms(30).await;
            peer.drop_link();
        })
        .await;
        assert_eq!(result, Err(CommandError::Disconnected));
    });
}

#[test]
fn shutdown_resolves_pending_commands() {
    let config = cryolink::LinkConfig {
        command_timeout_ms: 2000,
        ..fast_config()
    };
    run_with(config, |peer| peer.ignore(CommandId::STOP_RUN), |rig| async move {
        rig.go_live().await;
        let handle = rig.handle.clone();

        let (result, ()) = zip(rig.handle.stop_run(), async move {
            sleep_ms(30).await;
            handle.shutdown().await;
        })
        .await;
        assert_eq!(result, Err(CommandError::EngineStopped));
    });
}

// ── Run control ──────────────────────────────────────────────

#[test]
fn run_lifecycle_follows_acknowledged_commands() {
    run(|rig| async move {
        rig.go_live().await;
        let recipe = Recipe::new(Duration::from_secs(60), Duration::from_secs(10), 2).expect("valid recipe");

        rig.handle.start_run(recipe).await.expect("start acked");
        assert!(rig.events.any(|e| matches!(e, LinkEvent::RunStarted(r) if *r == recipe)));
        let status = rig.handle.status();
        let run = status.run.as_ref().expect("run tracked");
        assert_eq!(run.recipe, recipe);
        assert!(!run.paused);

        let events = rig.events.clone();
        wait_until("progress tick", move || {
            events.any(|e| matches!(e, LinkEvent::RunProgress(_)))
        })
        .await;

        rig.handle.pause_run().await.expect("pause acked");
        assert!(rig.events.any(|e| matches!(e, LinkEvent::RunPaused)));
        let handle = rig.handle.clone();
        wait_until("paused in status", move || {
            handle.status().run.as_ref().is_some_and(|r| r.paused)
        })
        .await;

        rig.handle.resume_run().await.expect("resume acked");
        assert!(rig.events.any(|e| matches!(e, LinkEvent::RunResumed)));

        rig.handle.stop_run().await.expect("stop acked");
        assert!(rig.events.any(|e| matches!(e, LinkEvent::RunFinished(RunOutcome::Stopped))));
        let handle = rig.handle.clone();
        wait_until("run cleared", move || handle.status().run.is_none()).await;
        assert_eq!(rig.state(), LinkState::Live);
    });
}

#[test]
fn rejected_start_leaves_no_local_run() {
    run(|rig| async move {
        rig.go_live().await;
        rig.peer.reject(CommandId::START_RUN, AckStatus::RejectedPolicy);
        let recipe = Recipe::new(Duration::from_secs(60), Duration::ZERO, 1).expect("valid recipe");

        assert!(rig.handle.start_run(recipe).await.is_err());
        assert!(rig.handle.status().run.is_none());
        assert!(!rig.events.any(|e| matches!(e, LinkEvent::RunStarted(_))));
    });
}
