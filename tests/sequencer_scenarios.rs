//! Integration tests for the Sequencer driven synchronously.
//!
//! Each test wires a Sequencer to a `MockTransport`, feeds transport events
//! back by hand and checks the resulting state and event stream.

use dave::action::ActionState;
use dave::config::DaveConfig;
use dave::error::{DaveError, ErrorCause};
use dave::message::Message;
use dave::sequencer::{PauseReason, Sequencer, SequencerEvent, SequencerState};
use dave::transport::mock::{MockTransport, SentLog, SimulatedRemote};
use dave::transport::TransportEvent;
use dave::Descriptor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

struct Harness {
    sequencer: Sequencer,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    observer: broadcast::Receiver<SequencerEvent>,
    sent: SentLog,
}

impl Harness {
    fn new(remote: Option<SimulatedRemote>) -> Self {
        Self::with_config(remote, DaveConfig::default())
    }

    fn with_config(remote: Option<SimulatedRemote>, config: DaveConfig) -> Self {
        let (transport, transport_events) = MockTransport::new();
        let sent = transport.sent_log();
        let transport = match remote {
            Some(remote) => transport.with_responder(remote.into_responder()),
            None => transport,
        };
        let sequencer = Sequencer::new(Box::new(transport), &config);
        let observer = sequencer.subscribe();
        Self {
            sequencer,
            transport_events,
            observer,
            sent,
        }
    }

    /// Deliver every queued transport event.
    fn pump(&mut self) {
        while let Ok(event) = self.transport_events.try_recv() {
            self.sequencer.handle_event(event);
        }
    }

    fn events(&mut self) -> Vec<SequencerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.observer.try_recv() {
            events.push(event);
        }
        events
    }

    fn sent_types(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|m| m.message_type().to_string())
            .collect()
    }

    fn last_sent(&self) -> Message {
        self.sent.lock().last().cloned().unwrap()
    }

    /// Answer the last sent message with an echo of itself.
    fn ack_last(&mut self) {
        let reply = self.last_sent();
        self.sequencer
            .handle_event(TransportEvent::MessageReceived(reply));
    }
}

fn directory(path: &str) -> Descriptor {
    Descriptor::new().with("directory", path)
}

fn movie(name: &str, length: u64, min_spots: u64) -> Descriptor {
    Descriptor::new()
        .with("name", name)
        .with("length", length)
        .with("min_spots", min_spots)
}

fn stage(x: f64, y: f64) -> Descriptor {
    Descriptor::new().with("stage_x", x).with("stage_y", y)
}

#[test]
fn threshold_violation_pauses_at_the_failing_action() {
    let mut h = Harness::new(Some(SimulatedRemote::default().with_found_spots(3)));
    h.sequencer
        .load(vec![directory("D1"), movie("m1", 10, 5)])
        .unwrap();
    h.sequencer.run().unwrap();
    h.pump();

    assert_eq!(h.sequencer.state(), SequencerState::Paused);
    assert_eq!(h.sequencer.cursor(), 1);
    assert_eq!(h.sequencer.len(), 2);
    assert_eq!(h.sent_types(), vec!["Set Directory", "Take Movie"]);
    assert_eq!(h.sequencer.action(1).unwrap().state(), ActionState::Idle);

    let events = h.events();
    let errored = events
        .iter()
        .find_map(|event| match event {
            SequencerEvent::SequenceErrored {
                index,
                descriptor,
                error,
            } => Some((*index, descriptor.clone(), error.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(errored.0, 1);
    assert_eq!(errored.1.str("name"), Some("m1"));
    assert_eq!(errored.2.cause, ErrorCause::ThresholdViolation);
    assert_eq!(errored.2.message, "3 found molecules is less than the target: 5");
    assert!(matches!(
        events.last(),
        Some(SequencerEvent::SequencePaused {
            reason: PauseReason::Error { index: 1, .. }
        })
    ));
}

#[test]
fn resume_retries_the_errored_action() {
    let spots = Arc::new(AtomicU64::new(3));
    let reported = spots.clone();
    let (transport, mut transport_events) = MockTransport::new();
    let sent = transport.sent_log();
    let transport = transport.with_responder(move |message: &Message| {
        SimulatedRemote::default()
            .with_found_spots(reported.load(Ordering::SeqCst))
            .respond(message)
    });
    let mut sequencer = Sequencer::new(Box::new(transport), &DaveConfig::default());

    sequencer
        .load(vec![directory("D1"), movie("m1", 10, 5)])
        .unwrap();
    sequencer.run().unwrap();
    while let Ok(event) = transport_events.try_recv() {
        sequencer.handle_event(event);
    }
    assert_eq!(sequencer.state(), SequencerState::Paused);

    spots.store(8, Ordering::SeqCst);
    sequencer.resume().unwrap();
    while let Ok(event) = transport_events.try_recv() {
        sequencer.handle_event(event);
    }

    assert_eq!(sequencer.state(), SequencerState::Idle);
    let movies = sent
        .lock()
        .iter()
        .filter(|m| m.is_type("Take Movie"))
        .count();
    assert_eq!(movies, 2);
}

#[test]
fn confirmed_target_is_not_sent_again() {
    let mut h = Harness::new(Some(SimulatedRemote::default()));
    h.sequencer.load(vec![stage(1.0, 2.0)]).unwrap();

    h.sequencer.run().unwrap();
    h.pump();
    assert_eq!(h.sent.lock().len(), 1);

    h.sequencer.run().unwrap();
    h.pump();
    assert_eq!(h.sent.lock().len(), 1);
    assert_eq!(h.sequencer.state(), SequencerState::Idle);

    let skipped = h.events().into_iter().any(|event| {
        matches!(
            event,
            SequencerEvent::ActionCompleted {
                index: 0,
                skipped: true,
                ..
            }
        )
    });
    assert!(skipped);
}

#[test]
fn redundant_skipping_can_be_disabled() {
    let mut config = DaveConfig::default();
    config.sequencer.skip_redundant = false;
    let mut h = Harness::with_config(Some(SimulatedRemote::default()), config);
    h.sequencer
        .load(vec![stage(1.0, 2.0), stage(1.0, 2.0)])
        .unwrap();
    h.sequencer.run().unwrap();
    h.pump();
    assert_eq!(h.sent.lock().len(), 2);
}

#[test]
fn pause_waits_for_the_action_in_flight() {
    let mut h = Harness::new(None);
    h.sequencer
        .load(vec![directory("D1"), directory("D2")])
        .unwrap();
    h.sequencer.run().unwrap();
    h.sequencer.pause().unwrap();
    assert_eq!(h.sequencer.state(), SequencerState::Running);
    assert_eq!(h.sequencer.action(0).unwrap().state(), ActionState::Sent);

    h.ack_last();
    assert_eq!(h.sequencer.state(), SequencerState::Paused);
    assert_eq!(h.sequencer.cursor(), 1);
    assert_eq!(h.sent.lock().len(), 1);

    h.sequencer.resume().unwrap();
    assert_eq!(h.sent.lock().len(), 2);
    h.ack_last();
    assert_eq!(h.sequencer.state(), SequencerState::Idle);

    let events = h.events();
    assert!(events.contains(&SequencerEvent::SequencePaused {
        reason: PauseReason::Requested
    }));
    assert!(events.contains(&SequencerEvent::SequenceResumed));
    assert_eq!(events.last(), Some(&SequencerEvent::SequenceFinished));
}

#[test]
fn pause_action_stops_after_completing() {
    let mut h = Harness::new(Some(SimulatedRemote::default()));
    h.sequencer
        .load(vec![
            directory("D1"),
            Descriptor::new().with("pause", true),
            directory("D2"),
        ])
        .unwrap();
    h.sequencer.run().unwrap();
    h.pump();

    assert_eq!(h.sequencer.state(), SequencerState::Paused);
    assert_eq!(h.sequencer.cursor(), 2);
    assert!(h.events().contains(&SequencerEvent::SequencePaused {
        reason: PauseReason::AfterAction { index: 1 }
    }));

    h.sequencer.resume().unwrap();
    h.pump();
    assert_eq!(h.sequencer.state(), SequencerState::Idle);
    assert_eq!(h.sent_types(), vec!["Set Directory", "Set Directory"]);
}

#[test]
fn pause_after_flag_on_any_action() {
    let mut h = Harness::new(Some(SimulatedRemote::default()));
    h.sequencer
        .load(vec![
            directory("D1").with("pause_after", true),
            directory("D2"),
        ])
        .unwrap();
    h.sequencer.run().unwrap();
    h.pump();
    assert_eq!(h.sequencer.state(), SequencerState::Paused);
    assert_eq!(h.sequencer.cursor(), 1);
}

#[test]
fn mismatched_reply_is_a_protocol_error() {
    let mut h = Harness::new(None);
    h.sequencer.load(vec![directory("D1")]).unwrap();
    h.sequencer.run().unwrap();

    let mut stray = Message::empty("Set Directory");
    stray.set_error("ignored").unwrap();
    h.sequencer
        .handle_event(TransportEvent::MessageReceived(stray));

    assert_eq!(h.sequencer.state(), SequencerState::Paused);
    assert_eq!(h.sequencer.cursor(), 0);
    let cause = h.events().into_iter().find_map(|event| match event {
        SequencerEvent::SequenceErrored { error, .. } => Some(error),
        _ => None,
    });
    let error = cause.unwrap();
    assert_eq!(error.cause, ErrorCause::ProtocolMismatch);
    assert_eq!(error.message, "Communication Error: Incorrect Message Returned");
}

#[test]
fn remote_error_reports_original_text() {
    let remote = SimulatedRemote::default().with_failure("Set Directory", "Disk is full");
    let mut h = Harness::new(Some(remote));
    h.sequencer.load(vec![directory("D1")]).unwrap();
    h.sequencer.run().unwrap();
    h.pump();

    let status = h.sequencer.status();
    assert_eq!(status.state, SequencerState::Paused);
    assert_eq!(status.last_error.as_deref(), Some("remote_error: Disk is full"));
}

#[test]
fn errors_without_pause_continue_the_run() {
    let remote = SimulatedRemote::default().with_failure("Recenter Piezo", "No piezo");
    let mut h = Harness::new(Some(remote));
    h.sequencer
        .load(vec![
            Descriptor::new()
                .with("recenter", true)
                .with("pause_after_error", false),
            directory("D1"),
        ])
        .unwrap();
    h.sequencer.run().unwrap();
    h.pump();

    assert_eq!(h.sequencer.state(), SequencerState::Idle);
    assert_eq!(h.sent_types(), vec!["Recenter Piezo", "Set Directory"]);
    assert!(h.sequencer.status().last_error.is_some());
}

#[test]
fn abort_cancels_movie_and_resets() {
    let mut h = Harness::new(None);
    h.sequencer
        .load(vec![movie("m1", 100, 0), directory("D1")])
        .unwrap();
    h.sequencer.run().unwrap();
    assert_eq!(h.sequencer.status().in_flight, Some(0));

    h.sequencer.abort().unwrap();
    assert_eq!(h.sequencer.state(), SequencerState::Idle);
    assert_eq!(h.sequencer.cursor(), 0);
    assert_eq!(h.sent_types(), vec!["Take Movie", "Abort Movie"]);
    assert_eq!(h.sequencer.action(0).unwrap().state(), ActionState::Idle);
    assert_eq!(h.events().last(), Some(&SequencerEvent::SequenceAborted));

    // Late reply to the aborted movie is ignored.
    h.ack_last();
    assert_eq!(h.sequencer.state(), SequencerState::Idle);
    h.sequencer.abort().unwrap();
}

#[test]
fn disconnect_errors_the_action_and_returns_to_idle() {
    let mut h = Harness::new(None);
    h.sequencer
        .load(vec![directory("D1"), directory("D2")])
        .unwrap();
    h.sequencer.run().unwrap();
    h.sequencer.handle_event(TransportEvent::Disconnected);

    assert_eq!(h.sequencer.state(), SequencerState::Idle);
    assert_eq!(h.sequencer.cursor(), 0);
    let events = h.events();
    assert!(events.iter().any(|event| matches!(
        event,
        SequencerEvent::SequenceErrored { index: 0, error, .. }
            if error.cause == ErrorCause::TransportDisconnect
    )));
    assert_eq!(events.last(), Some(&SequencerEvent::SequenceAborted));
    assert_eq!(h.sent.lock().len(), 1);
}

#[test]
fn test_mode_calibrates_identical_commands_once() {
    let mut h = Harness::new(Some(SimulatedRemote::default()));
    h.sequencer.set_test_mode(true).unwrap();
    let estimate = h
        .sequencer
        .load(vec![
            directory("D1"),
            movie("m1", 573, 0),
            directory("D1"),
            movie("m1", 573, 0),
            Descriptor::new().with("delay", 1500),
        ])
        .unwrap();
    assert_eq!(estimate.duration_s, 0.0);

    h.sequencer.run().unwrap();
    h.pump();
    assert_eq!(h.sequencer.state(), SequencerState::Idle);
    assert_eq!(h.sent_types(), vec!["Set Directory", "Take Movie"]);
    assert!(h.sent.lock().iter().all(Message::is_test));

    let movie_estimate = h.sequencer.action(3).unwrap().duration_s();
    assert!((movie_estimate - 10.0).abs() < 1e-9);
    assert_eq!(h.sequencer.action(4).unwrap().duration_s(), 1.5);

    let estimate = h.sequencer.estimate();
    assert_eq!(estimate.actions, 5);
    assert!((estimate.duration_s - (0.1 + 10.0 + 0.1 + 10.0 + 1.5)).abs() < 1e-9);
    assert!(estimate.disk_usage_kb > 0.0);
}

#[test]
fn test_mode_failures_mark_actions_invalid_and_normal_runs_skip_them() {
    let remote = SimulatedRemote::default().with_failure("Recenter Piezo", "No piezo");
    let mut h = Harness::new(Some(remote));
    h.sequencer.set_test_mode(true).unwrap();
    h.sequencer
        .load(vec![
            Descriptor::new().with("recenter", true),
            directory("D1"),
            Descriptor::new().with("recenter", true),
        ])
        .unwrap();

    h.sequencer.run().unwrap();
    h.pump();
    assert_eq!(h.sequencer.state(), SequencerState::Idle);
    assert_eq!(h.sequencer.status().invalid, vec![0, 2]);
    assert!(h.events().iter().any(|event| matches!(
        event,
        SequencerEvent::ActionInvalid { index: 0, error, .. } if error.message == "No piezo"
    )));

    h.sequencer.set_test_mode(false).unwrap();
    h.sent.lock().clear();
    h.sequencer.run().unwrap();
    h.pump();
    assert_eq!(h.sent_types(), vec!["Set Directory"]);
    assert_eq!(h.sequencer.estimate().actions, 1);

    h.sequencer.set_all_valid();
    assert!(h.sequencer.status().invalid.is_empty());
}

#[test]
fn test_mode_does_not_confirm_targets() {
    let mut h = Harness::new(Some(SimulatedRemote::default()));
    h.sequencer.set_test_mode(true).unwrap();
    h.sequencer.load(vec![stage(1.0, 2.0)]).unwrap();
    h.sequencer.run().unwrap();
    h.pump();
    assert!(h.sequencer.tracker().is_empty());

    h.sequencer.set_test_mode(false).unwrap();
    h.sequencer.run().unwrap();
    h.pump();
    assert_eq!(h.sent.lock().len(), 2);
    assert_eq!(h.sequencer.tracker().len(), 1);
}

#[test]
fn lost_test_message_invalidates_the_action() {
    let remote = SimulatedRemote::default().with_silent("Set Lock Target");
    let mut h = Harness::new(Some(remote));
    h.sequencer.set_test_mode(true).unwrap();
    h.sequencer
        .load(vec![
            Descriptor::new().with("lock_target", 1.5),
            directory("D1"),
        ])
        .unwrap();
    h.sequencer.run().unwrap();
    h.pump();

    let deadline = h.sequencer.next_deadline().unwrap();
    h.sequencer.poll_timers(deadline);
    h.pump();

    assert_eq!(h.sequencer.state(), SequencerState::Idle);
    let error = h
        .events()
        .into_iter()
        .find_map(|event| match event {
            SequencerEvent::ActionInvalid { error, .. } => Some(error),
            _ => None,
        })
        .unwrap();
    assert_eq!(error.cause, ErrorCause::LostMessage);
    assert_eq!(
        error.message,
        "A message of type Set Lock Target was never received.\nPerhaps a module is missing?"
    );
    assert!(!h.sequencer.action(0).unwrap().is_valid());
}

#[test]
fn focus_warnings_accumulate_until_the_limit() {
    let mut config = DaveConfig::default();
    config.sequencer.max_warnings = 1;
    let remote = SimulatedRemote {
        focus_locked: false,
        ..SimulatedRemote::default()
    };
    let mut h = Harness::with_config(Some(remote), config);
    h.sequencer
        .load(vec![
            Descriptor::new().with("check_focus", true),
            Descriptor::new().with("clear_warnings", true),
            Descriptor::new().with("check_focus", true),
            Descriptor::new().with("check_focus", true),
            directory("D1"),
        ])
        .unwrap();
    h.sequencer.run().unwrap();
    h.pump();

    assert_eq!(h.sequencer.state(), SequencerState::Paused);
    assert_eq!(h.sequencer.cursor(), 4);
    assert_eq!(h.sequencer.warnings().len(), 2);
    assert_eq!(h.sequencer.warnings()[0].index, 2);
    assert_eq!(h.sequencer.warnings()[0].message, "The focus is not locked.");

    let events = h.events();
    let warnings = events
        .iter()
        .filter(|event| matches!(event, SequencerEvent::Warning(_)))
        .count();
    assert_eq!(warnings, 3);
    match events.last() {
        Some(SequencerEvent::SequencePaused {
            reason: PauseReason::TooManyWarnings { count, summary },
        }) => {
            assert_eq!(*count, 2);
            assert!(summary.starts_with("Warnings summary:"));
            assert_eq!(summary.matches("The focus is not locked.").count(), 2);
            assert!(summary.contains("action 2 "));
            assert!(summary.contains("action 3 "));
        }
        other => panic!("unexpected last event {:?}", other),
    }
}

#[test]
fn warning_limit_pauses_only_once() {
    let mut config = DaveConfig::default();
    config.sequencer.max_warnings = 0;
    let remote = SimulatedRemote {
        focus_locked: false,
        ..SimulatedRemote::default()
    };
    let mut h = Harness::with_config(Some(remote), config);
    h.sequencer
        .load(vec![
            Descriptor::new()
                .with("check_focus", true)
                .with("label", "focus before cell 1"),
            directory("D1"),
            directory("D2"),
        ])
        .unwrap();
    h.sequencer.run().unwrap();
    h.pump();

    assert_eq!(h.sequencer.state(), SequencerState::Paused);
    assert_eq!(h.sequencer.cursor(), 1);
    let summary = h
        .events()
        .into_iter()
        .find_map(|event| match event {
            SequencerEvent::SequencePaused {
                reason: PauseReason::TooManyWarnings { count: 1, summary },
            } => Some(summary),
            _ => None,
        })
        .unwrap();
    assert!(summary.contains("action 0 focus before cell 1: The focus is not locked."));

    h.sequencer.resume().unwrap();
    h.pump();
    assert_eq!(h.sequencer.state(), SequencerState::Idle);
    assert_eq!(
        h.sent_types(),
        vec!["Check Focus Lock", "Set Directory", "Set Directory"]
    );
    let pauses = h
        .events()
        .into_iter()
        .filter(|event| matches!(event, SequencerEvent::SequencePaused { .. }))
        .count();
    assert_eq!(pauses, 0);
}

#[test]
fn math_progression_replaces_a_confirmed_file() {
    let mut h = Harness::new(Some(SimulatedRemote::default()));
    let file = Descriptor::new().with("type", "file").with("filename", "a.xml");
    h.sequencer
        .load(vec![
            file.clone(),
            Descriptor::new().with(
                "progression",
                serde_json::json!({"type": "math", "channels": [[1, 0.2, 50, 0.1]]}),
            ),
            file,
        ])
        .unwrap();
    h.sequencer.run().unwrap();
    h.pump();

    assert_eq!(h.sequencer.state(), SequencerState::Idle);
    assert_eq!(h.sent.lock().len(), 3);
    assert_eq!(
        h.last_sent().data("filename"),
        Some(&serde_json::json!("a.xml"))
    );
}

#[test]
fn movie_parameters_are_not_mistaken_for_confirmed_ones() {
    let mut h = Harness::new(Some(SimulatedRemote::default()));
    h.sequencer
        .load(vec![
            Descriptor::new().with("parameters", "A"),
            Descriptor::new()
                .with("name", "m1")
                .with("length", 10)
                .with("parameters", "B"),
            Descriptor::new().with("parameters", "A"),
        ])
        .unwrap();
    h.sequencer.run().unwrap();
    h.pump();

    assert_eq!(h.sequencer.state(), SequencerState::Idle);
    assert_eq!(
        h.sent_types(),
        vec!["Set Parameters", "Take Movie", "Set Parameters"]
    );
    assert_eq!(
        h.sequencer.tracker().last_confirmed("Set Parameters"),
        Some(&serde_json::json!("A"))
    );
}

#[test]
fn remaining_time_counts_from_the_cursor() {
    let mut h = Harness::new(Some(SimulatedRemote::default()));
    h.sequencer.set_test_mode(true).unwrap();
    h.sequencer
        .load(vec![
            directory("D1"),
            movie("m1", 573, 0),
            Descriptor::new().with("pause", true),
            movie("m2", 573, 0),
        ])
        .unwrap();
    assert_eq!(h.sequencer.remaining_time(), 0.0);

    h.sequencer.run().unwrap();
    h.pump();
    assert_eq!(h.sequencer.state(), SequencerState::Idle);
    assert!((h.sequencer.remaining_time() - 20.1).abs() < 1e-9);

    h.sequencer.set_test_mode(false).unwrap();
    h.sequencer.run().unwrap();
    h.pump();
    assert_eq!(h.sequencer.state(), SequencerState::Paused);
    assert_eq!(h.sequencer.cursor(), 3);
    assert!((h.sequencer.remaining_time() - 10.0).abs() < 1e-9);
    assert!((h.sequencer.estimate().duration_s - 20.1).abs() < 1e-9);
}

#[test]
fn only_one_action_is_in_flight() {
    let mut h = Harness::new(None);
    h.sequencer
        .load(vec![directory("D1"), directory("D2"), directory("D3")])
        .unwrap();
    h.sequencer.run().unwrap();
    for expected in 1..=3 {
        assert_eq!(h.sent.lock().len(), expected);
        h.ack_last();
    }
    assert_eq!(h.sequencer.state(), SequencerState::Idle);
}

#[test]
fn commands_are_rejected_in_the_wrong_state() {
    let mut h = Harness::new(None);
    h.sequencer.load(vec![directory("D1")]).unwrap();
    assert!(matches!(
        h.sequencer.pause(),
        Err(DaveError::InvalidState { .. })
    ));
    h.sequencer.run().unwrap();
    assert!(matches!(
        h.sequencer.run(),
        Err(DaveError::InvalidState { .. })
    ));
    assert!(matches!(
        h.sequencer.load(vec![directory("D2")]),
        Err(DaveError::InvalidState { .. })
    ));
    assert!(matches!(
        h.sequencer.set_test_mode(true),
        Err(DaveError::InvalidState { .. })
    ));
}

#[test]
fn unaccepted_descriptor_names_its_index() {
    let mut h = Harness::new(None);
    let err = h
        .sequencer
        .load(vec![directory("D1"), Descriptor::new().with("laser", 5)])
        .unwrap_err();
    assert!(matches!(err, DaveError::Descriptor { index: 1, .. }));
    assert!(h.sequencer.is_empty());
}

#[test]
fn disconnected_transport_is_reconnected_on_run() {
    let (transport, mut transport_events) = MockTransport::new();
    let sent = transport.sent_log();
    let transport = transport
        .disconnected()
        .with_responder(SimulatedRemote::default().into_responder());
    let mut sequencer = Sequencer::new(Box::new(transport), &DaveConfig::default());
    sequencer.load(vec![directory("D1")]).unwrap();
    sequencer.run().unwrap();
    while let Ok(event) = transport_events.try_recv() {
        sequencer.handle_event(event);
    }
    assert_eq!(sent.lock().len(), 1);
    assert_eq!(sequencer.state(), SequencerState::Idle);
}
