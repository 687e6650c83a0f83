//! The sequencing engine.
//!
//! [`Sequencer`] owns the ordered queue of Actions and drives them strictly one
//! at a time over a single [`Transport`]. It is synchronous and event driven:
//! the host feeds it [`TransportEvent`]s and timer ticks, and it advances only
//! when the Action in flight resolves. [`SequencerActor`] wraps it in a tokio task
//! for async hosts.
//!
//! # Run semantics
//!
//! - `pause()` is honoured at the next Action boundary; an Action in flight is
//!   never interrupted.
//! - An Action asking to pause after completion, or an error with the default
//!   pause-after-error policy, stops the run with the queue intact. The errored
//!   Action is rebuilt so `resume()` retries it.
//! - `abort()` cancels the Action in flight and resets the cursor to the start.
//!   A transport disconnect does the same after reporting the error. There is
//!   no automatic reconnection or resend.
//! - In test mode every message is a dry run. Identical commands are sent once,
//!   failures mark Actions invalid instead of pausing, and invalid Actions are
//!   skipped in later normal runs.
//!
//! # Example
//!
//! ```rust,ignore
//! let (transport, mut events) = MockTransport::new();
//! let mut sequencer = Sequencer::new(Box::new(transport), &DaveConfig::default());
//! sequencer.load(descriptors)?;
//! sequencer.run()?;
//! while let Ok(event) = events.try_recv() {
//!     sequencer.handle_event(event);
//! }
//! ```

pub mod actor;
pub mod events;
pub mod state;

pub use actor::{SequencerActor, SequencerCommand, SequencerHandle};
pub use events::{warnings_summary, SequencerEvent, Warning};
pub use state::{PauseReason, RunEstimate, SequencerState, SequencerStatus};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::{Action, ActionKind, ActionState, Resolution};
use crate::config::{DaveConfig, SequencerConfig, TimingConfig};
use crate::descriptor::{Descriptor, SequenceFile};
use crate::error::{AppResult, DaveError};
use crate::registry;
use crate::transport::{ReplyRoute, Transport, TransportEvent};
use crate::validation::{Calibration, CalibrationCache, SendDecision, ValidationTracker};

struct QueueEntry {
    descriptor: Descriptor,
    action: Action,
}

enum Flow {
    Continue,
    Halt,
}

enum Step {
    InFlight,
    Calibrated,
    Resolved { resolution: Resolution, skipped: bool },
    Halted,
}

/// Serial Action runner.
pub struct Sequencer {
    transport: Box<dyn Transport>,
    settings: SequencerConfig,
    timing: TimingConfig,
    name: String,
    entries: Vec<QueueEntry>,
    cursor: usize,
    in_flight: Option<usize>,
    state: SequencerState,
    pause_requested: bool,
    test_mode: bool,
    route: ReplyRoute,
    tracker: ValidationTracker,
    calibrations: CalibrationCache,
    warnings: Vec<Warning>,
    completed: RunEstimate,
    last_error: Option<String>,
    run_id: Option<Uuid>,
    events: broadcast::Sender<SequencerEvent>,
}

impl Sequencer {
    /// Create an idle Sequencer with an empty queue.
    pub fn new(transport: Box<dyn Transport>, config: &DaveConfig) -> Self {
        let (events, _) = broadcast::channel(config.sequencer.event_capacity.max(1));
        Self {
            transport,
            settings: config.sequencer.clone(),
            timing: config.timing,
            name: "sequence".to_string(),
            entries: Vec::new(),
            cursor: 0,
            in_flight: None,
            state: SequencerState::Idle,
            pause_requested: false,
            test_mode: config.sequencer.test_mode,
            route: ReplyRoute::default(),
            tracker: ValidationTracker::new(),
            calibrations: CalibrationCache::new(),
            warnings: Vec::new(),
            completed: RunEstimate::default(),
            last_error: None,
            run_id: None,
            events,
        }
    }

    /// Build and queue Actions for `descriptors`.
    ///
    /// Loading is atomic: if any descriptor is rejected the previous queue is kept.
    ///
    /// # Returns
    ///
    /// The estimate for the new queue, using whatever calibration the built
    /// Actions carry (0 for uncalibrated ones).
    pub fn load(&mut self, descriptors: Vec<Descriptor>) -> AppResult<RunEstimate> {
        if !self.state.can_run() {
            return Err(DaveError::invalid_state("load", self.state));
        }
        if descriptors.is_empty() {
            return Err(DaveError::EmptySequence);
        }
        let actions = registry::build_all(&descriptors, &self.timing)?;
        self.entries = descriptors
            .into_iter()
            .zip(actions)
            .map(|(descriptor, action)| QueueEntry { descriptor, action })
            .collect();
        self.cursor = 0;
        self.in_flight = None;
        self.warnings.clear();
        self.calibrations.clear();
        self.completed = RunEstimate::default();
        self.last_error = None;

        let estimate = self.estimate();
        info!(
            name = %self.name,
            actions = self.entries.len(),
            "Sequence loaded"
        );
        Ok(estimate)
    }

    /// Load a parsed sequence file and adopt its name.
    pub fn load_file(&mut self, file: SequenceFile) -> AppResult<RunEstimate> {
        if !self.state.can_run() {
            return Err(DaveError::invalid_state("load", self.state));
        }
        self.name = file.name;
        self.load(file.descriptors)
    }

    /// Start driving the queue from the first Action.
    pub fn run(&mut self) -> AppResult<()> {
        if !self.state.can_run() {
            return Err(DaveError::invalid_state("run", self.state));
        }
        if self.entries.is_empty() {
            return Err(DaveError::EmptySequence);
        }
        if !self.transport.is_connected() {
            self.transport.connect()?;
        }
        if self.test_mode {
            self.calibrations.clear();
            for entry in &mut self.entries {
                entry.action.set_valid(true);
            }
        }

        let run_id = Uuid::new_v4();
        self.run_id = Some(run_id);
        self.cursor = 0;
        self.completed = RunEstimate::default();
        self.pause_requested = false;
        self.state = SequencerState::Running;
        info!(
            %run_id,
            name = %self.name,
            test_mode = self.test_mode,
            actions = self.entries.len(),
            "Sequence started"
        );
        self.advance();
        Ok(())
    }

    /// Request a pause at the next Action boundary.
    pub fn pause(&mut self) -> AppResult<()> {
        if !self.state.can_pause() {
            return Err(DaveError::invalid_state("pause", self.state));
        }
        info!(cursor = self.cursor, "Pause requested");
        self.pause_requested = true;
        Ok(())
    }

    /// Continue a paused run from the cursor.
    pub fn resume(&mut self) -> AppResult<()> {
        if !self.state.can_resume() {
            return Err(DaveError::invalid_state("resume", self.state));
        }
        info!(cursor = self.cursor, "Sequence resumed");
        self.state = SequencerState::Running;
        self.emit(SequencerEvent::SequenceResumed);
        self.advance();
        Ok(())
    }

    /// Abort the run: cancel the Action in flight and reset to the first Action.
    ///
    /// Aborting an idle Sequencer does nothing.
    pub fn abort(&mut self) -> AppResult<()> {
        if self.state == SequencerState::Idle {
            debug!("Nothing to abort");
            return Ok(());
        }
        if let Some(index) = self.in_flight.take() {
            self.route.unsubscribe();
            self.entries[index]
                .action
                .abort(Some(self.transport.as_mut()));
            if !self.test_mode {
                self.tracker.forget_side_effects(&self.entries[index].action);
            }
            info!(index, "In-flight action aborted");
        }
        self.reset_queue();
        self.state = SequencerState::Idle;
        info!("Sequence aborted");
        self.emit(SequencerEvent::SequenceAborted);
        Ok(())
    }

    /// Feed one inbound transport event.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::MessageReceived(message) => {
                let (Some(index), Some(owner)) = (self.in_flight, self.route.owner()) else {
                    debug!(message = %message, "Ignoring unsolicited message");
                    return;
                };
                debug!(message = %message, subscriber = %owner, "Reply received");
                if let Some(resolution) = self.entries[index].action.handle_reply(message) {
                    self.resolve(index, resolution);
                }
            }
            TransportEvent::Disconnected => self.handle_disconnect(),
        }
    }

    /// Fire any Action timer whose deadline is at or before `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        let Some(index) = self.in_flight else {
            return;
        };
        if let Some(resolution) = self.entries[index].action.on_timer(now) {
            self.resolve(index, resolution);
        }
    }

    /// Earliest timer deadline of the Action in flight.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight
            .and_then(|index| self.entries[index].action.next_deadline())
    }

    /// Switch dry-run mode. Only allowed while idle.
    pub fn set_test_mode(&mut self, enabled: bool) -> AppResult<()> {
        if !self.state.can_run() {
            return Err(DaveError::invalid_state("change test mode", self.state));
        }
        info!(enabled, "Test mode changed");
        self.test_mode = enabled;
        Ok(())
    }

    /// Mark every Action valid again, e.g. after the remote setup changed.
    pub fn set_all_valid(&mut self) {
        for entry in &mut self.entries {
            entry.action.set_valid(true);
        }
    }

    /// Estimate for the whole queue, counting valid Actions only.
    pub fn estimate(&self) -> RunEstimate {
        self.estimate_from(0)
    }

    /// Estimated seconds left, from the cursor on.
    pub fn remaining_time(&self) -> f64 {
        self.estimate_from(self.cursor).duration_s
    }

    fn estimate_from(&self, start: usize) -> RunEstimate {
        let mut estimate = RunEstimate::default();
        for entry in self.entries.iter().skip(start) {
            if entry.action.is_valid() {
                estimate.add(entry.action.duration_s(), entry.action.disk_usage_kb());
            }
        }
        estimate
    }

    /// Snapshot for display.
    pub fn status(&self) -> SequencerStatus {
        SequencerStatus {
            name: self.name.clone(),
            state: self.state,
            test_mode: self.test_mode,
            cursor: self.cursor,
            total: self.entries.len(),
            in_flight: self.in_flight,
            current: self
                .entries
                .get(self.cursor)
                .map(|entry| entry.action.describe()),
            invalid: self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| !entry.action.is_valid())
                .map(|(index, _)| index)
                .collect(),
            warnings: self.warnings.len(),
            last_error: self.last_error.clone(),
            completed: self.completed,
            run_id: self.run_id,
        }
    }

    /// Receive lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SequencerEvent> {
        self.events.subscribe()
    }

    /// Lifecycle state.
    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Index of the next Action to run.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Queue length.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No Actions queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dry-run mode.
    pub fn is_test_mode(&self) -> bool {
        self.test_mode
    }

    /// Action at `index`.
    pub fn action(&self, index: usize) -> Option<&Action> {
        self.entries.get(index).map(|entry| &entry.action)
    }

    /// Descriptor at `index`.
    pub fn descriptor(&self, index: usize) -> Option<&Descriptor> {
        self.entries.get(index).map(|entry| &entry.descriptor)
    }

    /// Recorded warnings.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Forget recorded warnings.
    pub fn clear_warnings(&mut self) {
        self.warnings.clear();
    }

    /// Redundant-call tracker.
    pub fn tracker(&self) -> &ValidationTracker {
        &self.tracker
    }

    /// Mutable access to the tracker, to invalidate entries after external changes.
    pub fn tracker_mut(&mut self) -> &mut ValidationTracker {
        &mut self.tracker
    }

    // =========================================================================
    // Driving
    // =========================================================================

    fn advance(&mut self) {
        while self.state == SequencerState::Running && self.in_flight.is_none() {
            if !self.test_mode {
                while self.cursor < self.entries.len()
                    && !self.entries[self.cursor].action.is_valid()
                {
                    warn!(index = self.cursor, "Skipping invalid action");
                    self.cursor += 1;
                }
            }
            if self.cursor >= self.entries.len() {
                self.finish();
                return;
            }
            if self.pause_requested {
                self.halt(PauseReason::Requested);
                return;
            }

            let index = self.cursor;
            match self.start_entry(index) {
                Step::InFlight | Step::Halted => return,
                Step::Calibrated => self.cursor = index + 1,
                Step::Resolved {
                    resolution,
                    skipped,
                } => {
                    if let Flow::Halt = self.settle(index, resolution, skipped) {
                        return;
                    }
                }
            }
        }
    }

    fn start_entry(&mut self, index: usize) -> Step {
        if self.entries[index].action.state() != ActionState::Idle {
            self.entries[index].action = self.entries[index].action.rebuild();
        }
        let descriptor = self.entries[index].descriptor.clone();
        let description = self.entries[index].action.describe();

        if self.test_mode {
            let key = self.entries[index].action.calibration_key();
            if let Some(calibration) = self.calibrations.get(&key).copied() {
                let action = &mut self.entries[index].action;
                action.set_valid(calibration.valid);
                action.set_estimates(calibration.duration_s, calibration.disk_usage_kb);
                if calibration.valid {
                    debug!(index, action = %description, "Reusing calibration");
                    self.emit(SequencerEvent::ActionCompleted {
                        index,
                        descriptor,
                        duration_s: calibration.duration_s,
                        disk_usage_kb: calibration.disk_usage_kb,
                        skipped: true,
                    });
                } else {
                    warn!(
                        index,
                        action = %description,
                        "Identical command already failed, marked invalid"
                    );
                }
                return Step::Calibrated;
            }
        }

        self.emit(SequencerEvent::ActionStarted {
            index,
            descriptor,
            description: description.clone(),
        });

        if !self.test_mode
            && self.settings.skip_redundant
            && self.tracker.before_send(&self.entries[index].action) == SendDecision::Skip
        {
            info!(index, action = %description, "Target already confirmed, skipping");
            if let Some(resolution) = self.entries[index].action.skip() {
                return Step::Resolved {
                    resolution,
                    skipped: true,
                };
            }
        }

        info!(index, action = %description, test_mode = self.test_mode, "Action started");
        let action = &mut self.entries[index].action;
        if !action.is_local() {
            let id = action.message().id();
            if let Err(e) = self.route.subscribe(id) {
                error!(error = %e, "Reply route still held, releasing it");
                self.route.unsubscribe();
                if let Err(e) = self.route.subscribe(id) {
                    error!(error = %e, "Could not claim reply route");
                }
            }
        }

        match action.start(self.transport.as_mut(), self.test_mode, Instant::now()) {
            Ok(None) => {
                self.in_flight = Some(index);
                Step::InFlight
            }
            Ok(Some(resolution)) => {
                self.route.unsubscribe();
                Step::Resolved {
                    resolution,
                    skipped: false,
                }
            }
            Err(e) => {
                self.route.unsubscribe();
                error!(index, error = %e, "Action could not be started");
                self.last_error = Some(e.to_string());
                self.cursor = index;
                self.halt(PauseReason::Error {
                    index,
                    message: e.to_string(),
                });
                Step::Halted
            }
        }
    }

    fn resolve(&mut self, index: usize, resolution: Resolution) {
        self.in_flight = None;
        self.route.unsubscribe();
        if let Flow::Continue = self.settle(index, resolution, false) {
            self.advance();
        }
    }

    fn settle(&mut self, index: usize, resolution: Resolution, skipped: bool) -> Flow {
        let descriptor = self.entries[index].descriptor.clone();
        let description = self.entries[index].action.describe();

        match resolution {
            Resolution::Complete | Resolution::Warning(_) => {
                let action = &self.entries[index].action;
                let duration_s = action.duration_s();
                let disk_usage_kb = action.disk_usage_kb();
                let should_pause = action.should_pause();
                let clears_warnings = matches!(action.kind(), ActionKind::ClearWarnings);

                if self.test_mode {
                    let key = action.calibration_key();
                    self.share_calibration(
                        key,
                        Calibration {
                            valid: true,
                            duration_s,
                            disk_usage_kb,
                        },
                    );
                } else if !skipped {
                    self.tracker.record_confirmed(&self.entries[index].action);
                }
                self.entries[index].action.clean_up();
                self.completed.add(duration_s, disk_usage_kb);

                info!(
                    index,
                    action = %description,
                    duration_s,
                    disk_usage_kb,
                    skipped,
                    "Action completed"
                );
                self.emit(SequencerEvent::ActionCompleted {
                    index,
                    descriptor: descriptor.clone(),
                    duration_s,
                    disk_usage_kb,
                    skipped,
                });

                if clears_warnings {
                    info!(cleared = self.warnings.len(), "Warnings cleared");
                    self.warnings.clear();
                }
                let warned = match resolution {
                    Resolution::Warning(message) => {
                        self.record_warning(index, descriptor, message);
                        true
                    }
                    _ => false,
                };

                self.cursor = index + 1;
                // Only the warning that crosses the limit pauses.
                if warned && self.warnings.len() == self.settings.max_warnings + 1 {
                    self.halt(PauseReason::TooManyWarnings {
                        count: self.warnings.len(),
                        summary: warnings_summary(&self.warnings),
                    });
                    return Flow::Halt;
                }
                if should_pause && !self.test_mode {
                    self.halt(PauseReason::AfterAction { index });
                    return Flow::Halt;
                }
                Flow::Continue
            }
            Resolution::Error(error) => {
                if self.test_mode {
                    let key = self.entries[index].action.calibration_key();
                    self.share_calibration(key, Calibration::invalid());
                    warn!(
                        index,
                        action = %description,
                        cause = %error.cause,
                        error = %error.message,
                        "Action invalid"
                    );
                    self.emit(SequencerEvent::ActionInvalid {
                        index,
                        descriptor,
                        error,
                    });
                    self.cursor = index + 1;
                    return Flow::Continue;
                }

                let should_pause = self.entries[index].action.should_pause();
                error!(
                    index,
                    action = %description,
                    cause = %error.cause,
                    error = %error.message,
                    "Action failed"
                );
                self.tracker.forget_side_effects(&self.entries[index].action);
                self.last_error = Some(error.to_string());
                self.emit(SequencerEvent::SequenceErrored {
                    index,
                    descriptor,
                    error: error.clone(),
                });
                self.entries[index].action = self.entries[index].action.rebuild();

                if should_pause {
                    self.cursor = index;
                    self.halt(PauseReason::Error {
                        index,
                        message: error.message,
                    });
                    Flow::Halt
                } else {
                    self.cursor = index + 1;
                    Flow::Continue
                }
            }
        }
    }

    fn share_calibration(&mut self, key: String, calibration: Calibration) {
        for entry in &mut self.entries {
            if entry.action.calibration_key() == key {
                entry.action.set_valid(calibration.valid);
                entry
                    .action
                    .set_estimates(calibration.duration_s, calibration.disk_usage_kb);
            }
        }
        self.calibrations.insert(key, calibration);
    }

    fn record_warning(&mut self, index: usize, descriptor: Descriptor, message: String) {
        warn!(index, warning = %message, "Action warning");
        let warning = Warning {
            index,
            descriptor,
            message,
            at: Utc::now(),
        };
        self.warnings.push(warning.clone());
        self.emit(SequencerEvent::Warning(warning));
    }

    fn halt(&mut self, reason: PauseReason) {
        self.pause_requested = false;
        self.state = SequencerState::Paused;
        info!(reason = %reason, cursor = self.cursor, "Sequence paused");
        self.emit(SequencerEvent::SequencePaused { reason });
    }

    fn finish(&mut self) {
        self.reset_queue();
        self.state = SequencerState::Idle;
        info!(
            name = %self.name,
            duration_s = self.completed.duration_s,
            disk_usage_kb = self.completed.disk_usage_kb,
            "Sequence finished"
        );
        self.emit(SequencerEvent::SequenceFinished);
    }

    fn handle_disconnect(&mut self) {
        warn!(state = %self.state, "Transport disconnected");
        if self.state == SequencerState::Idle {
            return;
        }
        if let Some(index) = self.in_flight.take() {
            self.route.unsubscribe();
            if let Some(Resolution::Error(error)) = self.entries[index].action.handle_disconnect() {
                error!(index, cause = %error.cause, error = %error.message, "Action failed");
                self.last_error = Some(error.to_string());
                let descriptor = self.entries[index].descriptor.clone();
                self.emit(SequencerEvent::SequenceErrored {
                    index,
                    descriptor,
                    error,
                });
            }
        }
        self.reset_queue();
        self.state = SequencerState::Idle;
        self.emit(SequencerEvent::SequenceAborted);
    }

    fn reset_queue(&mut self) {
        for entry in &mut self.entries {
            entry.action = entry.action.rebuild();
        }
        self.cursor = 0;
        self.in_flight = None;
        self.pause_requested = false;
    }

    fn emit(&self, event: SequencerEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockTransport, SimulatedRemote};
    use tokio::sync::mpsc;

    fn sequencer_with(
        remote: Option<SimulatedRemote>,
    ) -> (Sequencer, mpsc::UnboundedReceiver<TransportEvent>) {
        let (transport, events) = MockTransport::new();
        let transport = match remote {
            Some(remote) => transport.with_responder(remote.into_responder()),
            None => transport,
        };
        (
            Sequencer::new(Box::new(transport), &DaveConfig::default()),
            events,
        )
    }

    fn pump(sequencer: &mut Sequencer, events: &mut mpsc::UnboundedReceiver<TransportEvent>) {
        while let Ok(event) = events.try_recv() {
            sequencer.handle_event(event);
        }
    }

    #[test]
    fn run_requires_idle_and_a_queue() {
        let (mut sequencer, _events) = sequencer_with(None);
        assert!(matches!(sequencer.run(), Err(DaveError::EmptySequence)));
        assert!(matches!(
            sequencer.resume(),
            Err(DaveError::InvalidState { .. })
        ));
        assert!(sequencer.abort().is_ok());
    }

    #[test]
    fn load_rejects_empty_and_keeps_previous_queue() {
        let (mut sequencer, _events) = sequencer_with(None);
        assert!(matches!(
            sequencer.load(Vec::new()),
            Err(DaveError::EmptySequence)
        ));
        sequencer
            .load(vec![Descriptor::new().with("directory", "D1")])
            .unwrap();
        assert!(sequencer
            .load(vec![Descriptor::new().with("unknown", 1)])
            .is_err());
        assert_eq!(sequencer.len(), 1);
    }

    #[test]
    fn runs_to_completion_and_resets() {
        let (mut sequencer, mut events) = sequencer_with(Some(SimulatedRemote::default()));
        let mut observer = sequencer.subscribe();
        sequencer
            .load(vec![
                Descriptor::new().with("directory", "D1"),
                Descriptor::new().with("recenter", true),
            ])
            .unwrap();
        sequencer.run().unwrap();
        assert_eq!(sequencer.status().in_flight, Some(0));

        pump(&mut sequencer, &mut events);
        assert_eq!(sequencer.state(), SequencerState::Idle);
        assert_eq!(sequencer.cursor(), 0);
        assert_eq!(sequencer.action(1).unwrap().state(), ActionState::Idle);

        let mut finished = false;
        while let Ok(event) = observer.try_recv() {
            finished |= event == SequencerEvent::SequenceFinished;
        }
        assert!(finished);
    }

    #[test]
    #[tracing_test::traced_test]
    fn lifecycle_is_logged() {
        let (mut sequencer, mut events) = sequencer_with(Some(SimulatedRemote::default()));
        sequencer
            .load(vec![Descriptor::new().with("lock_target", 0.5)])
            .unwrap();
        sequencer.run().unwrap();
        pump(&mut sequencer, &mut events);

        assert!(logs_contain("Sequence started"));
        assert!(logs_contain("Action completed"));
        assert!(logs_contain("Sequence finished"));
    }

    #[test]
    fn replies_without_subscriber_are_ignored() {
        let (mut sequencer, _events) = sequencer_with(None);
        sequencer.handle_event(TransportEvent::MessageReceived(
            crate::message::Message::empty("Move Stage"),
        ));
        assert_eq!(sequencer.state(), SequencerState::Idle);
    }
}
