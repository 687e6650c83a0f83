//! The Action state machine.
//!
//! An [`Action`] is one step of a sequence. It owns its request [`Message`], the
//! timers it arms, and the calibration figures learned from test round trips.
//!
//! # State Machine
//!
//! ```text
//! Idle ──start──> Sent ──matching reply──> Complete
//!   │               │
//!   │               ├──mismatched id / error flag / threshold / lost / disconnect──> Error
//!   │               │
//!   └─────abort─────┴──abort──> Aborted
//! ```
//!
//! Every resolution path stops both timers, so a resolved Action never fires.
//! Terminal Actions are never restarted; [`Action::rebuild`] makes a fresh
//! instance carrying the same kind, policy and estimates.
//!
//! Actions do not talk to the host directly. Each transition that resolves the
//! Action returns a [`Resolution`] which the
//! [`Sequencer`](crate::sequencer::Sequencer) acts on.

pub mod kinds;
pub mod timer;

pub use kinds::{ActionKind, FocusCheck, Movie, ParameterSet, Progression, ProgressionChannel};
pub use timer::OneShotTimer;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::TimingConfig;
use crate::error::{ActionError, AppResult, DaveError, ErrorCause};
use crate::message::Message;
use crate::registry::ActionTag;
use crate::transport::Transport;
use crate::validation::ValidationTarget;

/// Error text for a reply whose id does not match the request.
pub const INCORRECT_MESSAGE: &str = "Communication Error: Incorrect Message Returned";

/// Lifecycle of an Action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionState {
    /// Built, not started
    Idle,
    /// Started, waiting for a reply or a local timer
    Sent,
    /// Resolved successfully
    Complete,
    /// Resolved with an error
    Error,
    /// Stopped by an abort
    Aborted,
}

impl ActionState {
    /// Whether the Action has resolved.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionState::Complete | ActionState::Error | ActionState::Aborted
        )
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionState::Idle => write!(f, "Idle"),
            ActionState::Sent => write!(f, "Sent"),
            ActionState::Complete => write!(f, "Complete"),
            ActionState::Error => write!(f, "Error"),
            ActionState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// How an Action resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Finished normally.
    Complete,
    /// Finished, with a soft failure to report.
    Warning(String),
    /// Failed.
    Error(ActionError),
}

/// One pending operation.
#[derive(Debug, Clone)]
pub struct Action {
    kind: ActionKind,
    message: Message,
    state: ActionState,
    reply: Option<Message>,
    error: Option<ActionError>,
    lost_message_timer: OneShotTimer,
    lost_message_delay: Duration,
    delay_timer: OneShotTimer,
    duration_s: f64,
    disk_usage_kb: f64,
    should_pause: bool,
    should_pause_default: bool,
    pause_after_error: bool,
    valid: bool,
}

impl Action {
    /// Create an idle Action with a fresh message.
    pub fn new(kind: ActionKind, timing: &TimingConfig) -> Self {
        let pauses = kind.pauses_by_default();
        Self {
            message: kind.message(),
            lost_message_delay: kind.lost_message_delay(timing),
            kind,
            state: ActionState::Idle,
            reply: None,
            error: None,
            lost_message_timer: OneShotTimer::new(),
            delay_timer: OneShotTimer::new(),
            duration_s: 0.0,
            disk_usage_kb: 0.0,
            should_pause: pauses,
            should_pause_default: pauses,
            pause_after_error: true,
            valid: true,
        }
    }

    /// Fresh, idle copy carrying the same kind, pause policy, estimates and validity.
    pub fn rebuild(&self) -> Self {
        Self {
            message: self.kind.message(),
            kind: self.kind.clone(),
            state: ActionState::Idle,
            reply: None,
            error: None,
            lost_message_timer: OneShotTimer::new(),
            lost_message_delay: self.lost_message_delay,
            delay_timer: OneShotTimer::new(),
            duration_s: self.duration_s,
            disk_usage_kb: self.disk_usage_kb,
            should_pause: self.should_pause_default,
            should_pause_default: self.should_pause_default,
            pause_after_error: self.pause_after_error,
            valid: self.valid,
        }
    }

    /// Start the Action.
    ///
    /// Sets the message's test flag and sends it. Local kinds resolve at once
    /// (or arm the delay timer) without touching the transport. The lost-message
    /// timer is armed only for test messages.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(resolution))` if the Action resolved immediately, including a
    ///   failed send.
    /// * `Ok(None)` if it is now waiting for a reply or timer.
    /// * `Err(DaveError::InvalidState)` if the Action was already started.
    pub fn start(
        &mut self,
        transport: &mut dyn Transport,
        test_mode: bool,
        now: Instant,
    ) -> AppResult<Option<Resolution>> {
        if self.state != ActionState::Idle {
            return Err(DaveError::invalid_state("start action", self.state));
        }
        self.message.set_test_mode(test_mode);
        self.state = ActionState::Sent;

        match self.kind {
            ActionKind::Delay { delay_ms } if test_mode => {
                self.duration_s = delay_ms as f64 / 1000.0;
                return Ok(Some(self.complete()));
            }
            ActionKind::Delay { delay_ms } => {
                debug!(delay_ms, "Delaying");
                self.delay_timer.start(now, Duration::from_millis(delay_ms));
                return Ok(None);
            }
            ActionKind::Pause | ActionKind::ClearWarnings => return Ok(Some(self.complete())),
            _ => {}
        }

        if test_mode {
            self.lost_message_timer.start(now, self.lost_message_delay);
        }
        debug!(
            message_id = %self.message.id(),
            message_type = self.message.message_type(),
            test_mode,
            "Sending message"
        );
        if let Err(e) = transport.send_message(&self.message) {
            return Ok(Some(self.fail(ErrorCause::TransportDisconnect, e.to_string())));
        }
        Ok(None)
    }

    /// Resolve against an inbound reply.
    ///
    /// A reply whose id differs from the request is a protocol mismatch whatever
    /// its own error flag says. Threshold checks run on the reply first and, on
    /// violation, flag it as errored so it takes the ordinary error path.
    ///
    /// Returns `None` when the Action is not waiting for a reply.
    pub fn handle_reply(&mut self, mut reply: Message) -> Option<Resolution> {
        if self.state != ActionState::Sent || self.kind.is_local() {
            debug!(message_id = %reply.id(), state = %self.state, "Ignoring reply");
            return None;
        }
        self.lost_message_timer.stop();

        if reply.id() != self.message.id() {
            warn!(
                expected = %self.message.id(),
                received = %reply.id(),
                "Reply does not match request"
            );
            self.reply = Some(reply);
            return Some(self.fail(ErrorCause::ProtocolMismatch, INCORRECT_MESSAGE));
        }

        let mut cause = ErrorCause::RemoteError;
        if !reply.has_error() {
            let synthesized = self
                .kind
                .threshold_violation(&reply)
                .map(|text| (ErrorCause::ThresholdViolation, text))
                .or_else(|| {
                    self.kind
                        .warning(&reply)
                        .map(|text| (ErrorCause::RemoteError, text))
                });
            if let Some((synthesized_cause, text)) = synthesized {
                cause = synthesized_cause;
                if let Err(e) = reply.set_error(text) {
                    warn!(error = %e, "Could not flag reply");
                }
            }
        }

        if reply.has_error() {
            let text = reply
                .error_message()
                .unwrap_or("Remote reported an error")
                .to_string();
            self.reply = Some(reply);
            if self.kind.errors_are_warnings() {
                return Some(self.warn(text));
            }
            return Some(self.fail(cause, text));
        }

        self.reply = Some(reply);
        Some(self.complete())
    }

    /// Fire any timer whose deadline has passed.
    pub fn on_timer(&mut self, now: Instant) -> Option<Resolution> {
        if self.state != ActionState::Sent {
            return None;
        }
        if self.delay_timer.fire_if_due(now) {
            return Some(self.complete());
        }
        if self.lost_message_timer.fire_if_due(now) {
            let text = format!(
                "A message of type {} was never received.\nPerhaps a module is missing?",
                self.message.message_type()
            );
            if let Err(e) = self.message.set_error(text.clone()) {
                warn!(error = %e, "Could not flag lost message");
            }
            return Some(self.fail(ErrorCause::LostMessage, text));
        }
        None
    }

    /// Earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.delay_timer.deadline(), self.lost_message_timer.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// The transport dropped. Errors the Action if it was waiting.
    pub fn handle_disconnect(&mut self) -> Option<Resolution> {
        if self.state != ActionState::Sent {
            return None;
        }
        Some(self.fail(
            ErrorCause::TransportDisconnect,
            "Connection to the remote was lost",
        ))
    }

    /// Stop the Action. Safe in any state; returns `false` if it had already resolved.
    ///
    /// A movie that is being recorded is cancelled on the remote first.
    pub fn abort(&mut self, transport: Option<&mut dyn Transport>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let was_sent = self.state == ActionState::Sent;
        self.stop_timers();

        if was_sent && !self.message.is_test() {
            if let (Some(cancel), Some(transport)) = (self.kind.abort_message(), transport) {
                debug!(message_type = cancel.message_type(), "Sending cancel");
                if let Err(e) = transport.send_message(&cancel) {
                    warn!(error = %e, "Failed to send cancel message");
                }
            }
        }
        self.state = ActionState::Aborted;
        true
    }

    /// Resolve as complete without a round trip, for an already-confirmed target.
    pub fn skip(&mut self) -> Option<Resolution> {
        if self.state != ActionState::Idle {
            return None;
        }
        self.state = ActionState::Complete;
        Some(Resolution::Complete)
    }

    /// Reset the pause flag to its default once the Sequencer has acted on it.
    pub fn clean_up(&mut self) {
        self.should_pause = self.should_pause_default;
    }

    fn complete(&mut self) -> Resolution {
        self.stop_timers();
        self.copy_estimates();
        self.state = ActionState::Complete;
        Resolution::Complete
    }

    fn warn(&mut self, text: String) -> Resolution {
        self.stop_timers();
        self.copy_estimates();
        self.state = ActionState::Complete;
        Resolution::Warning(text)
    }

    fn fail(&mut self, cause: ErrorCause, text: impl Into<String>) -> Resolution {
        self.stop_timers();
        if self.pause_after_error {
            self.should_pause = true;
        }
        let error = ActionError::new(cause, text);
        self.error = Some(error.clone());
        self.state = ActionState::Error;
        Resolution::Error(error)
    }

    fn stop_timers(&mut self) {
        self.lost_message_timer.stop();
        self.delay_timer.stop();
    }

    fn copy_estimates(&mut self) {
        if !self.message.is_test() {
            return;
        }
        if let Some(reply) = &self.reply {
            if let Some(duration) = reply.response_f64("duration") {
                self.duration_s = duration;
            }
            if let Some(disk_usage) = reply.response_f64("disk_usage") {
                self.disk_usage_kb = disk_usage;
            }
        }
    }

    /// Kind and parameters.
    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    /// Registry tag.
    pub fn tag(&self) -> ActionTag {
        self.kind.tag()
    }

    /// Request message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Last reply handed to this Action.
    pub fn reply(&self) -> Option<&Message> {
        self.reply.as_ref()
    }

    /// Current state.
    pub fn state(&self) -> ActionState {
        self.state
    }

    /// Error outcome, once resolved with an error.
    pub fn error(&self) -> Option<&ActionError> {
        self.error.as_ref()
    }

    /// Resolved without a network round trip.
    pub fn is_local(&self) -> bool {
        self.kind.is_local()
    }

    /// Whether the Sequencer should stop after this Action.
    pub fn should_pause(&self) -> bool {
        self.should_pause
    }

    /// Whether an error forces a pause.
    pub fn should_pause_after_error(&self) -> bool {
        self.pause_after_error
    }

    /// Set the pause-after-completion policy.
    pub fn set_pause_after_completion(&mut self, pause: bool) {
        self.should_pause = pause;
        self.should_pause_default = pause;
    }

    /// Set the pause-after-error policy.
    pub fn set_pause_after_error(&mut self, pause: bool) {
        self.pause_after_error = pause;
    }

    /// Estimated duration in seconds, 0 until calibrated.
    pub fn duration_s(&self) -> f64 {
        self.duration_s
    }

    /// Estimated disk usage in kilobytes, 0 until calibrated.
    pub fn disk_usage_kb(&self) -> f64 {
        self.disk_usage_kb
    }

    /// Overwrite calibration figures.
    pub fn set_estimates(&mut self, duration_s: f64, disk_usage_kb: f64) {
        self.duration_s = duration_s;
        self.disk_usage_kb = disk_usage_kb;
    }

    /// Whether the remote accepted this command in the last test run.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Mark valid or invalid.
    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    /// Lost-message timeout for test round trips.
    pub fn lost_message_delay(&self) -> Duration {
        self.lost_message_delay
    }

    /// Remote state this Action sets, if idempotent.
    pub fn validation(&self) -> Option<ValidationTarget> {
        self.kind.validation()
    }

    /// Validation id, if any.
    pub fn validation_id(&self) -> Option<String> {
        self.validation().map(|target| target.id)
    }

    /// Key shared by Actions that would send identical messages.
    pub fn calibration_key(&self) -> String {
        format!(
            "{} {}",
            self.message.message_type(),
            Value::Object(self.message.payload().clone())
        )
    }

    /// Short human description.
    pub fn describe(&self) -> String {
        self.kind.describe()
    }
}
