//! Redundant-call detection and test-mode calibration sharing.
//!
//! [`ValidationTracker`] remembers, per validation id, the last target value the
//! remote confirmed. An Action whose target already matches can be treated as
//! complete without a round trip. The tracker is best effort: it cannot see
//! changes made to the remote by anything other than this sequencer, and it is
//! never invalidated automatically when an Action errors.
//!
//! [`CalibrationCache`] is the test-mode counterpart: identical commands are sent
//! once per dry run and the figures are shared.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::action::Action;

/// Remote state an idempotent Action sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationTarget {
    /// Validation id, one per remote setting (e.g. `"Move Stage"`)
    pub id: String,
    /// Value the setting takes once the Action completes
    pub value: Value,
}

impl ValidationTarget {
    /// Create a target.
    pub fn new(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

/// Outcome of [`ValidationTracker::before_send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    /// Send the message.
    Send,
    /// The remote already holds the target; complete without sending.
    Skip,
}

/// Last confirmed value per validation id.
#[derive(Debug, Clone, Default)]
pub struct ValidationTracker {
    confirmed: HashMap<String, Value>,
}

impl ValidationTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `action` needs a round trip.
    ///
    /// # Arguments
    ///
    /// * `action` - The Action about to be started.
    ///
    /// # Returns
    ///
    /// * `SendDecision::Skip` if the action has a validation target equal to the
    ///   last confirmed value for its id.
    /// * `SendDecision::Send` otherwise, including for Actions without a target.
    pub fn before_send(&self, action: &Action) -> SendDecision {
        match action.validation() {
            Some(target) if self.confirmed.get(&target.id) == Some(&target.value) => {
                debug!(id = %target.id, value = %target.value, "Target already confirmed");
                SendDecision::Skip
            }
            _ => SendDecision::Send,
        }
    }

    /// Record a successful completion.
    ///
    /// Settings the Action changed as a side effect are forgotten; its own target,
    /// if any, becomes the confirmed value.
    pub fn record_confirmed(&mut self, action: &Action) {
        self.forget_side_effects(action);
        if let Some(target) = action.validation() {
            self.confirmed.insert(target.id, target.value);
        }
    }

    /// Forget settings `action` may have changed besides its own target.
    pub fn forget_side_effects(&mut self, action: &Action) {
        for id in action.kind().side_effects() {
            if let Some(value) = self.confirmed.remove(id) {
                debug!(id, previous = %value, "Setting changed by another action");
            }
        }
    }

    /// Forget one id, forcing the next matching Action to be sent.
    pub fn invalidate(&mut self, id: &str) -> Option<Value> {
        self.confirmed.remove(id)
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.confirmed.clear();
    }

    /// Last confirmed value for `id`.
    pub fn last_confirmed(&self, id: &str) -> Option<&Value> {
        self.confirmed.get(id)
    }

    /// Number of tracked ids.
    pub fn len(&self) -> usize {
        self.confirmed.len()
    }

    /// No ids tracked.
    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty()
    }
}

/// Figures learned from one test round trip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Whether the remote accepted the command
    pub valid: bool,
    /// Estimated duration in seconds
    pub duration_s: f64,
    /// Estimated disk usage in kilobytes
    pub disk_usage_kb: f64,
}

impl Calibration {
    /// Figures for a command the remote rejected.
    pub fn invalid() -> Self {
        Self {
            valid: false,
            duration_s: 0.0,
            disk_usage_kb: 0.0,
        }
    }
}

/// Test-mode results keyed by [`Action::calibration_key`].
#[derive(Debug, Clone, Default)]
pub struct CalibrationCache {
    entries: HashMap<String, Calibration>,
}

impl CalibrationCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Result already learned for this key.
    pub fn get(&self, key: &str) -> Option<&Calibration> {
        self.entries.get(key)
    }

    /// Store the result for a key, replacing any earlier one.
    pub fn insert(&mut self, key: impl Into<String>, calibration: Calibration) {
        self.entries.insert(key.into(), calibration);
    }

    /// Forget all results; called when a new dry run starts.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No results yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
