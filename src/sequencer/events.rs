//! Observable surface for host integration.
//!
//! Every lifecycle change is broadcast as a [`SequencerEvent`]. Send failures
//! (no subscribers) are ignored; the Sequencer never blocks on observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::descriptor::Descriptor;
use crate::error::ActionError;

use super::state::PauseReason;

/// A soft failure recorded during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    /// Position of the Action in the queue
    pub index: usize,
    /// Descriptor of the Action that raised it
    pub descriptor: Descriptor,
    /// Warning text
    pub message: String,
    /// When it was recorded
    pub at: DateTime<Utc>,
}

impl Warning {
    /// The descriptor's `label`, or the descriptor itself.
    pub fn source(&self) -> String {
        match self.descriptor.label() {
            Some(label) => label.to_string(),
            None => self.descriptor.to_string(),
        }
    }
}

/// Summary shown when a run pauses on too many warnings.
pub fn warnings_summary(warnings: &[Warning]) -> String {
    let lines: Vec<String> = warnings
        .iter()
        .map(|w| {
            format!(
                "{} action {} {}: {}",
                w.at.format("%Y-%m-%d %H:%M:%S"),
                w.index,
                w.source(),
                w.message
            )
        })
        .collect();
    format!("Warnings summary:\n{}", lines.join("\n"))
}

/// Sequencer lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SequencerEvent {
    /// An Action was started.
    ActionStarted {
        /// Queue position
        index: usize,
        /// Source descriptor
        descriptor: Descriptor,
        /// Human description
        description: String,
    },
    /// An Action completed, or was skipped as redundant.
    ActionCompleted {
        /// Queue position
        index: usize,
        /// Source descriptor
        descriptor: Descriptor,
        /// Estimated duration in seconds
        duration_s: f64,
        /// Estimated disk usage in kilobytes
        disk_usage_kb: f64,
        /// `true` when no message was sent
        skipped: bool,
    },
    /// A test round trip failed; the Action is marked invalid.
    ActionInvalid {
        /// Queue position
        index: usize,
        /// Source descriptor
        descriptor: Descriptor,
        /// Failure
        error: ActionError,
    },
    /// A warning was recorded.
    Warning(Warning),
    /// The run stopped at an Action boundary.
    SequencePaused {
        /// Why it stopped
        reason: PauseReason,
    },
    /// The run resumed after a pause.
    SequenceResumed,
    /// An Action failed.
    SequenceErrored {
        /// Queue position
        index: usize,
        /// Source descriptor
        descriptor: Descriptor,
        /// Failure
        error: ActionError,
    },
    /// Every Action in the queue has run.
    SequenceFinished,
    /// The run was aborted; the cursor is back at the start.
    SequenceAborted,
}
