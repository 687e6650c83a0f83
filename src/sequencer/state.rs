//! Sequencer lifecycle state and status snapshots.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sequencer execution state.
///
/// # State Machine
///
/// ```text
/// Idle ──run──> Running ──queue exhausted──> Idle
///                 │   ▲
///    pause at     │   │ resume
///    boundary /   │   │
///    error        ▼   │
///               Paused
///
/// abort or disconnect from Running/Paused ──> Idle (cursor reset)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequencerState {
    /// Nothing running; the queue can be (re)loaded
    Idle,
    /// Driving Actions
    Running,
    /// Stopped at an Action boundary, waiting for resume or abort
    Paused,
}

impl std::fmt::Display for SequencerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequencerState::Idle => write!(f, "Idle"),
            SequencerState::Running => write!(f, "Running"),
            SequencerState::Paused => write!(f, "Paused"),
        }
    }
}

impl SequencerState {
    /// Check if the state allows starting a run or loading a queue.
    pub fn can_run(&self) -> bool {
        matches!(self, SequencerState::Idle)
    }

    /// Check if the state allows pausing.
    pub fn can_pause(&self) -> bool {
        matches!(self, SequencerState::Running)
    }

    /// Check if the state allows resuming.
    pub fn can_resume(&self) -> bool {
        matches!(self, SequencerState::Paused)
    }
}

/// Why the Sequencer stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// The host asked for a pause
    Requested,
    /// The Action asked for a pause after completing
    AfterAction {
        /// Index of that Action
        index: usize,
    },
    /// The Action errored
    Error {
        /// Index of that Action
        index: usize,
        /// Error text
        message: String,
    },
    /// More warnings were recorded than allowed
    TooManyWarnings {
        /// Number of recorded warnings
        count: usize,
        /// One line per warning: time, source and text
        summary: String,
    },
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PauseReason::Requested => write!(f, "pause requested"),
            PauseReason::AfterAction { index } => write!(f, "pause after action {}", index),
            PauseReason::Error { index, message } => {
                write!(f, "action {} failed: {}", index, message)
            }
            PauseReason::TooManyWarnings { count, .. } => {
                write!(f, "{} warnings recorded", count)
            }
        }
    }
}

/// Run-time and disk estimate for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunEstimate {
    /// Seconds
    pub duration_s: f64,
    /// Kilobytes
    pub disk_usage_kb: f64,
    /// Valid Actions counted
    pub actions: usize,
}

impl RunEstimate {
    /// Add one Action's figures.
    pub fn add(&mut self, duration_s: f64, disk_usage_kb: f64) {
        self.duration_s += duration_s;
        self.disk_usage_kb += disk_usage_kb;
        self.actions += 1;
    }
}

/// Point-in-time view of the Sequencer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencerStatus {
    /// Sequence name
    pub name: String,
    /// Lifecycle state
    pub state: SequencerState,
    /// Dry-run mode
    pub test_mode: bool,
    /// Next Action to start (or the one in flight)
    pub cursor: usize,
    /// Queue length
    pub total: usize,
    /// Index of the Action awaiting resolution
    pub in_flight: Option<usize>,
    /// Description of the Action at the cursor
    pub current: Option<String>,
    /// Indices of Actions marked invalid by a dry run
    pub invalid: Vec<usize>,
    /// Recorded warnings
    pub warnings: usize,
    /// Most recent Action error
    pub last_error: Option<String>,
    /// Figures accumulated by Actions completed in this run
    pub completed: RunEstimate,
    /// Identifier of the current or last run
    pub run_id: Option<Uuid>,
}
