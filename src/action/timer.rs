//! One-shot deadline timer owned by a single Action.
//!
//! The timer holds a deadline only; it never spawns a task. The host loop asks
//! for the earliest deadline, sleeps until it, then hands the current instant back
//! through [`OneShotTimer::fire_if_due`]. A stopped timer can therefore never fire
//! late against a different Action.

use std::time::Duration;
use tokio::time::Instant;

/// Deadline that fires at most once per arming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OneShotTimer {
    deadline: Option<Instant>,
}

impl OneShotTimer {
    /// Stopped timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm to fire `delay` after `now`, replacing any previous deadline.
    pub fn start(&mut self, now: Instant, delay: Duration) {
        self.deadline = Some(now + delay);
    }

    /// Disarm.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    /// Whether a deadline is pending.
    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    /// Pending deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Disarm and return `true` if the deadline has passed.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
