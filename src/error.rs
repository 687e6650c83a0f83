//! Custom error types for the sequencing engine.
//!
//! This module defines two families of errors:
//!
//! - **`DaveError`**: the crate-level error returned by fallible operations such as
//!   loading a sequence, starting a run from the wrong state, or reading configuration.
//!   It is a `thiserror` enum with `#[from]` conversions so the `?` operator works
//!   across module boundaries.
//! - **`ActionError`**: the outcome attached to an Action that resolved to `Error`.
//!   It is not returned through `Result`; it travels inside a
//!   [`Resolution`](crate::action::Resolution) and is reported to the host through
//!   [`SequencerEvent::SequenceErrored`](crate::sequencer::SequencerEvent).
//!
//! ## Action error taxonomy
//!
//! Every Action-level failure carries exactly one [`ErrorCause`]:
//!
//! - **`ProtocolMismatch`**: the reply id differs from the id of the request that was sent.
//! - **`RemoteError`**: the remote flagged the reply as an error.
//! - **`ThresholdViolation`**: a measured quantity in the reply is below the caller minimum.
//! - **`LostMessage`**: a test round-trip received no reply before its timer expired.
//! - **`TransportDisconnect`**: the channel dropped while the Action was in flight.
//!
//! All five collapse into the same pause-and-report behavior in the Sequencer and
//! none of them are retried automatically.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::MessageError;
use crate::transport::TransportError;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaveError>;

// =============================================================================
// Action Errors
// =============================================================================

/// Why an Action resolved to `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCause {
    /// Reply id did not match the request id.
    ProtocolMismatch,
    /// Remote service flagged the reply as an error.
    RemoteError,
    /// A measured quantity fell below the caller-supplied minimum.
    ThresholdViolation,
    /// No reply arrived before the lost-message timer fired.
    LostMessage,
    /// The transport dropped while the Action was in flight.
    TransportDisconnect,
}

impl std::fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorCause::ProtocolMismatch => "protocol_mismatch",
            ErrorCause::RemoteError => "remote_error",
            ErrorCause::ThresholdViolation => "threshold_violation",
            ErrorCause::LostMessage => "lost_message",
            ErrorCause::TransportDisconnect => "transport_disconnect",
        };
        write!(f, "{}", label)
    }
}

/// Error outcome of a single Action.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{cause}: {message}")]
pub struct ActionError {
    /// Taxonomy bucket.
    pub cause: ErrorCause,
    /// Original error text, as reported by the remote or synthesized locally.
    pub message: String,
}

impl ActionError {
    /// Create an error with the given cause and text.
    pub fn new(cause: ErrorCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            message: message.into(),
        }
    }
}

// =============================================================================
// Crate Errors
// =============================================================================

/// Primary error type for the sequencer.
///
/// # Error Categories
///
/// 1. **Configuration Errors** - `Config`, `Configuration`
///    - Occur at startup while reading `dave.toml` / `DAVE_*` variables.
///    - Recovery: fix configuration and restart.
///
/// 2. **Sequence Errors** - `Descriptor`, `AmbiguousDescriptor`, `UnknownTag`, `EmptySequence`
///    - Occur while loading a sequence; nothing is queued when they are returned.
///    - Recovery: fix the sequence file.
///
/// 3. **Runtime Errors** - `InvalidState`, `Transport`, `ActorClosed`
///    - Occur while driving a run.
///    - Recovery: wait for the engine to reach the expected state, or reconnect.
#[derive(Error, Debug)]
pub enum DaveError {
    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but holds an invalid value.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sequence file is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No Action kind accepts the descriptor at `index`.
    #[error("Descriptor {index} was not accepted: {reason}")]
    Descriptor {
        /// Position of the descriptor in the sequence.
        index: usize,
        /// Human readable reason.
        reason: String,
    },

    /// More than one Action kind accepts the untagged descriptor at `index`.
    #[error("Descriptor {index} is ambiguous, accepted by: {}", kinds.join(", "))]
    AmbiguousDescriptor {
        /// Position of the descriptor in the sequence.
        index: usize,
        /// Tags of every kind that accepted it, in build order.
        kinds: Vec<String>,
    },

    /// Descriptor names an Action tag that is not registered.
    #[error("Unknown action tag '{0}'")]
    UnknownTag(String),

    /// Operation requires a non-empty sequence.
    #[error("No actions loaded")]
    EmptySequence,

    /// Operation is not allowed in the current engine state.
    #[error("Cannot {operation}: sequencer is {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the engine was in.
        state: String,
    },

    /// Transport failure outside of an in-flight Action.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Message contract violation.
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// The sequencer actor task is no longer running.
    #[error("Sequencer actor is not running")]
    ActorClosed,
}

impl From<figment::Error> for DaveError {
    fn from(value: figment::Error) -> Self {
        DaveError::Config(Box::new(value))
    }
}

impl DaveError {
    /// Build an `InvalidState` error from anything displayable.
    pub fn invalid_state(operation: &'static str, state: impl std::fmt::Display) -> Self {
        DaveError::InvalidState {
            operation,
            state: state.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_error_display_includes_cause() {
        let err = ActionError::new(ErrorCause::ThresholdViolation, "3 spots < 5");
        assert_eq!(err.to_string(), "threshold_violation: 3 spots < 5");
    }

    #[test]
    fn ambiguous_descriptor_lists_kinds() {
        let err = DaveError::AmbiguousDescriptor {
            index: 4,
            kinds: vec!["set_directory".into(), "take_movie".into()],
        };
        let text = err.to_string();
        assert!(text.contains("Descriptor 4"));
        assert!(text.contains("set_directory, take_movie"));
    }

    #[test]
    fn invalid_state_formats_operation() {
        let err = DaveError::invalid_state("resume", "idle");
        assert_eq!(err.to_string(), "Cannot resume: sequencer is idle");
    }
}
