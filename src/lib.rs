//! # Dave Sequencer Library
//!
//! This crate drives scripted microscope experiments. An experiment is an ordered
//! list of Actions (move the stage, find focus, take a movie, run a fluidics
//! protocol, ...). Each Action sends one command to a remote control service
//! (HAL, or Kilroy for fluidics), waits for the reply, validates it and decides
//! whether the run continues, pauses or stops.
//!
//! ## Crate Structure
//!
//! - **`message`**: The request/response envelope exchanged with the remote service.
//! - **`descriptor`**: Untyped key/value records describing one Action, and
//!   sequence files holding a list of them.
//! - **`registry`**: Turns descriptors into Actions. Explicit `action` tags win;
//!   untagged descriptors are matched against every kind's recognised keys.
//! - **`action`**: The per-command state machine with its lost-message timeout,
//!   abort handling and kind-specific reply checks.
//! - **`sequencer`**: Runs Actions one at a time with pause, resume, abort and a
//!   dry-run (test) mode, plus an actor wrapper for async hosts.
//! - **`validation`**: Skips commands whose target the remote already confirmed,
//!   and caches dry-run calibrations.
//! - **`transport`**: The boundary to the live connection, with an in-memory mock.
//! - **`config`**: Figment-based configuration (TOML file + `DAVE_` environment).
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: `DaveError` for engine failures and `ActionError` for
//!   per-Action outcomes.

pub mod action;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod logging;
pub mod message;
pub mod registry;
pub mod sequencer;
pub mod transport;
pub mod validation;

pub use action::{Action, ActionKind, ActionState, Resolution};
pub use config::DaveConfig;
pub use descriptor::{Descriptor, SequenceFile};
pub use error::{ActionError, AppResult, DaveError, ErrorCause};
pub use message::Message;
pub use sequencer::{
    Sequencer, SequencerActor, SequencerEvent, SequencerHandle, SequencerState, SequencerStatus,
};
pub use transport::{Transport, TransportEvent};
