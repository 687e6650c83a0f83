//! Configuration loading using Figment.
//!
//! Configuration is layered from:
//! 1. `config/dave.toml` (or any file passed to [`DaveConfig::load_from`])
//! 2. Environment variables prefixed with `DAVE_`, nested with `__`
//!
//! Every field has a default, so a missing file yields [`DaveConfig::default`].
//!
//! # Example
//! ```no_run
//! use dave::config::DaveConfig;
//!
//! let config = DaveConfig::load()?;
//! config.validate()?;
//! println!("lost message delay: {} ms", config.timing.lost_message_delay_ms);
//! # Ok::<(), dave::error::DaveError>(())
//! ```
//!
//! `DAVE_TIMING__LOST_MESSAGE_DELAY_MS=5000` overrides `timing.lost_message_delay_ms`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AppResult, DaveError};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/dave.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaveConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Sequencer behaviour
    #[serde(default)]
    pub sequencer: SequencerConfig,
    /// Lost-message timeouts
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Sequencer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Start in test (dry-run) mode
    #[serde(default)]
    pub test_mode: bool,
    /// Skip remote calls whose target was already confirmed
    #[serde(default = "default_true")]
    pub skip_redundant: bool,
    /// Pause once more than this many warnings are recorded
    #[serde(default = "default_max_warnings")]
    pub max_warnings: usize,
    /// Broadcast capacity for sequencer events
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Command channel capacity for the sequencer actor
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

/// Lost-message timer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Wait for a test reply before declaring it lost
    #[serde(default = "default_lost_message_delay")]
    pub lost_message_delay_ms: u64,
    /// Same, for "Set Parameters", which can take much longer
    #[serde(default = "default_parameters_lost_message_delay")]
    pub parameters_lost_message_delay_ms: u64,
}

// Default value functions
fn default_name() -> String {
    "Dave".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_warnings() -> usize {
    10
}

fn default_event_capacity() -> usize {
    256
}

fn default_command_capacity() -> usize {
    32
}

fn default_lost_message_delay() -> u64 {
    2000
}

fn default_parameters_lost_message_delay() -> u64 {
    15000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            test_mode: false,
            skip_redundant: default_true(),
            max_warnings: default_max_warnings(),
            event_capacity: default_event_capacity(),
            command_capacity: default_command_capacity(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            lost_message_delay_ms: default_lost_message_delay(),
            parameters_lost_message_delay_ms: default_parameters_lost_message_delay(),
        }
    }
}

impl TimingConfig {
    /// Default lost-message delay.
    pub fn lost_message_delay(&self) -> Duration {
        Duration::from_millis(self.lost_message_delay_ms)
    }

    /// Lost-message delay for "Set Parameters".
    pub fn parameters_lost_message_delay(&self) -> Duration {
        Duration::from_millis(self.parameters_lost_message_delay_ms)
    }
}

impl DaveConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults fill every field.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(DaveConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAVE_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaveError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(DaveError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.sequencer.event_capacity == 0 || self.sequencer.command_capacity == 0 {
            return Err(DaveError::Configuration(
                "Channel capacities must be greater than zero".to_string(),
            ));
        }

        if self.timing.lost_message_delay_ms == 0
            || self.timing.parameters_lost_message_delay_ms == 0
        {
            return Err(DaveError::Configuration(
                "Lost message delays must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
