//! Built-in Action kinds.
//!
//! Each [`ActionKind`] variant knows how to read itself out of a
//! [`Descriptor`], which message it sends, and which optional behaviours it
//! carries: a threshold check on the reply, a validation target, a cancel
//! message on abort.
//!
//! | tag | descriptor keys | message type |
//! |---|---|---|
//! | `check_focus` | `check_focus` (`true` or `{num_focus_checks, focus_scan, scan_range}`) | Check Focus Lock |
//! | `clear_warnings` | `clear_warnings` | Clear Warnings (local) |
//! | `delay` | `delay` (ms) | Delay (local) |
//! | `find_sum` | `find_sum` or `min_sum` | Find Sum |
//! | `move_stage` | `stage_x`, `stage_y` | Move Stage |
//! | `pause` | `pause` | Pause (local) |
//! | `recenter_piezo` | `recenter` | Recenter Piezo |
//! | `set_directory` | `directory` | Set Directory |
//! | `set_focus_lock_target` | `lock_target` | Set Lock Target |
//! | `set_parameters` | `parameters` (string or int) | Set Parameters |
//! | `set_progression` | `progression` or flat `type`/`filename`/`channels` | Set Progression |
//! | `take_movie` | `name`, `length`, `min_spots`, `parameters`, `directory`, `overwrite` | Take Movie |
//! | `valve_protocol` | `valve_protocol` or `name` | Kilroy Protocol |

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::TimingConfig;
use crate::descriptor::Descriptor;
use crate::message::{Message, Payload};
use crate::registry::ActionTag;
use crate::validation::ValidationTarget;

/// Message sent to HAL when a running movie is aborted.
pub const ABORT_MOVIE: &str = "Abort Movie";

const SET_DIRECTORY: &str = "Set Directory";
const SET_PARAMETERS: &str = "Set Parameters";

/// Frames per progression channel when not given.
pub const DEFAULT_PROGRESSION_FRAMES: u64 = 100;

/// Focus checks per "Check Focus Lock" when not given.
pub const DEFAULT_FOCUS_CHECKS: u32 = 10;

/// Parameter file selector for "Set Parameters" and "Take Movie".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterSet {
    /// Index into the parameters HAL has loaded
    Index(i64),
    /// Parameter file name
    Name(String),
}

impl ParameterSet {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(ParameterSet::Index),
            Value::String(s) if !s.is_empty() => Some(ParameterSet::Name(s.clone())),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterSet::Index(i) => write!(f, "{}", i),
            ParameterSet::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<&ParameterSet> for Value {
    fn from(parameters: &ParameterSet) -> Self {
        match parameters {
            ParameterSet::Index(i) => json!(i),
            ParameterSet::Name(name) => json!(name),
        }
    }
}

/// One channel of a math progression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressionChannel {
    /// Illumination channel
    pub channel: i64,
    /// Starting power
    pub start: f64,
    /// Frames between increments
    pub frames: u64,
    /// Power increment
    pub inc: f64,
}

impl ProgressionChannel {
    /// Accepts `{"channel", "start", "frames"?, "inc"?}` or `[channel, start, frames?, inc?]`.
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) => {
                let fields = Descriptor::from(map.clone());
                Some(Self {
                    channel: fields.i64("channel")?,
                    start: fields.f64("start")?,
                    frames: fields.u64("frames").unwrap_or(DEFAULT_PROGRESSION_FRAMES),
                    inc: fields.f64("inc").unwrap_or(0.0),
                })
            }
            Value::Array(items) => Some(Self {
                channel: items.first()?.as_i64()?,
                start: items.get(1)?.as_f64()?,
                frames: items
                    .get(2)
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_PROGRESSION_FRAMES),
                inc: items.get(3).and_then(Value::as_f64).unwrap_or(0.0),
            }),
            _ => None,
        }
    }
}

/// Illumination power progression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progression {
    /// Progression type, e.g. `"file"`, `"lockedout"`, `"math"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Progression file for file progressions
    pub filename: Option<String>,
    /// Channels for math progressions
    pub channels: Vec<ProgressionChannel>,
}

impl Progression {
    fn from_fields(fields: &Descriptor) -> Option<Self> {
        let kind = fields.str("type")?.to_string();
        let filename = fields.str("filename").map(str::to_string);
        let channels = match fields.get("channels") {
            Some(Value::Array(items)) => items
                .iter()
                .map(ProgressionChannel::from_value)
                .collect::<Option<Vec<_>>>()?,
            Some(_) => return None,
            None => Vec::new(),
        };
        Some(Self {
            kind,
            filename,
            channels,
        })
    }
}

/// Movie request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    /// Movie base name
    pub name: String,
    /// Frames to record, always positive
    pub length: u64,
    /// Minimum localisations the analysis must report
    pub min_spots: u64,
    /// Parameters to switch to first
    pub parameters: Option<ParameterSet>,
    /// Directory override
    pub directory: Option<String>,
    /// Overwrite an existing movie of the same name
    pub overwrite: Option<bool>,
}

/// Focus lock check request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusCheck {
    /// Number of 100 ms checks
    pub num_focus_checks: u32,
    /// Scan for focus if the check fails
    pub focus_scan: bool,
    /// Scan range
    pub scan_range: Option<f64>,
}

/// Every built-in Action variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    /// Confirm the focus lock is locked; failure is a warning.
    CheckFocus(FocusCheck),
    /// Forget recorded warnings.
    ClearWarnings,
    /// Wait locally.
    Delay {
        /// Delay in milliseconds
        delay_ms: u64,
    },
    /// Search for a focus sum above a minimum.
    FindSum {
        /// Minimum acceptable sum, always positive
        min_sum: f64,
    },
    /// Move the stage.
    MoveStage {
        /// X position
        stage_x: f64,
        /// Y position
        stage_y: f64,
    },
    /// Stop the sequence until resumed.
    Pause,
    /// Recenter the focus piezo.
    RecenterPiezo,
    /// Change HAL's working directory.
    SetDirectory {
        /// New directory
        directory: String,
    },
    /// Change the focus lock target.
    SetFocusLockTarget {
        /// New target
        lock_target: f64,
    },
    /// Switch HAL parameters.
    SetParameters {
        /// Parameters to select
        parameters: ParameterSet,
    },
    /// Configure the illumination progression.
    SetProgression(Progression),
    /// Record a movie.
    TakeMovie(Movie),
    /// Run a Kilroy fluidics protocol.
    ValveProtocol {
        /// Protocol name
        name: String,
    },
}

impl ActionKind {
    /// Read a kind out of a descriptor, or `None` if required keys are missing or invalid.
    ///
    /// Unrecognised keys are ignored here; [`crate::registry`] decides whether
    /// they disqualify an untagged descriptor.
    pub fn parse(tag: ActionTag, descriptor: &Descriptor) -> Option<Self> {
        match tag {
            ActionTag::CheckFocus => Self::parse_check_focus(descriptor),
            ActionTag::ClearWarnings => descriptor
                .contains("clear_warnings")
                .then_some(ActionKind::ClearWarnings),
            ActionTag::Delay => descriptor
                .u64("delay")
                .map(|delay_ms| ActionKind::Delay { delay_ms }),
            ActionTag::FindSum => descriptor
                .f64("find_sum")
                .or_else(|| descriptor.f64("min_sum"))
                .filter(|min_sum| *min_sum > 0.0)
                .map(|min_sum| ActionKind::FindSum { min_sum }),
            ActionTag::MoveStage => Some(ActionKind::MoveStage {
                stage_x: descriptor.f64("stage_x")?,
                stage_y: descriptor.f64("stage_y")?,
            }),
            ActionTag::Pause => descriptor.contains("pause").then_some(ActionKind::Pause),
            ActionTag::RecenterPiezo => descriptor
                .contains("recenter")
                .then_some(ActionKind::RecenterPiezo),
            ActionTag::SetDirectory => descriptor
                .str("directory")
                .filter(|d| !d.is_empty())
                .map(|directory| ActionKind::SetDirectory {
                    directory: directory.to_string(),
                }),
            ActionTag::SetFocusLockTarget => descriptor
                .f64("lock_target")
                .map(|lock_target| ActionKind::SetFocusLockTarget { lock_target }),
            ActionTag::SetParameters => descriptor
                .get("parameters")
                .and_then(ParameterSet::from_value)
                .map(|parameters| ActionKind::SetParameters { parameters }),
            ActionTag::SetProgression => Self::parse_progression(descriptor),
            ActionTag::TakeMovie => Self::parse_movie(descriptor),
            ActionTag::ValveProtocol => descriptor
                .str("valve_protocol")
                .or_else(|| descriptor.str("name"))
                .filter(|name| !name.is_empty())
                .map(|name| ActionKind::ValveProtocol {
                    name: name.to_string(),
                }),
        }
    }

    fn parse_check_focus(descriptor: &Descriptor) -> Option<Self> {
        let check = match descriptor.get("check_focus")? {
            Value::Bool(false) => return None,
            Value::Object(map) => {
                let fields = Descriptor::from(map.clone());
                FocusCheck {
                    num_focus_checks: fields
                        .u64("num_focus_checks")
                        .and_then(|n| u32::try_from(n).ok())
                        .unwrap_or(DEFAULT_FOCUS_CHECKS),
                    focus_scan: fields.bool("focus_scan").unwrap_or(false),
                    scan_range: fields.f64("scan_range"),
                }
            }
            _ => FocusCheck {
                num_focus_checks: DEFAULT_FOCUS_CHECKS,
                focus_scan: false,
                scan_range: None,
            },
        };
        Some(ActionKind::CheckFocus(check))
    }

    fn parse_progression(descriptor: &Descriptor) -> Option<Self> {
        let progression = match descriptor.get("progression") {
            Some(Value::Object(map)) => Progression::from_fields(&Descriptor::from(map.clone()))?,
            Some(_) => return None,
            None => Progression::from_fields(descriptor)?,
        };
        Some(ActionKind::SetProgression(progression))
    }

    fn parse_movie(descriptor: &Descriptor) -> Option<Self> {
        let name = descriptor.str("name").filter(|n| !n.is_empty())?;
        let length = descriptor.u64("length").filter(|l| *l > 0)?;
        let parameters = match descriptor.get("parameters") {
            Some(Value::Null) | None => None,
            Some(value) => Some(ParameterSet::from_value(value)?),
        };
        let min_spots = match descriptor.get("min_spots") {
            Some(Value::Null) | None => 0,
            Some(_) => descriptor.u64("min_spots")?,
        };
        Some(ActionKind::TakeMovie(Movie {
            name: name.to_string(),
            length,
            min_spots,
            parameters,
            directory: descriptor.str("directory").map(str::to_string),
            overwrite: descriptor.bool("overwrite"),
        }))
    }

    /// Registry tag of this kind.
    pub fn tag(&self) -> ActionTag {
        match self {
            ActionKind::CheckFocus(_) => ActionTag::CheckFocus,
            ActionKind::ClearWarnings => ActionTag::ClearWarnings,
            ActionKind::Delay { .. } => ActionTag::Delay,
            ActionKind::FindSum { .. } => ActionTag::FindSum,
            ActionKind::MoveStage { .. } => ActionTag::MoveStage,
            ActionKind::Pause => ActionTag::Pause,
            ActionKind::RecenterPiezo => ActionTag::RecenterPiezo,
            ActionKind::SetDirectory { .. } => ActionTag::SetDirectory,
            ActionKind::SetFocusLockTarget { .. } => ActionTag::SetFocusLockTarget,
            ActionKind::SetParameters { .. } => ActionTag::SetParameters,
            ActionKind::SetProgression(_) => ActionTag::SetProgression,
            ActionKind::TakeMovie(_) => ActionTag::TakeMovie,
            ActionKind::ValveProtocol { .. } => ActionTag::ValveProtocol,
        }
    }

    /// Message type understood by HAL or Kilroy.
    pub fn message_type(&self) -> &'static str {
        match self {
            ActionKind::CheckFocus(_) => "Check Focus Lock",
            ActionKind::ClearWarnings => "Clear Warnings",
            ActionKind::Delay { .. } => "Delay",
            ActionKind::FindSum { .. } => "Find Sum",
            ActionKind::MoveStage { .. } => "Move Stage",
            ActionKind::Pause => "Pause",
            ActionKind::RecenterPiezo => "Recenter Piezo",
            ActionKind::SetDirectory { .. } => SET_DIRECTORY,
            ActionKind::SetFocusLockTarget { .. } => "Set Lock Target",
            ActionKind::SetParameters { .. } => SET_PARAMETERS,
            ActionKind::SetProgression(_) => "Set Progression",
            ActionKind::TakeMovie(_) => "Take Movie",
            ActionKind::ValveProtocol { .. } => "Kilroy Protocol",
        }
    }

    /// Request payload.
    pub fn payload(&self) -> Payload {
        let value = match self {
            ActionKind::CheckFocus(check) => json!({
                "num_focus_checks": check.num_focus_checks,
                "focus_scan": check.focus_scan,
                "scan_range": check.scan_range,
            }),
            ActionKind::ClearWarnings | ActionKind::Pause | ActionKind::RecenterPiezo => json!({}),
            ActionKind::Delay { delay_ms } => json!({ "delay": delay_ms }),
            ActionKind::FindSum { min_sum } => json!({ "min_sum": min_sum }),
            ActionKind::MoveStage { stage_x, stage_y } => {
                json!({ "stage_x": stage_x, "stage_y": stage_y })
            }
            ActionKind::SetDirectory { directory } => json!({ "directory": directory }),
            ActionKind::SetFocusLockTarget { lock_target } => json!({ "lock_target": lock_target }),
            ActionKind::SetParameters { parameters } => {
                json!({ "parameters": Value::from(parameters) })
            }
            ActionKind::SetProgression(progression) => {
                let mut data = json!({ "type": progression.kind });
                if let Some(filename) = &progression.filename {
                    data["filename"] = json!(filename);
                } else if !progression.channels.is_empty() {
                    let channels: Vec<Value> = progression
                        .channels
                        .iter()
                        .map(|c| json!([c.channel, c.start, c.frames, c.inc]))
                        .collect();
                    data["channels"] = Value::Array(channels);
                }
                data
            }
            ActionKind::TakeMovie(movie) => {
                let mut data = json!({
                    "name": movie.name,
                    "length": movie.length,
                    "min_spots": movie.min_spots,
                    "parameters": movie.parameters.as_ref().map(Value::from),
                });
                if let Some(directory) = &movie.directory {
                    data["directory"] = json!(directory);
                }
                if let Some(overwrite) = movie.overwrite {
                    data["overwrite"] = json!(overwrite);
                }
                data
            }
            ActionKind::ValveProtocol { name } => json!({ "name": name }),
        };
        match value {
            Value::Object(map) => map,
            _ => Payload::new(),
        }
    }

    /// Build the request message with a fresh id.
    pub fn message(&self) -> Message {
        Message::new(self.message_type(), self.payload())
    }

    /// Resolved without a network round trip.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ActionKind::Delay { .. } | ActionKind::Pause | ActionKind::ClearWarnings
        )
    }

    /// Pause after completion unless the descriptor says otherwise.
    pub fn pauses_by_default(&self) -> bool {
        matches!(self, ActionKind::Pause)
    }

    /// Remote errors for this kind are reported as warnings.
    pub fn errors_are_warnings(&self) -> bool {
        matches!(self, ActionKind::CheckFocus(_))
    }

    /// How long to wait for a test reply.
    pub fn lost_message_delay(&self, timing: &TimingConfig) -> Duration {
        match self {
            ActionKind::SetParameters { .. } => timing.parameters_lost_message_delay(),
            _ => timing.lost_message_delay(),
        }
    }

    /// Remote state this kind sets, for redundant-call skipping.
    ///
    /// Only idempotent commands have one; movies, protocols and searches always run.
    pub fn validation(&self) -> Option<ValidationTarget> {
        let target = match self {
            ActionKind::MoveStage { stage_x, stage_y } => json!([stage_x, stage_y]),
            ActionKind::SetDirectory { directory } => json!(directory),
            ActionKind::SetParameters { parameters } => Value::from(parameters),
            ActionKind::SetProgression(progression) => match &progression.filename {
                Some(filename) => json!(filename),
                None => Value::Object(self.payload()),
            },
            _ => return None,
        };
        Some(ValidationTarget::new(self.message_type(), target))
    }

    /// Validation ids of other settings this kind changes on the remote.
    ///
    /// A movie with `parameters` or `directory` leaves HAL on those values.
    pub fn side_effects(&self) -> Vec<&'static str> {
        let mut ids = Vec::new();
        if let ActionKind::TakeMovie(movie) = self {
            if movie.parameters.is_some() {
                ids.push(SET_PARAMETERS);
            }
            if movie.directory.is_some() {
                ids.push(SET_DIRECTORY);
            }
        }
        ids
    }

    /// Cancel message to send when aborted mid-flight.
    pub fn abort_message(&self) -> Option<Message> {
        match self {
            ActionKind::TakeMovie(_) => Some(Message::empty(ABORT_MOVIE)),
            _ => None,
        }
    }

    /// Threshold check applied to a matching, error-free reply.
    ///
    /// Returns the error text when the measured value is below the minimum.
    pub fn threshold_violation(&self, reply: &Message) -> Option<String> {
        match self {
            ActionKind::FindSum { min_sum } => {
                let found = reply.response_f64("found_sum")?;
                (found <= *min_sum).then(|| {
                    format!(
                        "Found sum {} is smaller than minimum sum {}",
                        found, min_sum
                    )
                })
            }
            ActionKind::TakeMovie(movie) => {
                let found = reply.response_f64("found_spots")?;
                (found < movie.min_spots as f64).then(|| {
                    format!(
                        "{} found molecules is less than the target: {}",
                        found, movie.min_spots
                    )
                })
            }
            _ => None,
        }
    }

    /// Soft failure check for kinds whose errors are warnings.
    pub fn warning(&self, reply: &Message) -> Option<String> {
        match self {
            ActionKind::CheckFocus(_) if !reply.is_test() => {
                let locked = reply.response("focus_status").and_then(Value::as_bool);
                (locked != Some(true)).then(|| "The focus is not locked.".to_string())
            }
            _ => None,
        }
    }

    /// Short human description.
    pub fn describe(&self) -> String {
        match self {
            ActionKind::CheckFocus(check) => format!(
                "confirm focus ({} s window)",
                f64::from(check.num_focus_checks) / 10.0
            ),
            ActionKind::ClearWarnings => "clear warnings".to_string(),
            ActionKind::Delay { delay_ms } => format!("pause for {}ms", delay_ms),
            ActionKind::FindSum { min_sum } => format!("find sum (minimum sum = {})", min_sum),
            ActionKind::MoveStage { stage_x, stage_y } => {
                format!("move stage to {}, {}", stage_x, stage_y)
            }
            ActionKind::Pause => "pause".to_string(),
            ActionKind::RecenterPiezo => "recenter piezo".to_string(),
            ActionKind::SetDirectory { directory } => format!("change directory to {}", directory),
            ActionKind::SetFocusLockTarget { lock_target } => {
                format!("set focus lock target to {}", lock_target)
            }
            ActionKind::SetParameters { parameters } => format!("set parameters to {}", parameters),
            ActionKind::SetProgression(progression) => {
                format!("set progressions to {}", progression.kind)
            }
            ActionKind::TakeMovie(movie) if movie.min_spots > 0 => format!(
                "take movie {}, {} frames, {} minimum spots",
                movie.name, movie.length, movie.min_spots
            ),
            ActionKind::TakeMovie(movie) => {
                format!("take movie {}, {} frames", movie.name, movie.length)
            }
            ActionKind::ValveProtocol { name } => format!("valve protocol {}", name),
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}
