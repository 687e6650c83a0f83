//! Tag registry and descriptor dispatch.
//!
//! Descriptors are routed to Action kinds in one of two ways:
//!
//! 1. **Tagged** - the descriptor carries an `action` key naming an [`ActionTag`].
//!    Only that kind is tried; keys it does not know are ignored.
//! 2. **Untagged** - every kind in [`BUILD_ORDER`] is offered the descriptor. A kind
//!    accepts when it can parse the descriptor AND every non-meta key is one it
//!    recognises. Exactly one acceptor is required: none is a
//!    [`DaveError::Descriptor`], several is a [`DaveError::AmbiguousDescriptor`].
//!
//! Loading is all-or-nothing; a single rejected descriptor fails the whole batch.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

use crate::action::{Action, ActionKind};
use crate::config::TimingConfig;
use crate::descriptor::Descriptor;
use crate::error::{AppResult, DaveError};

/// Explicit tag for each Action kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTag {
    /// `delay`
    Delay,
    /// `find_sum`
    FindSum,
    /// `move_stage`
    MoveStage,
    /// `pause`
    Pause,
    /// `recenter_piezo`
    RecenterPiezo,
    /// `set_directory`
    SetDirectory,
    /// `set_focus_lock_target`
    SetFocusLockTarget,
    /// `set_parameters`
    SetParameters,
    /// `set_progression`
    SetProgression,
    /// `take_movie`
    TakeMovie,
    /// `valve_protocol`
    ValveProtocol,
    /// `check_focus`
    CheckFocus,
    /// `clear_warnings`
    ClearWarnings,
}

/// Fixed order in which untagged descriptors are offered to each kind.
pub const BUILD_ORDER: [ActionTag; 13] = [
    ActionTag::Delay,
    ActionTag::FindSum,
    ActionTag::MoveStage,
    ActionTag::Pause,
    ActionTag::RecenterPiezo,
    ActionTag::SetDirectory,
    ActionTag::SetFocusLockTarget,
    ActionTag::SetParameters,
    ActionTag::SetProgression,
    ActionTag::TakeMovie,
    ActionTag::ValveProtocol,
    ActionTag::CheckFocus,
    ActionTag::ClearWarnings,
];

impl ActionTag {
    /// Tag string used in descriptors.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionTag::Delay => "delay",
            ActionTag::FindSum => "find_sum",
            ActionTag::MoveStage => "move_stage",
            ActionTag::Pause => "pause",
            ActionTag::RecenterPiezo => "recenter_piezo",
            ActionTag::SetDirectory => "set_directory",
            ActionTag::SetFocusLockTarget => "set_focus_lock_target",
            ActionTag::SetParameters => "set_parameters",
            ActionTag::SetProgression => "set_progression",
            ActionTag::TakeMovie => "take_movie",
            ActionTag::ValveProtocol => "valve_protocol",
            ActionTag::CheckFocus => "check_focus",
            ActionTag::ClearWarnings => "clear_warnings",
        }
    }

    /// Non-meta keys this kind understands.
    pub fn recognised_keys(&self) -> &'static [&'static str] {
        match self {
            ActionTag::Delay => &["delay"],
            ActionTag::FindSum => &["find_sum", "min_sum"],
            ActionTag::MoveStage => &["stage_x", "stage_y"],
            ActionTag::Pause => &["pause"],
            ActionTag::RecenterPiezo => &["recenter"],
            ActionTag::SetDirectory => &["directory"],
            ActionTag::SetFocusLockTarget => &["lock_target"],
            ActionTag::SetParameters => &["parameters"],
            ActionTag::SetProgression => &["progression", "type", "filename", "channels"],
            ActionTag::TakeMovie => &[
                "name",
                "length",
                "min_spots",
                "parameters",
                "directory",
                "overwrite",
            ],
            ActionTag::ValveProtocol => &["valve_protocol", "name"],
            ActionTag::CheckFocus => &["check_focus"],
            ActionTag::ClearWarnings => &["clear_warnings"],
        }
    }

    /// Strict acceptance used for untagged descriptors.
    pub fn accepts(&self, descriptor: &Descriptor) -> Option<ActionKind> {
        let recognised = self.recognised_keys();
        if descriptor.data_keys().any(|key| !recognised.contains(&key)) {
            return None;
        }
        ActionKind::parse(*self, descriptor)
    }
}

impl std::fmt::Display for ActionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ActionTag {
    type Err = DaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BUILD_ORDER
            .iter()
            .copied()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| DaveError::UnknownTag(s.to_string()))
    }
}

/// Resolve the kind for the descriptor at `index`.
pub fn resolve_kind(index: usize, descriptor: &Descriptor) -> AppResult<ActionKind> {
    if let Some(tag) = descriptor.tag() {
        let tag: ActionTag = tag.parse()?;
        return ActionKind::parse(tag, descriptor).ok_or_else(|| DaveError::Descriptor {
            index,
            reason: format!("missing or invalid keys for '{}'", tag),
        });
    }

    let accepted: Vec<(ActionTag, ActionKind)> = BUILD_ORDER
        .iter()
        .filter_map(|tag| tag.accepts(descriptor).map(|kind| (*tag, kind)))
        .collect();
    select_single(index, descriptor, accepted)
}

fn select_single(
    index: usize,
    descriptor: &Descriptor,
    mut accepted: Vec<(ActionTag, ActionKind)>,
) -> AppResult<ActionKind> {
    match accepted.len() {
        0 => Err(DaveError::Descriptor {
            index,
            reason: format!(
                "no action kind accepts keys [{}]",
                descriptor.data_keys().collect::<Vec<_>>().join(", ")
            ),
        }),
        1 => {
            let (tag, kind) = accepted.remove(0);
            debug!(index, tag = %tag, "Descriptor accepted");
            Ok(kind)
        }
        _ => Err(DaveError::AmbiguousDescriptor {
            index,
            kinds: accepted
                .iter()
                .map(|(tag, _)| tag.as_str().to_string())
                .collect(),
        }),
    }
}

/// Build a fresh Action for the descriptor at `index`.
pub fn build_action(
    index: usize,
    descriptor: &Descriptor,
    timing: &TimingConfig,
) -> AppResult<Action> {
    let kind = resolve_kind(index, descriptor)?;
    let mut action = Action::new(kind, timing);
    if let Some(pause) = descriptor.pause_after() {
        action.set_pause_after_completion(pause);
    }
    if let Some(pause) = descriptor.pause_after_error() {
        action.set_pause_after_error(pause);
    }
    Ok(action)
}

/// Build every descriptor, failing on the first rejection.
pub fn build_all(descriptors: &[Descriptor], timing: &TimingConfig) -> AppResult<Vec<Action>> {
    descriptors
        .iter()
        .enumerate()
        .map(|(index, descriptor)| build_action(index, descriptor, timing))
        .collect()
}
