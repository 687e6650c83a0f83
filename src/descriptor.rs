//! Untyped sequence descriptors and the JSON sequence loader.
//!
//! A [`Descriptor`] is an ordered key→value map describing one step of a sequence.
//! The engine treats it opaquely: each Action kind inspects the keys it knows and
//! either accepts the descriptor or declines (see [`crate::registry`]).
//!
//! A handful of meta keys are shared by every kind and never count as payload:
//!
//! - `action` - explicit kind tag; when present, dispatch goes straight to that kind
//! - `pause_after` - pause the sequence once this step completes
//! - `pause_after_error` - pause when this step errors (default `true`)
//!
//! Sequence files are JSON, either a bare array of descriptors or an object with an
//! `actions` array:
//!
//! ```json
//! { "name": "overnight", "actions": [ {"directory": "D1"}, {"name": "m1", "length": 10} ] }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

use crate::error::{AppResult, DaveError};

/// Key holding the explicit kind tag.
pub const TAG_KEY: &str = "action";
/// Key requesting a pause after completion.
pub const PAUSE_AFTER_KEY: &str = "pause_after";
/// Key controlling the pause after an error.
pub const PAUSE_AFTER_ERROR_KEY: &str = "pause_after_error";
/// Optional human label, shown in warning summaries.
pub const LABEL_KEY: &str = "label";

const META_KEYS: [&str; 4] = [TAG_KEY, PAUSE_AFTER_KEY, PAUSE_AFTER_ERROR_KEY, LABEL_KEY];

/// One step of a sequence, as read from a sequence file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor(Map<String, Value>);

impl Descriptor {
    /// Empty descriptor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert or replace a key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Raw value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Presence check.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Keys that are not meta keys, in insertion order.
    pub fn data_keys(&self) -> impl Iterator<Item = &str> {
        self.0
            .keys()
            .map(String::as_str)
            .filter(|key| !META_KEYS.contains(key))
    }

    /// Explicit kind tag.
    pub fn tag(&self) -> Option<&str> {
        self.str(TAG_KEY)
    }

    /// Optional label.
    pub fn label(&self) -> Option<&str> {
        self.str(LABEL_KEY)
    }

    /// `pause_after` override.
    pub fn pause_after(&self) -> Option<bool> {
        self.bool(PAUSE_AFTER_KEY)
    }

    /// `pause_after_error` override.
    pub fn pause_after_error(&self) -> Option<bool> {
        self.bool(PAUSE_AFTER_ERROR_KEY)
    }

    /// Float value; numeric strings are accepted.
    pub fn f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Signed integer value; numeric strings are accepted.
    pub fn i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Unsigned integer value; numeric strings are accepted.
    pub fn u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String value.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Boolean value; `"true"`/`"false"` strings are accepted.
    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<Map<String, Value>> for Descriptor {
    fn from(map: Map<String, Value>) -> Self {
        Descriptor(map)
    }
}

impl TryFrom<Value> for Descriptor {
    type Error = DaveError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Descriptor(map)),
            other => Err(DaveError::Descriptor {
                index: 0,
                reason: format!("expected an object, found {}", other),
            }),
        }
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SequenceDocument {
    Bare(Vec<Descriptor>),
    Named {
        #[serde(default)]
        name: Option<String>,
        actions: Vec<Descriptor>,
    },
}

/// A sequence file read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceFile {
    /// Name from the file, or the file stem.
    pub name: String,
    /// Descriptors in file order.
    pub descriptors: Vec<Descriptor>,
}

impl SequenceFile {
    /// Parse a sequence from JSON text.
    pub fn parse(name: &str, json: &str) -> AppResult<Self> {
        let document: SequenceDocument = serde_json::from_str(json)?;
        Ok(match document {
            SequenceDocument::Bare(descriptors) => Self {
                name: name.to_string(),
                descriptors,
            },
            SequenceDocument::Named {
                name: file_name,
                actions,
            } => Self {
                name: file_name.unwrap_or_else(|| name.to_string()),
                descriptors: actions,
            },
        })
    }

    /// Read and parse a sequence file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sequence".to_string());
        Self::parse(&stem, &json)
    }
}
