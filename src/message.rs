//! Request/response envelope exchanged with the remote control service.
//!
//! A [`Message`] is created once per remote command. Its id is drawn from a
//! process-wide counter at construction and never changes afterwards; the remote
//! echoes the same envelope back with `response` and `error` filled in. Reply
//! matching uses the id only, never the content.
//!
//! The serde field names (`message_id`, `message_type`, `message_data`, ...) are
//! the interop contract with HAL and Kilroy and must not be renamed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Ordered key→value map used for payloads and responses.
pub type Payload = Map<String, Value>;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(0);

/// Unique identity of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    fn next() -> Self {
        MessageId(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Violations of the set-at-most-once rules.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessageError {
    /// `set_error` was called on a message that already carries an error.
    #[error("Message {0} already carries an error")]
    ErrorAlreadySet(MessageId),
    /// `set_response` was called twice for the same key.
    #[error("Response '{key}' already set on message {id}")]
    ResponseAlreadySet {
        /// Message that rejected the write.
        id: MessageId,
        /// Key that was already present.
        key: String,
    },
}

/// A remote command and, once answered, its reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "message_id")]
    id: MessageId,
    message_type: String,
    #[serde(rename = "message_data", default)]
    payload: Payload,
    #[serde(default)]
    test_mode: bool,
    #[serde(default)]
    response: Payload,
    #[serde(default)]
    error: bool,
    #[serde(default)]
    error_message: Option<String>,
}

impl Message {
    /// Create a new message with a fresh id.
    pub fn new(message_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: MessageId::next(),
            message_type: message_type.into(),
            payload,
            test_mode: false,
            response: Payload::new(),
            error: false,
            error_message: None,
        }
    }

    /// Create a message with no payload.
    pub fn empty(message_type: impl Into<String>) -> Self {
        Self::new(message_type, Payload::new())
    }

    /// Builder form of [`set_test_mode`](Self::set_test_mode).
    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    /// Message identity.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Message type, e.g. `"Take Movie"`.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Check the message type.
    pub fn is_type(&self, message_type: &str) -> bool {
        self.message_type == message_type
    }

    /// Request payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Single payload value.
    pub fn data(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Whether the remote should only report validity and estimates.
    pub fn is_test(&self) -> bool {
        self.test_mode
    }

    /// Set the dry-run flag before sending.
    pub fn set_test_mode(&mut self, test_mode: bool) {
        self.test_mode = test_mode;
    }

    /// Flag the message as failed. Allowed once.
    pub fn set_error(&mut self, error_message: impl Into<String>) -> Result<(), MessageError> {
        if self.error {
            return Err(MessageError::ErrorAlreadySet(self.id));
        }
        self.error = true;
        self.error_message = Some(error_message.into());
        Ok(())
    }

    /// Error status.
    pub fn has_error(&self) -> bool {
        self.error
    }

    /// Error text, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Record a response field. Each key may be written once.
    pub fn set_response(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), MessageError> {
        let key = key.into();
        if self.response.contains_key(&key) {
            return Err(MessageError::ResponseAlreadySet { id: self.id, key });
        }
        self.response.insert(key, value.into());
        Ok(())
    }

    /// Response field, `None` when absent.
    pub fn response(&self, key: &str) -> Option<&Value> {
        self.response.get(key)
    }

    /// Numeric response field, `None` when absent or not a number.
    pub fn response_f64(&self, key: &str) -> Option<f64> {
        self.response.get(key).and_then(Value::as_f64)
    }

    /// All response fields.
    pub fn responses(&self) -> &Payload {
        &self.response
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} #{}", self.message_type, self.id)?;
        if self.test_mode {
            write!(f, " (test)")?;
        }
        if let Some(error) = &self.error_message {
            write!(f, " error: {}", error)?;
        }
        Ok(())
    }
}
