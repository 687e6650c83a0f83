//! Mock transport and simulated remote service.
//!
//! Provides an in-process stand-in for the HAL / Kilroy connection so sequences
//! can be exercised without a microscope.
//!
//! # Available Mocks
//!
//! - `MockTransport` - records every sent message and forwards replies produced by
//!   an optional responder into the event channel
//! - `SimulatedRemote` - a responder that answers like HAL: echoes the envelope,
//!   reports estimates for test messages and measurement fields for real ones
//!
//! Replies are always delivered through the event channel, never by calling back
//! into the sender, so delivery stays asynchronous as with a real socket.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Transport, TransportError, TransportEvent};
use crate::message::Message;

/// Shared record of every message passed to `send_message`.
pub type SentLog = Arc<Mutex<Vec<Message>>>;

type Responder = Box<dyn FnMut(&Message) -> Option<Message> + Send>;

/// In-memory transport.
///
/// # Example
///
/// ```rust,ignore
/// let (transport, events) = MockTransport::new();
/// let sent = transport.sent_log();
/// let transport = transport.with_responder(SimulatedRemote::default().into_responder());
/// ```
pub struct MockTransport {
    connected: bool,
    sent: SentLog,
    events: mpsc::UnboundedSender<TransportEvent>,
    responder: Option<Responder>,
}

impl MockTransport {
    /// Create a connected transport and the receiving end of its event channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                connected: true,
                sent: Arc::new(Mutex::new(Vec::new())),
                events,
                responder: None,
            },
            rx,
        )
    }

    /// Answer every sent message with the responder's output.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&Message) -> Option<Message> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Start disconnected.
    pub fn disconnected(mut self) -> Self {
        self.connected = false;
        self
    }

    /// Handle on the sent-message record.
    pub fn sent_log(&self) -> SentLog {
        self.sent.clone()
    }

    /// Sender for injecting replies or disconnects from a test.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<TransportEvent> {
        self.events.clone()
    }
}

impl Transport for MockTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            let _ = self.events.send(TransportEvent::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send_message(&mut self, message: &Message) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        debug!(message = %message, "Mock transport sending");
        self.sent.lock().push(message.clone());

        if let Some(responder) = self.responder.as_mut() {
            if let Some(reply) = responder(message) {
                let _ = self.events.send(TransportEvent::MessageReceived(reply));
            }
        }
        Ok(())
    }
}

// =============================================================================
// SimulatedRemote - HAL-like responder
// =============================================================================

/// Simulated HAL / Kilroy endpoint.
///
/// Test messages are answered with `duration` (seconds) and `disk_usage`
/// (kilobytes) estimates. Movies are estimated from `frame_rate_hz` and
/// `frame_size_bytes`; every other command reports `command_duration_s`.
#[derive(Debug, Clone)]
pub struct SimulatedRemote {
    /// Camera frame rate used for movie estimates.
    pub frame_rate_hz: f64,
    /// Bytes per frame used for movie estimates.
    pub frame_size_bytes: f64,
    /// Duration reported for non-movie test messages.
    pub command_duration_s: f64,
    /// `found_sum` reported for "Find Sum".
    pub found_sum: Option<f64>,
    /// `found_spots` reported for "Take Movie".
    pub found_spots: Option<u64>,
    /// `focus_status` reported for "Check Focus Lock".
    pub focus_locked: bool,
    /// Message types that are never answered (missing capability).
    pub silent: HashSet<String>,
    /// Message types answered with an error.
    pub failing: HashMap<String, String>,
}

impl Default for SimulatedRemote {
    fn default() -> Self {
        Self {
            frame_rate_hz: 57.3,
            frame_size_bytes: 256.0 * 256.0 * 2.0,
            command_duration_s: 0.1,
            found_sum: None,
            found_spots: None,
            focus_locked: true,
            silent: HashSet::from(["Abort Movie".to_string()]),
            failing: HashMap::new(),
        }
    }
}

impl SimulatedRemote {
    /// Never answer messages of this type.
    pub fn with_silent(mut self, message_type: impl Into<String>) -> Self {
        self.silent.insert(message_type.into());
        self
    }

    /// Answer messages of this type with an error.
    pub fn with_failure(
        mut self,
        message_type: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        self.failing.insert(message_type.into(), error.into());
        self
    }

    /// Report this many spots for every movie.
    pub fn with_found_spots(mut self, spots: u64) -> Self {
        self.found_spots = Some(spots);
        self
    }

    /// Build the reply HAL would send, or `None` for silence.
    pub fn respond(&self, message: &Message) -> Option<Message> {
        if self.silent.contains(message.message_type()) {
            return None;
        }

        let mut reply = message.clone();
        if let Some(error) = self.failing.get(message.message_type()) {
            let _ = reply.set_error(error.clone());
            return Some(reply);
        }

        if message.is_test() {
            let (duration, disk_usage) = self.estimate(message);
            let _ = reply.set_response("duration", duration);
            let _ = reply.set_response("disk_usage", disk_usage);
            return Some(reply);
        }

        match message.message_type() {
            "Find Sum" => {
                if let Some(sum) = self.found_sum {
                    let _ = reply.set_response("found_sum", sum);
                }
            }
            "Take Movie" => {
                if let Some(spots) = self.found_spots {
                    let _ = reply.set_response("found_spots", spots);
                }
            }
            "Check Focus Lock" => {
                let _ = reply.set_response("focus_status", self.focus_locked);
            }
            _ => {}
        }
        Some(reply)
    }

    /// Consume into a responder closure for [`MockTransport::with_responder`].
    pub fn into_responder(self) -> impl FnMut(&Message) -> Option<Message> + Send + 'static {
        move |message| self.respond(message)
    }

    fn estimate(&self, message: &Message) -> (f64, f64) {
        if message.is_type("Take Movie") {
            let frames = message
                .data("length")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0);
            let duration = frames / self.frame_rate_hz;
            let disk_usage = frames * self.frame_size_bytes / 1000.0;
            (duration, disk_usage)
        } else {
            (self.command_duration_s, 0.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use serde_json::json;

    #[test]
    fn send_records_and_replies() {
        let (transport, mut events) = MockTransport::new();
        let sent = transport.sent_log();
        let mut transport = transport.with_responder(SimulatedRemote::default().into_responder());

        let message = Message::empty("Recenter Piezo");
        transport.send_message(&message).unwrap();

        assert_eq!(sent.lock().len(), 1);
        match events.try_recv().unwrap() {
            TransportEvent::MessageReceived(reply) => assert_eq!(reply.id(), message.id()),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn disconnected_transport_refuses_sends() {
        let (transport, _events) = MockTransport::new();
        let mut transport = transport.disconnected();
        assert_eq!(
            transport.send_message(&Message::empty("Pause")),
            Err(TransportError::NotConnected)
        );
    }

    #[test]
    fn movie_estimates_scale_with_length() {
        let mut payload = Payload::new();
        payload.insert("length".into(), json!(573));
        let message = Message::new("Take Movie", payload).with_test_mode(true);

        let reply = SimulatedRemote::default().respond(&message).unwrap();
        let duration = reply.response_f64("duration").unwrap();
        assert!((duration - 10.0).abs() < 1e-9);
        assert!(reply.response_f64("disk_usage").unwrap() > 0.0);
    }

    #[test]
    fn silent_types_get_no_reply() {
        let remote = SimulatedRemote::default().with_silent("Set Lock Target");
        assert!(remote.respond(&Message::empty("Set Lock Target")).is_none());
    }
}
