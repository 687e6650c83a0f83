//! Boundary to the live connection with the remote control service.
//!
//! The engine never opens sockets itself. A [`Transport`] implementation owns the
//! connection and pushes inbound traffic into an unbounded channel of
//! [`TransportEvent`]s that the host loop forwards to the
//! [`Sequencer`](crate::sequencer::Sequencer).
//!
//! Only one Action may be subscribed to inbound replies at a time. That rule is
//! enforced explicitly by [`ReplyRoute`] rather than implied by delivery order.

pub mod mock;

use thiserror::Error;

use crate::message::{Message, MessageId};

/// Transport failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Operation requires an open connection.
    #[error("Transport is not connected")]
    NotConnected,
    /// Connecting failed.
    #[error("Failed to connect: {0}")]
    Connect(String),
    /// Writing a message failed.
    #[error("Failed to send message: {0}")]
    Send(String),
    /// A second subscriber tried to claim the reply route.
    #[error("Reply route already held by message {0}")]
    AlreadySubscribed(MessageId),
}

/// Inbound traffic from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A reply arrived.
    MessageReceived(Message),
    /// The connection dropped.
    Disconnected,
}

/// Live channel to HAL / Kilroy.
///
/// `send_message` must not block; replies are delivered later as
/// [`TransportEvent::MessageReceived`].
pub trait Transport: Send {
    /// Open the connection.
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the connection.
    fn disconnect(&mut self);

    /// Connection status.
    fn is_connected(&self) -> bool;

    /// Queue a message for delivery.
    fn send_message(&mut self, message: &Message) -> Result<(), TransportError>;
}

/// Single-subscriber reply route.
///
/// The subscriber is identified by the id of the message it sent; every inbound
/// message is handed to that subscriber, which decides whether the id matches.
#[derive(Debug, Default)]
pub struct ReplyRoute {
    owner: Option<MessageId>,
}

impl ReplyRoute {
    /// Claim the route. Fails if another Action still holds it.
    pub fn subscribe(&mut self, owner: MessageId) -> Result<(), TransportError> {
        match self.owner {
            Some(current) => Err(TransportError::AlreadySubscribed(current)),
            None => {
                self.owner = Some(owner);
                Ok(())
            }
        }
    }

    /// Release the route, returning the previous holder.
    pub fn unsubscribe(&mut self) -> Option<MessageId> {
        self.owner.take()
    }

    /// Current holder.
    pub fn owner(&self) -> Option<MessageId> {
        self.owner
    }
}
