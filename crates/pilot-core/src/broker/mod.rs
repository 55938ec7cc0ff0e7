//! Message-queue collaborator seam.
//!
//! The engine only talks to these traits; concrete brokers live outside the core.
//! [`memory::MemoryBroker`] is the in-process implementation.

pub mod memory;
pub use memory::MemoryBroker;

use std::time::Duration;

use async_trait::async_trait;
use pilot_model::{MessageId, Payload};

use crate::error::BrokerError;

/// A message delivered by a subscribe resource.
///
/// The broker keeps ownership of the delivery; `id` is the token used for ack/nack.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Payload,
    /// Set when the broker delivered this message before.
    pub redelivered: bool,
}

impl Message {
    pub fn new(id: impl Into<MessageId>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            payload,
            redelivered: false,
        }
    }
}

/// Opens the per-run publish and subscribe resources.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Subscribe with manual acknowledgment.
    async fn open_sub(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn SubResource>, BrokerError>;

    async fn open_pub(&self, queue: &str) -> Result<Box<dyn PubResource>, BrokerError>;
}

/// Incoming channel with manual acknowledgment.
#[async_trait]
pub trait SubResource: Send + Sync {
    /// Bound for the next [`SubResource::next_message`] call.
    fn set_timeout(&mut self, timeout: Duration);

    /// Next message, or [`BrokerError::NoMessage`] when none arrived within the timeout.
    async fn next_message(&mut self) -> Result<Message, BrokerError>;

    async fn ack(&self, msg: &Message) -> Result<(), BrokerError>;

    /// Reject the delivery; the broker redelivers or dead-letters it.
    async fn nack(&self, msg: &Message) -> Result<(), BrokerError>;

    /// Whether the connection must be probed periodically to stay alive.
    fn needs_keepalive(&self) -> bool {
        false
    }

    async fn keepalive(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Release the channel. Unacknowledged deliveries go back to the broker.
    async fn close(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Outgoing channel.
#[async_trait]
pub trait PubResource: Send + Sync {
    async fn send(&self, payload: &Payload) -> Result<(), BrokerError>;

    fn needs_keepalive(&self) -> bool {
        false
    }

    async fn keepalive(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}
