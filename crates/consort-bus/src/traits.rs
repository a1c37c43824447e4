//! Traits for message bus implementations.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use consort_core::{ControlMessage, Qos};

use crate::error::BusError;

/// Stream of decoded messages from one topic.
pub type MessageStream = Pin<Box<dyn Stream<Item = ControlMessage> + Send>>;

/// A communication channel for a specific topic.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Publish a message to this channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded or the transport
    /// rejects it. With [`Qos::AtLeastOnce`] the call also fails when the
    /// transport cannot confirm delivery to the server.
    async fn publish(&self, message: &ControlMessage, qos: Qos) -> Result<(), BusError>;

    /// Subscribe to messages on this channel.
    ///
    /// Only messages published after the subscription is established are
    /// delivered. Payloads that do not decode are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established.
    async fn subscribe(&self) -> Result<MessageStream, BusError>;
}

/// Topic-per-client publish/subscribe bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Disconnect from the bus.
    async fn disconnect(&self) -> Result<(), BusError>;

    /// Create a channel for a topic.
    fn channel(&self, topic: &str) -> Box<dyn Channel>;

    /// Check if connected.
    fn is_connected(&self) -> bool;

    /// Publish one message on `topic`.
    async fn publish(
        &self,
        topic: &str,
        message: &ControlMessage,
        qos: Qos,
    ) -> Result<(), BusError> {
        self.channel(topic).publish(message, qos).await
    }
}
