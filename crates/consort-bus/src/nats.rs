//! NATS message bus implementation.

use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

use consort_core::{ControlMessage, Qos};

use crate::{
    error::BusError,
    traits::{Channel, MessageBus, MessageStream},
};

/// Delay between reconnect attempts after a dropped connection.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// NATS-based message bus.
///
/// NATS core has no per-message QoS; [`Qos::AtLeastOnce`] publishes are
/// flushed to the server before returning.
pub struct NatsBus {
    client: Client,
    url: String,
}

impl NatsBus {
    /// Connect to a NATS server as `client_id`.
    ///
    /// The initial connection is not retried: a node that never reached the
    /// bus cannot register anywhere. Connections that drop later are
    /// re-established every [`RECONNECT_DELAY`].
    ///
    /// # Errors
    ///
    /// Returns an error if connection fails.
    pub async fn connect(url: &str, client_id: &str) -> Result<Self, BusError> {
        info!(url = %url, client_id = %client_id, "Connecting to NATS");

        let client = ConnectOptions::new()
            .name(client_id)
            .reconnect_delay_callback(|_attempts| RECONNECT_DELAY)
            .event_callback(|event| async move {
                match event {
                    Event::Connected => info!("NATS connection up"),
                    Event::Disconnected => warn!("NATS connection down, reconnecting"),
                    other => debug!(event = %other, "NATS event"),
                }
            })
            .connect(url)
            .await
            .map_err(|e| BusError::ConnectionFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        info!("Connected to NATS");

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    /// Get the connection URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn disconnect(&self) -> Result<(), BusError> {
        info!("Disconnecting from NATS");
        self.client
            .drain()
            .await
            .map_err(|e| BusError::Disconnected(e.to_string()))
    }

    fn channel(&self, topic: &str) -> Box<dyn Channel> {
        Box::new(NatsChannel {
            client: self.client.clone(),
            topic: topic.to_string(),
        })
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}

/// A NATS channel for a specific topic.
pub struct NatsChannel {
    client: Client,
    topic: String,
}

#[async_trait]
impl Channel for NatsChannel {
    async fn publish(&self, message: &ControlMessage, qos: Qos) -> Result<(), BusError> {
        let payload = message.to_bytes()?;

        debug!(topic = %self.topic, run_id = %message.run_id, ?qos, "Publishing message");

        self.client
            .publish(self.topic.clone(), payload.into())
            .await
            .map_err(|e| BusError::publish(&self.topic, e))?;

        if qos == Qos::AtLeastOnce {
            self.client
                .flush()
                .await
                .map_err(|e| BusError::publish(&self.topic, e))?;
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<MessageStream, BusError> {
        debug!(topic = %self.topic, "Subscribing to topic");

        let subscriber = self
            .client
            .subscribe(self.topic.clone())
            .await
            .map_err(|e| BusError::subscribe(&self.topic, e))?;

        let topic = self.topic.clone();
        let stream = subscriber.filter_map(move |msg| {
            let decoded = ControlMessage::from_bytes(&msg.payload);
            if let Err(e) = &decoded {
                warn!(topic = %topic, error = %e, "Dropping undecodable message");
            }
            async move { decoded.ok() }
        });

        Ok(Box::pin(stream))
    }
}
