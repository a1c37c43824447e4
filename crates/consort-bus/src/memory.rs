//! In-process message bus.
//!
//! Every topic is a broadcast channel of encoded envelopes, so messages go
//! through the same encode/decode path as on the wire. Clones share topics:
//! hand one clone to each node of a simulated run.

use async_trait::async_trait;
use futures::stream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use consort_core::{ControlMessage, Qos};

use crate::{
    error::BusError,
    traits::{Channel, MessageBus, MessageStream},
};

const TOPIC_CAPACITY: usize = 1024;

type Topics = Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>;

/// In-memory bus shared by every clone.
#[derive(Clone)]
pub struct MemoryBus {
    topics: Topics,
    connected: Arc<AtomicBool>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }
}

fn sender(topics: &Topics, topic: &str) -> broadcast::Sender<Vec<u8>> {
    topics
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(topic.to_string())
        .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
        .clone()
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn disconnect(&self) -> Result<(), BusError> {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the senders ends every subscription stream.
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    fn channel(&self, topic: &str) -> Box<dyn Channel> {
        Box::new(MemoryChannel {
            topics: self.topics.clone(),
            connected: self.connected.clone(),
            topic: topic.to_string(),
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// One topic of a [`MemoryBus`].
pub struct MemoryChannel {
    topics: Topics,
    connected: Arc<AtomicBool>,
    topic: String,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn publish(&self, message: &ControlMessage, qos: Qos) -> Result<(), BusError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected(format!("publish on {}", self.topic)));
        }
        let payload = message.to_bytes()?;

        debug!(topic = %self.topic, run_id = %message.run_id, ?qos, "Publishing message");
        // A topic without subscribers drops the message, as on a real broker.
        let _ = sender(&self.topics, &self.topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self) -> Result<MessageStream, BusError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected(format!("subscribe to {}", self.topic)));
        }
        let receiver = sender(&self.topics, &self.topic).subscribe();
        let topic = self.topic.clone();

        let stream = stream::unfold(receiver, move |mut receiver| {
            let topic = topic.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => match ControlMessage::from_bytes(&payload) {
                            Ok(message) => return Some((message, receiver)),
                            Err(e) => {
                                warn!(topic = %topic, error = %e, "Dropping undecodable message");
                            }
                        },
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "Subscriber lagged, messages lost");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_subscribers_of_the_topic_only() {
        let bus = MemoryBus::new();
        let mut run = bus.channel("site-a-run").subscribe().await.unwrap();
        let mut other = bus.channel("site-b-run").subscribe().await.unwrap();

        let msg = ControlMessage::data("", "run-1", 1, json!({"x": 1}), false);
        bus.publish("site-a-run", &msg, Qos::AtMostOnce).await.unwrap();

        assert_eq!(run.next().await.unwrap(), msg);
        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(20), other.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_clones_share_topics() {
        let bus = MemoryBus::new();
        let remote = bus.clone();
        let mut register = remote.channel("register").subscribe().await.unwrap();

        bus.publish("register", &ControlMessage::register("site-a", "run-1"), Qos::AtMostOnce)
            .await
            .unwrap();

        let received = register.next().await.unwrap();
        assert_eq!(received.id, "site-a");
    }

    #[tokio::test]
    async fn test_disconnect_ends_streams() {
        let bus = MemoryBus::new();
        let mut stream = bus.channel("run").subscribe().await.unwrap();

        bus.disconnect().await.unwrap();

        assert!(stream.next().await.is_none());
        assert!(!bus.is_connected());
        let result = bus
            .publish("run", &ControlMessage::register("a", "r"), Qos::AtMostOnce)
            .await;
        assert!(matches!(result, Err(BusError::Disconnected(_))));
    }
}
