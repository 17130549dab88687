//! Event transport between nodes.
//!
//! Events are published as JSON [`Envelope`]s on named topics. Every
//! subscriber of a topic receives every envelope published after it
//! subscribed; dropping the [`Subscription`] unsubscribes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{trace, warn};

use taskmesh_core::Message;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bus is closed")]
    Closed,
}

/// A serialized event on a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub payload: Value,
}

impl Envelope {
    pub fn encode<M: Message>(topic: impl Into<String>, message: &M) -> Result<Self, BusError> {
        Ok(Self {
            topic: topic.into(),
            payload: serde_json::to_value(message)?,
        })
    }

    pub fn decode<M: Message>(&self) -> Result<M, BusError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Topic carrying requests of a message kind.
pub fn request_topic<M: Message>() -> String {
    format!("{}.request", M::KIND)
}

/// Topic carrying responses to requests of a message kind.
pub fn response_topic<M: Message>() -> String {
    format!("{}.response", M::KIND)
}

/// Topic carrying unsolicited broadcasts of a message kind.
pub fn broadcast_topic<M: Message>() -> String {
    M::KIND.to_string()
}

/// Receiving side of a topic.
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<Envelope>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, rx: broadcast::Receiver<Envelope>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next envelope. Lagged envelopes are skipped with a warning.
    pub async fn recv(&mut self) -> Result<Envelope, BusError> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Ok(envelope),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = %self.topic, skipped = n, "Subscriber lagged, skipping events");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }

    /// Next envelope that decodes as `M`. Undecodable payloads are skipped.
    pub async fn recv_message<M: Message>(&mut self) -> Result<M, BusError> {
        loop {
            let envelope = self.recv().await?;
            match envelope.decode::<M>() {
                Ok(message) => return Ok(message),
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, "Dropping malformed event");
                }
            }
        }
    }
}

/// Publish/subscribe transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;
}

/// Serialize and publish a message.
pub async fn publish_message<M: Message>(
    transport: &dyn Transport,
    topic: &str,
    message: &M,
) -> Result<(), BusError> {
    transport.publish(Envelope::encode(topic, message)?).await
}

/// In-process transport backed by one broadcast channel per topic.
pub struct LocalBus {
    capacity: usize,
    closed: AtomicBool,
    topics: RwLock<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the sender for a topic.
    async fn sender(&self, topic: &str) -> broadcast::Sender<Envelope> {
        if let Some(sender) = self.topics.read().await.get(topic) {
            return sender.clone();
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Number of live subscribers on a topic.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Refuse further traffic and end every subscription.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.topics.write().await.clear();
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalBus {
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError> {
        self.ensure_open()?;
        let sender = self.sender(&envelope.topic).await;
        let topic = envelope.topic.clone();
        // Publishing with no subscribers is not an error.
        let delivered = sender.send(envelope).unwrap_or(0);
        trace!(topic = %topic, delivered, "Published event");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        self.ensure_open()?;
        let rx = self.sender(topic).await.subscribe();
        Ok(Subscription::new(topic, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_core::{TaskEvent, TaskSpec};

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let bus = LocalBus::new();
        let mut first = bus.subscribe("t").await.unwrap();
        let mut second = bus.subscribe("t").await.unwrap();

        let event = TaskEvent::request(vec![TaskSpec::new("a")], Default::default());
        publish_message(&bus, "t", &event).await.unwrap();

        let a: TaskEvent = first.recv_message().await.unwrap();
        let b: TaskEvent = second.recv_message().await.unwrap();
        assert_eq!(a.header.id, event.header.id);
        assert_eq!(b.task_names(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = LocalBus::new();
        let mut other = bus.subscribe("other").await.unwrap();
        bus.publish(Envelope {
            topic: "t".into(),
            payload: Value::Null,
        })
        .await
        .unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_millis(20), other.recv()).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("t").await.unwrap();
        assert_eq!(bus.subscriber_count("t").await, 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("t").await, 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = LocalBus::new();
        bus.publish(Envelope {
            topic: "nobody".into(),
            payload: Value::Null,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("t").await.unwrap();
        bus.close().await;

        assert!(matches!(sub.recv().await, Err(BusError::Closed)));
        assert!(matches!(
            bus.publish(Envelope {
                topic: "t".into(),
                payload: Value::Null
            })
            .await,
            Err(BusError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_skipped() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("t").await.unwrap();
        bus.publish(Envelope {
            topic: "t".into(),
            payload: serde_json::json!({"garbage": true}),
        })
        .await
        .unwrap();
        let event = TaskEvent::request(vec![TaskSpec::new("b")], Default::default());
        publish_message(&bus, "t", &event).await.unwrap();

        let got: TaskEvent = sub.recv_message().await.unwrap();
        assert_eq!(got.task_names(), vec!["b"]);
    }
}
