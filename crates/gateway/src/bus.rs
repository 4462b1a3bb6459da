//! Upstream event bus.
//!
//! The bus is an opaque publish/subscribe provider with at-least-once
//! delivery. Production uses NATS; tests and local runs use [`InMemoryBus`].

use crate::bridge::BRIDGED_TOPICS;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use nats_client::NatsClient;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Raw message as delivered by the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Subject the message was published on.
    pub topic: String,
    pub payload: Bytes,
}

/// A decoded event ready for fan-out. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

impl BusMessage {
    /// Decode the JSON body.
    ///
    /// An object with a `data` field is an envelope: `data` is the payload
    /// and a string `eventType` naming a bridged topic replaces the subject
    /// as topic. Any other JSON value is the payload itself.
    pub fn decode(&self) -> Result<Event> {
        let body: Value = serde_json::from_slice(&self.payload)?;
        let event = match body {
            Value::Object(mut fields) if fields.contains_key("data") => {
                let topic = match fields.get("eventType").and_then(Value::as_str) {
                    Some(event_type) if BRIDGED_TOPICS.contains(&event_type) => {
                        event_type.to_string()
                    }
                    Some(event_type) => {
                        debug!(
                            "Ignoring eventType {:?} outside the catalog on {}",
                            event_type, self.topic
                        );
                        self.topic.clone()
                    }
                    None => self.topic.clone(),
                };
                let payload = fields.remove("data").unwrap_or(Value::Null);
                Event::new(topic, payload)
            }
            payload => Event::new(self.topic.clone(), payload),
        };
        Ok(event)
    }
}

/// Stream of messages for one subscription.
pub type BusStream = BoxStream<'static, BusMessage>;

/// Subscribe side of the upstream bus.
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    /// Subscribe to one topic.
    async fn subscribe_topic(&self, topic: &str) -> Result<BusStream>;

    /// Whether the bus connection is currently up.
    fn is_connected(&self) -> bool {
        true
    }
}

#[async_trait]
impl EventBus for NatsClient {
    async fn subscribe_topic(&self, topic: &str) -> Result<BusStream> {
        let subscriber = self
            .subscribe(topic)
            .await
            .map_err(|e| GatewayError::Bus(format!("{e:#}")))?;
        Ok(subscriber
            .map(|msg| BusMessage {
                topic: msg.subject.to_string(),
                payload: msg.payload,
            })
            .boxed())
    }

    fn is_connected(&self) -> bool {
        NatsClient::is_connected(self)
    }
}

/// In-process bus. Each published message goes to every current subscriber
/// of its topic.
#[derive(Default)]
pub struct InMemoryBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish to a topic; returns how many subscriptions received it.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let msg = BusMessage {
            topic: topic.to_string(),
            payload: payload.into(),
        };
        let mut subscribers = self.subscribers.lock();
        let Some(senders) = subscribers.get_mut(topic) else {
            debug!("No in-memory subscribers for {}", topic);
            return 0;
        };
        senders.retain(|tx| tx.send(msg.clone()).is_ok());
        senders.len()
    }

    /// Live subscriptions for a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .get(topic)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn subscribe_topic(&self, topic: &str) -> Result<BusStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        })
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(topic: &str, body: Value) -> BusMessage {
        BusMessage {
            topic: topic.to_string(),
            payload: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }

    #[test]
    fn test_decode_plain_payload() {
        let event = message("submission.created", json!({"userId": "u1"}))
            .decode()
            .unwrap();
        assert_eq!(event.topic, "submission.created");
        assert_eq!(event.payload, json!({"userId": "u1"}));
    }

    #[test]
    fn test_decode_envelope() {
        let body = json!({"eventType": "grading.completed", "data": {"userId": "u2"}});
        let event = message("grading.>", body).decode().unwrap();
        assert_eq!(event.topic, "grading.completed");
        assert_eq!(event.payload, json!({"userId": "u2"}));

        let body = json!({"data": {"userId": "u3"}});
        let event = message("notification.created", body).decode().unwrap();
        assert_eq!(event.topic, "notification.created");
        assert_eq!(event.payload, json!({"userId": "u3"}));
    }

    #[test]
    fn test_envelope_cannot_leave_the_catalog() {
        for event_type in ["admin.secrets", "", "grading.*"] {
            let body = json!({"eventType": event_type, "data": {"userId": "u4"}});
            let event = message("submission.created", body).decode().unwrap();
            assert_eq!(event.topic, "submission.created", "{event_type:?}");
        }
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let msg = BusMessage {
            topic: "user.created".to_string(),
            payload: Bytes::from_static(b"\x00\x01not json"),
        };
        assert!(matches!(msg.decode(), Err(GatewayError::Json(_))));
    }

    #[tokio::test]
    async fn test_in_memory_bus_delivers_per_topic() {
        let bus = InMemoryBus::new();
        let mut users = bus.subscribe_topic("user.created").await.unwrap();
        let _grades = bus.subscribe_topic("grading.completed").await.unwrap();
        assert_eq!(bus.subscriber_count("user.created"), 1);

        assert_eq!(bus.publish("user.created", r#"{"userId":"u1"}"#), 1);
        assert_eq!(bus.publish("assessment.created", "{}"), 0);

        let msg = users.next().await.unwrap();
        assert_eq!(msg.topic, "user.created");
        assert_eq!(&msg.payload[..], br#"{"userId":"u1"}"#);

        drop(users);
        assert_eq!(bus.publish("user.created", "{}"), 0);
    }
}
