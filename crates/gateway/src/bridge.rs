//! Event bridge: bus → client fan-out.
//!
//! Subscribes to the bridged topic catalog on the upstream bus, one task per
//! topic, and routes each event to the authorized subscribers of its topic.

use crate::authz::AuthorizationFilter;
use crate::bus::{BusMessage, BusStream, Event, EventBus};
use crate::connection::{Connection, ConnectionRegistry, DeliveryError};
use crate::error::{GatewayError, Result};
use futures::future::join_all;
use futures::StreamExt;
use gateway_common::{Frame, ServerMessage};
use metrics::counter;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Version of [`BRIDGED_TOPICS`]. Bump when the catalog changes.
pub const CATALOG_VERSION: u32 = 1;

/// Upstream topics forwarded to clients.
pub const BRIDGED_TOPICS: &[&str] = &[
    "user.created",
    "user.updated",
    "user.deleted",
    "assessment.created",
    "assessment.updated",
    "assessment.deleted",
    "assessment.published",
    "submission.created",
    "submission.updated",
    "submission.submitted",
    "submission.graded",
    "grading.completed",
    "grading.failed",
    "grading.feedback.updated",
    "notification.created",
];

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Queued for delivery.
    pub delivered: usize,
    /// Rejected by the authorization filter.
    pub filtered: usize,
    /// Dropped because the subscriber's queue was full.
    pub dropped: usize,
    /// Subscribers whose session was gone; removed from the registry.
    pub removed: usize,
}

/// Routes bus events to subscribed, authorized connections.
pub struct EventBridge {
    registry: Arc<ConnectionRegistry>,
    filter: AuthorizationFilter,
    bus: Arc<dyn EventBus>,
    topics: Vec<String>,
}

impl EventBridge {
    /// Bridge the full [`BRIDGED_TOPICS`] catalog.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        filter: AuthorizationFilter,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            registry,
            filter,
            bus,
            topics: BRIDGED_TOPICS.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn bus(&self) -> Arc<dyn EventBus> {
        Arc::clone(&self.bus)
    }

    /// Subscribe to every catalog topic and spawn one task per subscription.
    ///
    /// A topic that cannot be subscribed is logged and skipped; the call only
    /// fails when no topic could be subscribed at all.
    pub async fn start(self: Arc<Self>, shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        info!(
            "Starting EventBridge, catalog v{} ({} topics)",
            CATALOG_VERSION,
            self.topics.len()
        );

        let mut handles = Vec::with_capacity(self.topics.len());
        for topic in &self.topics {
            match self.bus.subscribe_topic(topic).await {
                Ok(stream) => {
                    let bridge = Arc::clone(&self);
                    let topic = topic.clone();
                    let shutdown = shutdown.clone();
                    handles.push(tokio::spawn(async move {
                        bridge.run_subscription(topic, stream, shutdown).await;
                    }));
                }
                Err(e) => error!("Failed to subscribe to bus topic {}: {}", topic, e),
            }
        }

        if handles.is_empty() && !self.topics.is_empty() {
            return Err(GatewayError::Bus(
                "no bridged topic could be subscribed".to_string(),
            ));
        }

        info!("EventBridge running with {} subscriptions", handles.len());
        Ok(handles)
    }

    async fn run_subscription(
        self: Arc<Self>,
        topic: String,
        mut stream: BusStream,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Bus subscription {} shutting down", topic);
                    break;
                }

                msg = stream.next() => {
                    match msg {
                        Some(msg) => {
                            if let Err(e) = self.handle_bus_message(msg).await {
                                warn!("Failed to handle bus message on {}: {}", topic, e);
                            }
                        }
                        None => {
                            warn!("Bus subscription {} ended unexpectedly", topic);
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Decode one bus message and broadcast it.
    pub async fn handle_bus_message(&self, msg: BusMessage) -> Result<BroadcastReport> {
        counter!("gateway_events_received_total").increment(1);
        let event = msg.decode().inspect_err(|_| {
            counter!("gateway_bus_decode_errors_total").increment(1);
        })?;
        self.broadcast(&event).await
    }

    /// Deliver an event to every authorized subscriber of its topic.
    ///
    /// The filter runs once per candidate. Delivery never waits: a full queue
    /// drops the event for that subscriber only, and a closed queue removes
    /// the connection.
    pub async fn broadcast(&self, event: &Event) -> Result<BroadcastReport> {
        let mut report = BroadcastReport::default();

        let candidates: Vec<Arc<Connection>> = self
            .registry
            .subscribers_of(&event.topic)
            .iter()
            .filter_map(|id| self.registry.get(id))
            .collect();
        if candidates.is_empty() {
            debug!("No subscribers for {}", event.topic);
            return Ok(report);
        }

        let decisions = join_all(candidates.iter().map(|connection| async move {
            match connection.principal() {
                Some(principal) => {
                    self.filter
                        .may_receive(&principal, &event.topic, &event.payload)
                        .await
                }
                None => false,
            }
        }))
        .await;

        // Pre-serialize once
        let json = ServerMessage::Event {
            event_type: event.topic.clone(),
            data: event.payload.clone(),
            timestamp: event.timestamp.timestamp_millis(),
        }
        .to_json()?;

        for (connection, allowed) in candidates.iter().zip(decisions) {
            if !allowed {
                report.filtered += 1;
                continue;
            }
            match connection.try_deliver(Frame::Text(json.clone())) {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::Full) => {
                    warn!(connection_id = %connection.id, topic = %event.topic, "Outbound queue full, dropping event");
                    counter!("gateway_send_failures_total").increment(1);
                    report.dropped += 1;
                }
                Err(DeliveryError::Closed) => {
                    debug!(connection_id = %connection.id, "Session gone, removing connection");
                    counter!("gateway_send_failures_total").increment(1);
                    self.registry.remove(&connection.id);
                    report.removed += 1;
                }
            }
        }

        counter!("gateway_events_delivered_total").increment(report.delivered as u64);
        counter!("gateway_events_filtered_total").increment(report.filtered as u64);
        debug!(
            "Broadcast {} to {} of {} subscribers",
            event.topic,
            report.delivered,
            candidates.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::DenyAllDirectory;
    use crate::auth::Role;
    use crate::bus::InMemoryBus;
    use crate::connection::tests::{principal, test_connection};
    use crate::ws_server::tests::test_state;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn bridge_with(registry: Arc<ConnectionRegistry>, bus: Arc<dyn EventBus>) -> Arc<EventBridge> {
        let filter = AuthorizationFilter::new(Arc::new(DenyAllDirectory));
        Arc::new(EventBridge::new(registry, filter, bus))
    }

    fn authenticated(
        registry: &ConnectionRegistry,
        buffer: usize,
        user: &str,
        role: Role,
        topic: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let (connection, rx) = test_connection(buffer);
        let id = registry.register(connection.clone()).unwrap();
        registry.authenticate(&id, principal(user, role));
        registry.subscribe(&id, topic);
        (connection, rx)
    }

    fn event_json(frame: Frame) -> Value {
        match frame {
            Frame::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn test_catalog_has_no_duplicates() {
        let mut topics = BRIDGED_TOPICS.to_vec();
        topics.sort_unstable();
        topics.dedup();
        assert_eq!(topics.len(), BRIDGED_TOPICS.len());
    }

    #[tokio::test]
    async fn test_published_assessment_reaches_teacher_not_unenrolled_student() {
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = bridge_with(registry.clone(), Arc::new(InMemoryBus::new()));
        let (_teacher, mut teacher_rx) =
            authenticated(&registry, 4, "t1", Role::Teacher, "assessment.published");
        let (_student, mut student_rx) =
            authenticated(&registry, 4, "s1", Role::Student, "assessment.published");

        let payload = json!({"status": "PUBLISHED", "courseId": "c1"});
        let report = bridge
            .broadcast(&Event::new("assessment.published", payload.clone()))
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.filtered, 1);

        let msg = event_json(teacher_rx.try_recv().unwrap());
        assert_eq!(msg["type"], "event");
        assert_eq!(msg["eventType"], "assessment.published");
        assert_eq!(msg["data"], payload);
        assert!(msg["timestamp"].is_i64());
        assert!(student_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribed_and_unauthenticated_connections_get_nothing() {
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = bridge_with(registry.clone(), Arc::new(InMemoryBus::new()));
        let (_other, mut other_rx) =
            authenticated(&registry, 4, "root", Role::Admin, "user.created");
        let (cleared, mut cleared_rx) =
            authenticated(&registry, 4, "root2", Role::Admin, "user.updated");
        registry.deauthenticate(&cleared.id);

        let report = bridge
            .broadcast(&Event::new("user.updated", json!({"userId": "u1"})))
            .await
            .unwrap();
        assert_eq!(report, BroadcastReport { filtered: 1, ..Default::default() });
        assert!(other_rx.try_recv().is_err());
        assert!(cleared_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_consumer_does_not_block_others() {
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = bridge_with(registry.clone(), Arc::new(InMemoryBus::new()));
        let (slow, _slow_rx) = authenticated(&registry, 1, "u1", Role::Student, "notification.created");
        slow.try_deliver(Frame::Ping).unwrap();
        let (_gone, gone_rx) = authenticated(&registry, 4, "u1", Role::Student, "notification.created");
        drop(gone_rx);
        let (_ok, mut ok_rx) = authenticated(&registry, 4, "u1", Role::Student, "notification.created");

        let report = bridge
            .broadcast(&Event::new("notification.created", json!({"userId": "u1"})))
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.removed, 1);
        assert!(ok_rx.try_recv().is_ok());

        // The slow consumer stays registered; the dead one is gone
        assert_eq!(registry.connection_count(), 2);
        assert!(registry.get(&slow.id).is_some());
        assert_eq!(registry.subscribers_of("notification.created").len(), 2);
    }

    #[tokio::test]
    async fn test_undecodable_bus_message_is_an_error() {
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = bridge_with(registry, Arc::new(InMemoryBus::new()));
        let msg = BusMessage {
            topic: "user.created".to_string(),
            payload: bytes::Bytes::from_static(b"not json"),
        };
        assert!(matches!(
            bridge.handle_bus_message(msg).await,
            Err(GatewayError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_start_bridges_catalog_until_shutdown() {
        let registry = Arc::new(ConnectionRegistry::new());
        let bus = Arc::new(InMemoryBus::new());
        let bridge = bridge_with(registry.clone(), bus.clone());
        let (_admin, mut rx) = authenticated(&registry, 4, "root", Role::Admin, "user.created");

        let shutdown = CancellationToken::new();
        let handles = bridge.start(shutdown.clone()).await.unwrap();
        assert_eq!(handles.len(), BRIDGED_TOPICS.len());
        assert_eq!(bus.subscriber_count("grading.feedback.updated"), 1);

        bus.publish("user.created", r#"{"eventType":"user.created","data":{"userId":"u5"}}"#);
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event_json(frame)["data"]["userId"], "u5");

        shutdown.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }

    struct UnreachableBus;

    #[async_trait]
    impl EventBus for UnreachableBus {
        async fn subscribe_topic(&self, topic: &str) -> Result<BusStream> {
            Err(GatewayError::Bus(format!("cannot subscribe to {topic}")))
        }
    }

    #[tokio::test]
    async fn test_start_fails_when_nothing_subscribes() {
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = bridge_with(registry, Arc::new(UnreachableBus));
        let result = bridge.start(CancellationToken::new()).await;
        assert!(matches!(result, Err(GatewayError::Bus(_))));
    }

    #[tokio::test]
    async fn test_health_reports_bus_only_when_bridge_runs() {
        let state = test_state();
        let bridge = bridge_with(state.registry.clone(), Arc::new(UnreachableBus));
        let (state, handles) = state.with_bridge(bridge).await;
        assert!(handles.is_empty());
        assert!(state.bus.is_none());
        assert_eq!(state.bus_status(), "degraded");

        let state = test_state();
        let bridge = bridge_with(state.registry.clone(), Arc::new(InMemoryBus::new()));
        let (state, handles) = state.with_bridge(bridge).await;
        assert_eq!(handles.len(), BRIDGED_TOPICS.len());
        assert_eq!(state.bus_status(), "connected");
        state.shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
