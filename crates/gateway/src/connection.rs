//! Connection state and registry.
//!
//! The registry exclusively owns every [`Connection`] record. Each record owns
//! the sending half of its connection's bounded outbound queue; the transport
//! channel itself stays with the connection's session task.
//!
//! Topic membership is kept in two places that must agree: the connection's
//! own topic set and the [`SubscriptionRouter`] index. Both are only changed
//! while holding the connection's topic lock, so every registry operation is
//! atomic with respect to that invariant.

use crate::auth::Principal;
use crate::error::{GatewayError, Result};
use crate::subscription::SubscriptionRouter;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gateway_common::{Frame, TransportKind};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque connection identifier.
pub type ConnectionId = Uuid;

/// Default buffer size for per-connection outbound queues.
pub const CLIENT_CHANNEL_BUFFER_SIZE: usize = 256;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Authenticating,
    Authenticated,
    Closing,
    Closed,
}

/// Why an enqueue to a connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Outbound queue is full (slow consumer).
    Full,
    /// Session task is gone.
    Closed,
}

#[derive(Debug)]
struct Session {
    state: ConnectionState,
    principal: Option<Principal>,
}

#[derive(Debug, Default)]
pub(crate) struct TopicSet {
    pub(crate) topics: HashSet<String>,
    /// Set once the connection is removed; no further subscriptions.
    pub(crate) closed: bool,
}

/// One logical client session, independent of transport.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub transport: TransportKind,
    pub created_at: DateTime<Utc>,
    session: RwLock<Session>,
    topics: Mutex<TopicSet>,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    /// Epoch millis of the last inbound activity.
    last_liveness: AtomicI64,
}

impl Connection {
    /// Create a connection with a fresh random id.
    pub fn new(
        transport: TransportKind,
        outbound: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            transport,
            created_at: now,
            session: RwLock::new(Session {
                state: ConnectionState::Connecting,
                principal: None,
            }),
            topics: Mutex::new(TopicSet::default()),
            outbound,
            cancel,
            last_liveness: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.session.read().state
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.session.write().state = state;
    }

    pub fn principal(&self) -> Option<Principal> {
        self.session.read().principal.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.read().principal.is_some()
    }

    /// Enter `Authenticating`, keeping any current principal until decided.
    pub fn begin_authentication(&self) {
        self.session.write().state = ConnectionState::Authenticating;
    }

    fn attach_principal(&self, principal: Principal) {
        let mut session = self.session.write();
        session.principal = Some(principal);
        session.state = ConnectionState::Authenticated;
    }

    fn clear_principal(&self) {
        let mut session = self.session.write();
        session.principal = None;
        if matches!(
            session.state,
            ConnectionState::Authenticating | ConnectionState::Authenticated
        ) {
            session.state = ConnectionState::Open;
        }
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.lock().topics.contains(topic)
    }

    pub(crate) fn lock_topics(&self) -> MutexGuard<'_, TopicSet> {
        self.topics.lock()
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        self.last_liveness
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Epoch millis of the last inbound activity.
    pub fn last_liveness_ms(&self) -> i64 {
        self.last_liveness.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn set_last_liveness_ms(&self, millis: i64) {
        self.last_liveness.store(millis, Ordering::Relaxed);
    }

    /// Queue a frame without waiting. Never blocks the caller.
    pub fn try_deliver(&self, frame: Frame) -> std::result::Result<(), DeliveryError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Ask the session task to shut down.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection has been cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// Lock-free registry of live connections plus the topic index.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    router: SubscriptionRouter,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            router: SubscriptionRouter::new(),
        }
    }

    /// Insert a connection. A duplicate id is rejected; the caller must
    /// build a new [`Connection`] (fresh id) and retry.
    pub fn register(&self, connection: Arc<Connection>) -> Result<ConnectionId> {
        let id = connection.id;
        match self.connections.entry(id) {
            Entry::Occupied(_) => Err(GatewayError::DuplicateConnection(id)),
            Entry::Vacant(slot) => {
                connection.set_state(ConnectionState::Open);
                slot.insert(connection);
                info!(connection_id = %id, "Connection registered");
                Ok(id)
            }
        }
    }

    /// Attach a principal to a live connection.
    pub fn authenticate(&self, id: &ConnectionId, principal: Principal) {
        match self.connections.get(id) {
            Some(connection) => {
                debug!(connection_id = %id, user_id = %principal.id, role = %principal.role, "Connection authenticated");
                connection.attach_principal(principal);
            }
            None => debug!(connection_id = %id, "authenticate on unknown connection"),
        }
    }

    /// Drop a connection's principal after a failed (re-)authentication.
    pub fn deauthenticate(&self, id: &ConnectionId) {
        match self.connections.get(id) {
            Some(connection) => connection.clear_principal(),
            None => debug!(connection_id = %id, "deauthenticate on unknown connection"),
        }
    }

    /// Remove a connection and every index entry that names it, then cancel
    /// its session. Idempotent.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let Some((_, connection)) = self.connections.remove(id) else {
            debug!(connection_id = %id, "remove on unknown connection");
            return None;
        };

        {
            let mut topics = connection.lock_topics();
            topics.closed = true;
            for topic in topics.topics.drain() {
                self.router.detach(id, &topic);
            }
        }
        connection.set_state(ConnectionState::Closing);
        connection.cancel();

        info!(connection_id = %id, "Connection removed");
        Some(connection)
    }

    /// Record inbound activity for a connection.
    pub fn touch_liveness(&self, id: &ConnectionId) {
        match self.connections.get(id) {
            Some(connection) => connection.touch(),
            None => debug!(connection_id = %id, "touch on unknown connection"),
        }
    }

    /// Connections with no activity for longer than `threshold`.
    pub fn list_stale(&self, threshold: Duration) -> Vec<ConnectionId> {
        self.list_stale_at(Utc::now().timestamp_millis(), threshold)
    }

    /// [`Self::list_stale`] relative to an explicit `now` (epoch millis).
    pub fn list_stale_at(&self, now_ms: i64, threshold: Duration) -> Vec<ConnectionId> {
        let threshold_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
        self.connections
            .iter()
            .filter(|entry| now_ms.saturating_sub(entry.value().last_liveness_ms()) > threshold_ms)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Subscribe a connection to a topic. Returns false if the connection is
    /// unknown or already closing.
    pub fn subscribe(&self, id: &ConnectionId, topic: &str) -> bool {
        match self.get(id) {
            Some(connection) => self.router.subscribe(&connection, topic),
            None => {
                warn!(connection_id = %id, topic, "subscribe on unknown connection");
                false
            }
        }
    }

    /// Unsubscribe a connection from a topic.
    pub fn unsubscribe(&self, id: &ConnectionId, topic: &str) {
        match self.get(id) {
            Some(connection) => self.router.unsubscribe(&connection, topic),
            None => debug!(connection_id = %id, topic, "unsubscribe on unknown connection"),
        }
    }

    /// Ids subscribed to a topic; empty for unknown topics.
    pub fn subscribers_of(&self, topic: &str) -> HashSet<ConnectionId> {
        self.router.subscribers_of(topic)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn router(&self) -> &SubscriptionRouter {
        &self.router
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn topic_count(&self) -> usize {
        self.router.topic_count()
    }

    /// Remove every connection (shutdown).
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.iter().filter(|id| self.remove(id).is_some()).count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
