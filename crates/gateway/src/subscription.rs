//! Topic → subscriber index.
//!
//! Topics are exact names (`submission.updated`); there is no wildcard
//! matching. Lookups are O(1) amortized. Fan-out order over a topic's
//! subscribers is unspecified.

use crate::connection::{Connection, ConnectionId};
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use tracing::debug;

/// Maps topic name to the set of subscribed connection ids.
#[derive(Debug, Default)]
pub struct SubscriptionRouter {
    index: DashMap<String, DashSet<ConnectionId>>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `topic` to the connection's set and the index. Idempotent.
    /// Returns false if the connection has already been removed.
    pub fn subscribe(&self, connection: &Connection, topic: &str) -> bool {
        let mut topics = connection.lock_topics();
        if topics.closed {
            return false;
        }
        topics.topics.insert(topic.to_string());
        self.index
            .entry(topic.to_string())
            .or_default()
            .insert(connection.id);
        debug!(connection_id = %connection.id, topic, "Subscribed");
        true
    }

    /// Remove `topic` from the connection's set and the index. Idempotent.
    pub fn unsubscribe(&self, connection: &Connection, topic: &str) {
        let mut topics = connection.lock_topics();
        topics.topics.remove(topic);
        self.detach(&connection.id, topic);
        debug!(connection_id = %connection.id, topic, "Unsubscribed");
    }

    /// Remove one id from one topic's index entry, dropping empty topics.
    /// Callers hold the connection's topic lock.
    pub(crate) fn detach(&self, id: &ConnectionId, topic: &str) {
        let now_empty = match self.index.get(topic) {
            Some(subscribers) => {
                subscribers.remove(id);
                subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.index.remove_if(topic, |_, subscribers| subscribers.is_empty());
        }
    }

    /// Ids subscribed to `topic`; empty for unknown topics.
    pub fn subscribers_of(&self, topic: &str) -> HashSet<ConnectionId> {
        self.index
            .get(topic)
            .map(|subscribers| subscribers.iter().map(|id| *id).collect())
            .unwrap_or_default()
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::test_connection;

    #[test]
    fn test_unknown_topic_is_empty() {
        let router = SubscriptionRouter::new();
        assert!(router.subscribers_of("nothing.here").is_empty());
    }

    #[test]
    fn test_index_and_connection_stay_consistent() {
        let router = SubscriptionRouter::new();
        let (a, _rx_a) = test_connection(1);
        let (b, _rx_b) = test_connection(1);

        assert!(router.subscribe(&a, "assessment.created"));
        assert!(router.subscribe(&b, "assessment.created"));
        assert!(router.subscribe(&a, "user.created"));

        let subscribers = router.subscribers_of("assessment.created");
        assert_eq!(subscribers.len(), 2);
        assert!(subscribers.contains(&a.id) && subscribers.contains(&b.id));
        assert_eq!(router.topic_count(), 2);

        router.unsubscribe(&a, "assessment.created");
        assert_eq!(router.subscribers_of("assessment.created").len(), 1);
        assert!(!a.is_subscribed("assessment.created"));
        assert!(a.is_subscribed("user.created"));
    }

    #[test]
    fn test_empty_topics_are_dropped() {
        let router = SubscriptionRouter::new();
        let (a, _rx) = test_connection(1);

        router.subscribe(&a, "grading.failed");
        router.unsubscribe(&a, "grading.failed");
        router.unsubscribe(&a, "grading.failed");

        assert_eq!(router.topic_count(), 0);
        assert!(router.subscribers_of("grading.failed").is_empty());
    }
}
