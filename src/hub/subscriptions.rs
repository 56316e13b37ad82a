use super::registry::Connection;
use crate::error::{Error, Result};
use crate::{ConnectionId, Topic};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Topic to connection index.
///
/// The per-connection topic set and this index are only changed together,
/// under the index write lock. A topic whose last subscriber leaves is
/// removed from the map.
#[derive(Default)]
pub(crate) struct SubscriptionIndex {
    topics: RwLock<HashMap<Topic, HashSet<ConnectionId>>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `topic` to the connection's subscriptions.
    ///
    /// Returns `Ok(false)` if the connection is already subscribed or has
    /// been evicted in the meantime.
    pub fn subscribe(&self, connection: &Connection, topic: Topic, limit: usize) -> Result<bool> {
        let mut topics = self.topics.write();
        // Checked under the index lock; eviction marks the connection closed
        // before it clears the connection's entries from this index.
        if connection.is_closed() {
            return Ok(false);
        }

        let mut subscriptions = connection.subscriptions.lock();
        if subscriptions.contains(&topic) {
            return Ok(false);
        }
        if subscriptions.len() >= limit {
            return Err(Error::SubscriptionLimitExceeded(connection.id().as_str()));
        }

        debug!(connection_id = %connection.id(), topic = %topic, "Subscribed");
        topics
            .entry(topic.clone())
            .or_default()
            .insert(connection.id());
        subscriptions.insert(topic);
        Ok(true)
    }

    /// Remove `topic` from the connection's subscriptions
    pub fn unsubscribe(&self, connection: &Connection, topic: &str) -> bool {
        let mut topics = self.topics.write();
        if !connection.subscriptions.lock().remove(topic) {
            return false;
        }

        if let Some(members) = topics.get_mut(topic) {
            members.remove(&connection.id());
            if members.is_empty() {
                topics.remove(topic);
            }
        }
        debug!(connection_id = %connection.id(), topic = %topic, "Unsubscribed");
        true
    }

    /// Drop every subscription held by an evicted connection
    pub fn remove_connection(&self, connection: &Connection) {
        let mut topics = self.topics.write();
        let held: Vec<Topic> = connection.subscriptions.lock().drain().collect();
        for topic in held {
            if let Some(members) = topics.get_mut(&topic) {
                members.remove(&connection.id());
                if members.is_empty() {
                    topics.remove(&topic);
                }
            }
        }
    }

    /// Ids of the connections subscribed to `topic`
    pub fn subscriber_ids(&self, topic: &str) -> Vec<ConnectionId> {
        self.topics
            .read()
            .get(topic)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of topics with at least one subscriber
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    pub fn clear(&self) {
        self.topics.write().clear();
    }
}
