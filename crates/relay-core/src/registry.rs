//! Session registry: user id to live connections.
//!
//! Only the hub task touches the registry. A user is present iff it has at
//! least one live connection.

use crate::connection::{Connection, ConnectionId, ConnectionKey, UserId};
use relay_protocol::Envelope;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Outcome of fanning one envelope out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Delivery {
    /// Copies queued onto a connection.
    pub delivered: usize,
    /// Connections dropped because their queue was full or closed.
    pub dropped: usize,
}

impl Delivery {
    /// Fold another outcome into this one.
    pub fn merge(&mut self, other: Delivery) {
        self.delivered += other.delivered;
        self.dropped += other.dropped;
    }
}

/// Live connections grouped by user.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<UserId, HashMap<ConnectionId, Connection>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to its user's set.
    ///
    /// Returns `false` if a connection with the same id was already present,
    /// in which case the registry is unchanged.
    pub fn insert(&mut self, connection: Connection) -> bool {
        let conns = self
            .sessions
            .entry(connection.user_id().to_string())
            .or_default();

        if conns.contains_key(&connection.id()) {
            return false;
        }
        conns.insert(connection.id(), connection);
        true
    }

    /// Remove a connection, deleting the user entry if it was the last one.
    ///
    /// Dropping the returned handle closes the connection's queue.
    pub fn remove(&mut self, key: &ConnectionKey) -> Option<Connection> {
        let conns = self.sessions.get_mut(&key.user_id)?;
        let removed = conns.remove(&key.id);
        if conns.is_empty() {
            self.sessions.remove(&key.user_id);
        }
        removed
    }

    /// Queue `envelope` on every connection of `user_id`.
    ///
    /// Never waits: a connection whose queue is full or closed is removed
    /// from the registry (closing its queue) and the remaining connections
    /// still receive their copy.
    pub fn deliver(&mut self, user_id: &str, envelope: &Arc<Envelope>) -> Delivery {
        let mut delivery = Delivery::default();
        let Some(conns) = self.sessions.get_mut(user_id) else {
            return delivery;
        };

        conns.retain(|id, conn| match conn.try_enqueue(Arc::clone(envelope)) {
            Ok(()) => {
                delivery.delivered += 1;
                true
            }
            Err(e) => {
                warn!(user = %user_id, connection = %id, reason = %e, "Dropping slow consumer");
                delivery.dropped += 1;
                false
            }
        });

        if conns.is_empty() {
            self.sessions.remove(user_id);
        }
        delivery
    }

    /// Whether `user_id` has at least one live connection.
    #[must_use]
    pub fn contains_user(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    /// Whether this exact connection is registered.
    #[must_use]
    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.sessions
            .get(&key.user_id)
            .is_some_and(|conns| conns.contains_key(&key.id))
    }

    /// Ids of the user's live connections.
    #[must_use]
    pub fn connection_ids(&self, user_id: &str) -> Vec<ConnectionId> {
        self.sessions
            .get(user_id)
            .map(|conns| conns.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of users with at least one connection.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.sessions.len()
    }

    /// Total number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.sessions.values().map(HashMap::len).sum()
    }

    /// Remove every connection, closing all queues.
    pub fn clear(&mut self) -> usize {
        let count = self.connection_count();
        self.sessions.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::ClientFrame;
    use serde_json::json;

    fn envelope() -> Arc<Envelope> {
        Arc::new(ClientFrame::to_user("msg", "u1", json!(1)).stamp("u2"))
    }

    #[test]
    fn test_insert_and_remove() {
        let mut registry = SessionRegistry::new();
        let (c1, _q1) = Connection::open("u1", 4);
        let (c2, _q2) = Connection::open("u1", 4);
        let k1 = c1.key();
        let k2 = c2.key();

        assert!(registry.insert(c1));
        assert!(registry.insert(c2));
        assert_eq!(registry.user_count(), 1);
        assert_eq!(registry.connection_count(), 2);

        assert!(registry.remove(&k1).is_some());
        assert!(registry.contains_user("u1"));
        assert!(!registry.contains(&k1));

        assert!(registry.remove(&k2).is_some());
        assert!(!registry.contains_user("u1"));
        assert_eq!(registry.user_count(), 0);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut registry = SessionRegistry::new();
        let (c1, _q1) = Connection::open("u1", 4);
        assert!(registry.remove(&c1.key()).is_none());
        assert_eq!(registry.user_count(), 0);
    }

    #[test]
    fn test_deliver_drops_full_connection_only() {
        let mut registry = SessionRegistry::new();
        let (slow, _slow_q) = Connection::open("u1", 1);
        let (fast, mut fast_q) = Connection::open("u1", 8);
        let slow_key = slow.key();
        let fast_key = fast.key();
        registry.insert(slow);
        registry.insert(fast);

        assert_eq!(registry.deliver("u1", &envelope()).delivered, 2);

        let second = registry.deliver("u1", &envelope());
        assert_eq!(second, Delivery { delivered: 1, dropped: 1 });
        assert!(!registry.contains(&slow_key));
        assert!(registry.contains(&fast_key));
        assert_eq!(fast_q.len(), 2);
        assert!(fast_q.try_recv().is_some());
    }

    #[test]
    fn test_deliver_removes_user_when_last_connection_dropped() {
        let mut registry = SessionRegistry::new();
        let (conn, queue) = Connection::open("u1", 1);
        registry.insert(conn);
        drop(queue);

        let delivery = registry.deliver("u1", &envelope());
        assert_eq!(delivery.dropped, 1);
        assert!(!registry.contains_user("u1"));
    }

    #[test]
    fn test_clear_closes_queues() {
        let mut registry = SessionRegistry::new();
        let (conn, queue) = Connection::open("u1", 1);
        registry.insert(conn);

        assert_eq!(registry.clear(), 1);
        assert!(queue.is_closed());
    }
}
