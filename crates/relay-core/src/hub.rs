//! The hub: single owner of the session registry and the room directory.
//!
//! Every registration, unregistration, room change and routing decision is a
//! [`HubCommand`] processed one at a time on the hub task. The hub only ever
//! awaits its ingress channel; delivery onto connection queues never blocks.

use crate::connection::{Connection, ConnectionKey, OutboundQueue, UserId};
use crate::registry::{Delivery, SessionRegistry};
use crate::room::{RoomDirectory, RoomId};
use relay_protocol::{Envelope, ReceiverKind};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub task has stopped.
    #[error("Hub is not running")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the shared ingress channel.
    pub ingress_capacity: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ingress_capacity: 1024,
            outbound_capacity: 256,
        }
    }
}

/// Messages accepted by the hub task.
#[derive(Debug)]
pub enum HubCommand {
    /// Add a connection to the registry.
    Register(Connection),
    /// Remove a connection and close its queue.
    Unregister(ConnectionKey),
    /// Fan an envelope out to its target.
    Route(Envelope),
    /// Create a room or replace its membership.
    CreateRoom {
        room_id: RoomId,
        members: Vec<UserId>,
    },
    /// Add one member to an existing room.
    AddRoomMember { room_id: RoomId, user_id: UserId },
    /// Remove one member from a room.
    RemoveRoomMember { room_id: RoomId, user_id: UserId },
    /// Delete a room.
    DeleteRoom { room_id: RoomId },
    /// Report a statistics snapshot.
    Stats(oneshot::Sender<HubStats>),
    /// Close every connection and stop the hub.
    Shutdown,
}

/// Snapshot of hub state and cumulative counters.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Users with at least one live connection.
    pub users: usize,
    /// Live connections.
    pub connections: usize,
    /// Rooms in the directory.
    pub rooms: usize,
    /// Envelopes received for routing.
    pub envelopes_routed: u64,
    /// Copies queued onto connections.
    pub copies_delivered: u64,
    /// Envelopes whose target user or room did not exist.
    pub unroutable: u64,
    /// Connections dropped for backpressure.
    pub slow_consumer_drops: u64,
}

/// Routing state. Not shared: reach it through a [`HubHandle`] once spawned.
#[derive(Debug, Default)]
pub struct Hub {
    registry: SessionRegistry,
    rooms: RoomDirectory,
    envelopes_routed: u64,
    copies_delivered: u64,
    unroutable: u64,
    slow_consumer_drops: u64,
}

impl Hub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the hub task and return a handle to it.
    #[must_use]
    pub fn spawn(config: &HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.ingress_capacity.max(1));
        let task = tokio::spawn(Self::new().run(receiver));
        let handle = HubHandle {
            sender,
            outbound_capacity: config.outbound_capacity,
        };
        (handle, task)
    }

    /// Process commands until shutdown or until every handle is dropped.
    pub async fn run(mut self, mut receiver: mpsc::Receiver<HubCommand>) {
        info!("Hub started");

        while let Some(cmd) = receiver.recv().await {
            if !self.handle_command(cmd) {
                break;
            }
        }

        let closed = self.registry.clear();
        self.rooms.clear();
        info!(connections_closed = closed, "Hub stopped");
    }

    /// Apply one command. Returns `false` when the hub should stop.
    pub fn handle_command(&mut self, cmd: HubCommand) -> bool {
        match cmd {
            HubCommand::Register(connection) => self.register(connection),
            HubCommand::Unregister(key) => self.unregister(&key),
            HubCommand::Route(envelope) => {
                self.route(envelope);
            }
            HubCommand::CreateRoom { room_id, members } => {
                self.rooms.create_or_replace(room_id, members);
            }
            HubCommand::AddRoomMember { room_id, user_id } => {
                self.rooms.add_member(&room_id, user_id);
            }
            HubCommand::RemoveRoomMember { room_id, user_id } => {
                self.rooms.remove_member(&room_id, &user_id);
            }
            HubCommand::DeleteRoom { room_id } => {
                if self.rooms.remove(&room_id).is_some() {
                    debug!(room = %room_id, "Room deleted");
                }
            }
            HubCommand::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            HubCommand::Shutdown => {
                info!("Hub shutdown requested");
                return false;
            }
        }
        true
    }

    /// Add a connection to its user's set.
    pub fn register(&mut self, connection: Connection) {
        let user = connection.user_id().to_string();
        let id = connection.id();

        if self.registry.insert(connection) {
            info!(user = %user, connection = %id, "Connection registered");
        } else {
            debug!(user = %user, connection = %id, "Connection already registered");
        }
    }

    /// Remove a connection and close its queue. Unknown connections are ignored.
    pub fn unregister(&mut self, key: &ConnectionKey) {
        if self.registry.remove(key).is_some() {
            info!(user = %key.user_id, connection = %key.id, "Connection unregistered");
        }
    }

    /// Fan an envelope out to every live connection of its target.
    pub fn route(&mut self, envelope: Envelope) -> Delivery {
        self.envelopes_routed += 1;
        let envelope = Arc::new(envelope);

        let delivery = match envelope.receiver_type {
            ReceiverKind::User => self.route_to_user(&envelope),
            ReceiverKind::Group => self.route_to_group(&envelope),
        };

        self.copies_delivered += delivery.delivered as u64;
        self.slow_consumer_drops += delivery.dropped as u64;
        trace!(
            event = %envelope.event,
            sender = %envelope.sender_id,
            receiver = %envelope.receiver_id,
            kind = %envelope.receiver_type,
            delivered = delivery.delivered,
            dropped = delivery.dropped,
            "Routed"
        );
        delivery
    }

    fn route_to_user(&mut self, envelope: &Arc<Envelope>) -> Delivery {
        if !self.registry.contains_user(&envelope.receiver_id) {
            self.unroutable += 1;
            trace!(receiver = %envelope.receiver_id, "No live connections for user");
            return Delivery::default();
        }
        self.registry.deliver(&envelope.receiver_id, envelope)
    }

    fn route_to_group(&mut self, envelope: &Arc<Envelope>) -> Delivery {
        let Some(room) = self.rooms.get(&envelope.receiver_id) else {
            self.unroutable += 1;
            trace!(room = %envelope.receiver_id, "Unknown room");
            return Delivery::default();
        };

        let mut delivery = Delivery::default();
        for member in room.members() {
            delivery.merge(self.registry.deliver(member, envelope));
        }
        delivery
    }

    /// Create a room or replace its membership.
    pub fn create_room<I, S>(&mut self, room_id: impl Into<RoomId>, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        self.rooms.create_or_replace(room_id, members);
    }

    /// The session registry.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// The room directory.
    #[must_use]
    pub fn rooms(&self) -> &RoomDirectory {
        &self.rooms
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            users: self.registry.user_count(),
            connections: self.registry.connection_count(),
            rooms: self.rooms.len(),
            envelopes_routed: self.envelopes_routed,
            copies_delivered: self.copies_delivered,
            unroutable: self.unroutable,
            slow_consumer_drops: self.slow_consumer_drops,
        }
    }
}

/// Cloneable handle to a running hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
    outbound_capacity: usize,
}

impl HubHandle {
    async fn send(&self, cmd: HubCommand) -> Result<(), HubError> {
        self.sender.send(cmd).await.map_err(|_| HubError::Closed)
    }

    /// Open a connection for `user_id` and register it.
    ///
    /// Returns the key to unregister with and the queue for the write pump.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn connect(
        &self,
        user_id: impl Into<UserId>,
    ) -> Result<(ConnectionKey, OutboundQueue), HubError> {
        let (connection, queue) = Connection::open(user_id, self.outbound_capacity);
        let key = connection.key();
        self.register(connection).await?;
        Ok((key, queue))
    }

    /// Register a connection.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn register(&self, connection: Connection) -> Result<(), HubError> {
        self.send(HubCommand::Register(connection)).await
    }

    /// Unregister a connection.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn unregister(&self, key: ConnectionKey) -> Result<(), HubError> {
        self.send(HubCommand::Unregister(key)).await
    }

    /// Route an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn route(&self, envelope: Envelope) -> Result<(), HubError> {
        self.send(HubCommand::Route(envelope)).await
    }

    /// Create a room or replace its membership.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn create_room(
        &self,
        room_id: impl Into<RoomId>,
        members: Vec<UserId>,
    ) -> Result<(), HubError> {
        self.send(HubCommand::CreateRoom {
            room_id: room_id.into(),
            members,
        })
        .await
    }

    /// Add a member to an existing room.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn add_room_member(
        &self,
        room_id: impl Into<RoomId>,
        user_id: impl Into<UserId>,
    ) -> Result<(), HubError> {
        self.send(HubCommand::AddRoomMember {
            room_id: room_id.into(),
            user_id: user_id.into(),
        })
        .await
    }

    /// Remove a member from a room.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn remove_room_member(
        &self,
        room_id: impl Into<RoomId>,
        user_id: impl Into<UserId>,
    ) -> Result<(), HubError> {
        self.send(HubCommand::RemoveRoomMember {
            room_id: room_id.into(),
            user_id: user_id.into(),
        })
        .await
    }

    /// Delete a room.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn delete_room(&self, room_id: impl Into<RoomId>) -> Result<(), HubError> {
        self.send(HubCommand::DeleteRoom {
            room_id: room_id.into(),
        })
        .await
    }

    /// Fetch a statistics snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats(reply)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Ask the hub to close every connection and stop.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has already stopped.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        self.send(HubCommand::Shutdown).await
    }

    /// Whether the hub task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Capacity given to each new connection's outbound queue.
    #[must_use]
    pub fn outbound_capacity(&self) -> usize {
        self.outbound_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::ClientFrame;
    use serde_json::json;

    fn to_user(sender: &str, receiver: &str) -> Envelope {
        ClientFrame::to_user("msg", receiver, json!("hi")).stamp(sender)
    }

    fn to_group(sender: &str, room: &str) -> Envelope {
        ClientFrame::to_group("msg", room, json!("hi")).stamp(sender)
    }

    fn connect(hub: &mut Hub, user: &str, capacity: usize) -> (ConnectionKey, OutboundQueue) {
        let (conn, queue) = Connection::open(user, capacity);
        let key = conn.key();
        hub.register(conn);
        (key, queue)
    }

    #[test]
    fn test_user_fan_out_reaches_every_connection() {
        let mut hub = Hub::new();
        let mut queues: Vec<_> = (0..3).map(|_| connect(&mut hub, "u1", 8).1).collect();
        let (_, mut other) = connect(&mut hub, "u9", 8);

        let delivery = hub.route(to_user("u2", "u1"));
        assert_eq!(delivery, Delivery { delivered: 3, dropped: 0 });

        for queue in &mut queues {
            assert_eq!(queue.len(), 1);
            assert!(queue.try_recv().is_some());
        }
        assert!(other.try_recv().is_none());
    }

    #[test]
    fn test_scenario_two_devices_one_sender() {
        let mut hub = Hub::new();
        let (_, mut c1) = connect(&mut hub, "u1", 8);
        let (_, mut c2) = connect(&mut hub, "u1", 8);
        let (_, mut c3) = connect(&mut hub, "u2", 8);

        let raw = br#"{"event":"msg","receiver_id":"u1","receiver_type":"user","data":"hi"}"#;
        let envelope = relay_protocol::decode(raw).unwrap().stamp("u2");
        hub.route(envelope);

        for queue in [&mut c1, &mut c2] {
            let got = queue.try_recv().unwrap();
            assert_eq!(got.sender_id, "u2");
            assert_eq!(got.data, json!("hi"));
            assert!(queue.try_recv().is_none());
        }
        assert!(c3.try_recv().is_none());
    }

    #[test]
    fn test_unregister_stops_delivery_and_removes_user() {
        let mut hub = Hub::new();
        let (key, mut queue) = connect(&mut hub, "u1", 8);

        hub.unregister(&key);
        assert!(!hub.registry().contains_user("u1"));
        assert!(queue.is_closed());

        hub.route(to_user("u2", "u1"));
        assert!(queue.try_recv().is_none());
        assert_eq!(hub.stats().unroutable, 1);
    }

    #[test]
    fn test_unregister_keeps_remaining_connections() {
        let mut hub = Hub::new();
        let (k1, _q1) = connect(&mut hub, "u1", 8);
        let (_k2, mut q2) = connect(&mut hub, "u1", 8);

        hub.unregister(&k1);
        assert!(hub.registry().contains_user("u1"));
        assert_eq!(hub.route(to_user("u2", "u1")).delivered, 1);
        assert!(q2.try_recv().is_some());
    }

    #[test]
    fn test_unregister_unknown_connection_is_noop() {
        let mut hub = Hub::new();
        let (_k, _q) = connect(&mut hub, "u1", 8);
        let (stranger, _sq) = Connection::open("u1", 8);

        hub.unregister(&stranger.key());
        assert_eq!(hub.stats().connections, 1);
    }

    #[test]
    fn test_full_queue_drops_only_that_connection() {
        let mut hub = Hub::new();
        let (slow_key, _slow) = connect(&mut hub, "u1", 1);
        let (_, mut fast) = connect(&mut hub, "u1", 8);
        let (_, mut other) = connect(&mut hub, "u3", 8);
        hub.create_room("r1", ["u1", "u3"]);

        hub.route(to_user("u2", "u1"));
        let delivery = hub.route(to_group("u2", "r1"));

        assert_eq!(delivery, Delivery { delivered: 2, dropped: 1 });
        assert!(!hub.registry().contains(&slow_key));
        assert_eq!(fast.len(), 2);
        assert!(other.try_recv().is_some());
        assert_eq!(hub.stats().slow_consumer_drops, 1);
    }

    #[test]
    fn test_room_replace_changes_recipients() {
        let mut hub = Hub::new();
        let (_, mut a) = connect(&mut hub, "A", 8);
        let (_, mut b) = connect(&mut hub, "B", 8);
        let (_, mut c) = connect(&mut hub, "C", 8);

        hub.create_room("room", ["A", "B"]);
        hub.create_room("room", ["C"]);
        hub.route(to_group("A", "room"));

        assert!(a.try_recv().is_none());
        assert!(b.try_recv().is_none());
        assert!(c.try_recv().is_some());
    }

    #[test]
    fn test_group_includes_sender_and_allows_non_members() {
        let mut hub = Hub::new();
        let (_, mut member) = connect(&mut hub, "m", 8);
        let (_, mut outsider) = connect(&mut hub, "x", 8);
        hub.create_room("room", ["m", "offline"]);

        // Sender is a member: gets its own copy.
        assert_eq!(hub.route(to_group("m", "room")).delivered, 1);
        assert!(member.try_recv().is_some());

        // Non-member may post but receives nothing.
        assert_eq!(hub.route(to_group("x", "room")).delivered, 1);
        assert!(outsider.try_recv().is_none());
    }

    #[test]
    fn test_unknown_room_is_noop() {
        let mut hub = Hub::new();
        let (_, mut q) = connect(&mut hub, "u1", 8);

        assert_eq!(hub.route(to_group("u1", "nowhere")), Delivery::default());
        assert!(q.try_recv().is_none());
        assert!(!hub.rooms().contains("nowhere"));
    }

    #[test]
    fn test_per_connection_fifo() {
        let mut hub = Hub::new();
        let (_, mut q) = connect(&mut hub, "u1", 8);

        for i in 0..5 {
            hub.route(ClientFrame::to_user("seq", "u1", json!(i)).stamp("u2"));
        }
        for i in 0..5 {
            assert_eq!(q.try_recv().unwrap().data, json!(i));
        }
    }

    #[test]
    fn test_room_membership_commands() {
        let mut hub = Hub::new();
        let (_, mut q) = connect(&mut hub, "u1", 8);

        hub.handle_command(HubCommand::AddRoomMember {
            room_id: "r".into(),
            user_id: "u1".into(),
        });
        assert!(!hub.rooms().contains("r"));

        hub.handle_command(HubCommand::CreateRoom {
            room_id: "r".into(),
            members: vec![],
        });
        hub.handle_command(HubCommand::AddRoomMember {
            room_id: "r".into(),
            user_id: "u1".into(),
        });
        hub.route(to_group("u2", "r"));
        assert!(q.try_recv().is_some());

        hub.handle_command(HubCommand::RemoveRoomMember {
            room_id: "r".into(),
            user_id: "u1".into(),
        });
        hub.route(to_group("u2", "r"));
        assert!(q.try_recv().is_none());

        hub.handle_command(HubCommand::DeleteRoom { room_id: "r".into() });
        assert_eq!(hub.stats().rooms, 0);
    }

    #[tokio::test]
    async fn test_spawned_hub_routes_and_reports_stats() {
        let (hub, _task) = Hub::spawn(&HubConfig::default());
        let (_, mut q1) = hub.connect("u1").await.unwrap();
        let (k2, _q2) = hub.connect("u2").await.unwrap();

        hub.route(to_user("u2", "u1")).await.unwrap();
        let got = q1.recv().await.unwrap();
        assert_eq!(got.sender_id, "u2");

        hub.unregister(k2).await.unwrap();
        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.users, 1);
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.envelopes_routed, 1);
        assert_eq!(stats.copies_delivered, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_queues_and_handles() {
        let (hub, task) = Hub::spawn(&HubConfig::default());
        let (_, mut queue) = hub.connect("u1").await.unwrap();

        hub.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(queue.recv().await.is_none());
        assert!(hub.is_closed());
        assert!(matches!(hub.stats().await, Err(HubError::Closed)));
    }
}
