pub mod events;

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use self::events::{user_room, ExecutionEvent};

pub type ConnectionId = Uuid;

struct ConnectionHandle {
    user_id: Uuid,
    sender: mpsc::Sender<Value>,
    subscriptions: HashSet<String>,
}

#[derive(Default)]
struct BusInner {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    user_connections: HashMap<Uuid, HashSet<ConnectionId>>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

/// Process-local publish/subscribe fan-out over per-connection channels.
///
/// Connections are registered with an owning user and auto-subscribed to
/// that user's room; further room subscriptions are ACL-checked by the
/// API layer before they reach the bus. All internal maps sit behind one
/// coarse lock; broadcasts snapshot the target senders and deliver after
/// the lock is released. Delivery is best-effort: a connection whose
/// outbound buffer is full misses the message (clients reconcile through
/// the polling endpoints), while per-connection ordering is preserved by
/// the underlying channel.
pub struct EventBus {
    inner: RwLock<BusInner>,
    send_buffer: usize,
}

impl EventBus {
    pub fn new(send_buffer: usize) -> Self {
        Self {
            inner: RwLock::new(BusInner::default()),
            send_buffer: send_buffer.max(1),
        }
    }

    /// Register a connection for `user_id`.
    ///
    /// Returns the connection id and the receiving half the transport
    /// task drains. The connection is auto-subscribed to `user:<id>` and
    /// greeted with a `connected` message.
    pub fn connect(&self, user_id: Uuid) -> (ConnectionId, mpsc::Receiver<Value>) {
        let connection_id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.send_buffer);
        let room = user_room(user_id);

        {
            let mut inner = self.inner.write();
            let mut subscriptions = HashSet::new();
            subscriptions.insert(room.clone());

            inner.connections.insert(
                connection_id,
                ConnectionHandle {
                    user_id,
                    sender: sender.clone(),
                    subscriptions,
                },
            );
            inner
                .user_connections
                .entry(user_id)
                .or_default()
                .insert(connection_id);
            inner.rooms.entry(room).or_default().insert(connection_id);
        }

        log::info!("event bus connection {connection_id} opened (user: {user_id})");

        let _ = sender.try_send(json!({
            "type": "connection",
            "event": "connected",
            "connection_id": connection_id,
            "timestamp": Utc::now().to_rfc3339(),
        }));

        (connection_id, receiver)
    }

    /// Tear down a connection and all of its subscriptions.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        let mut inner = self.inner.write();
        let Some(handle) = inner.connections.remove(&connection_id) else {
            return;
        };

        if let Some(set) = inner.user_connections.get_mut(&handle.user_id) {
            set.remove(&connection_id);
            if set.is_empty() {
                inner.user_connections.remove(&handle.user_id);
            }
        }
        for room in &handle.subscriptions {
            if let Some(set) = inner.rooms.get_mut(room) {
                set.remove(&connection_id);
                if set.is_empty() {
                    inner.rooms.remove(room);
                }
            }
        }

        log::info!(
            "event bus connection {connection_id} closed (user: {})",
            handle.user_id
        );
    }

    /// Subscribe a connection to a room. Access control happens in the
    /// API layer; the bus only records membership and acks.
    pub fn subscribe(&self, connection_id: ConnectionId, room: &str) -> bool {
        let sender = {
            let mut inner = self.inner.write();
            let Some(handle) = inner.connections.get_mut(&connection_id) else {
                return false;
            };
            handle.subscriptions.insert(room.to_string());
            let sender = handle.sender.clone();
            inner
                .rooms
                .entry(room.to_string())
                .or_default()
                .insert(connection_id);
            sender
        };

        let _ = sender.try_send(subscription_message("subscribed", room));
        true
    }

    pub fn unsubscribe(&self, connection_id: ConnectionId, room: &str) {
        let sender = {
            let mut inner = self.inner.write();
            if let Some(set) = inner.rooms.get_mut(room) {
                set.remove(&connection_id);
                if set.is_empty() {
                    inner.rooms.remove(room);
                }
            }
            match inner.connections.get_mut(&connection_id) {
                Some(handle) => {
                    handle.subscriptions.remove(room);
                    Some(handle.sender.clone())
                }
                None => None,
            }
        };

        if let Some(sender) = sender {
            let _ = sender.try_send(subscription_message("unsubscribed", room));
        }
    }

    /// Send a message to one connection.
    pub fn send_personal(&self, connection_id: ConnectionId, message: Value) {
        let sender = {
            let inner = self.inner.read();
            inner
                .connections
                .get(&connection_id)
                .map(|handle| handle.sender.clone())
        };
        if let Some(sender) = sender {
            if sender.try_send(message).is_err() {
                log::warn!("dropping message for slow or closed connection {connection_id}");
            }
        }
    }

    /// Send a message to every connection of a user.
    pub fn send_to_user(&self, user_id: Uuid, message: Value) {
        self.broadcast_room(&user_room(user_id), message);
    }

    /// Broadcast a message to all connections in a room.
    ///
    /// Senders are snapshotted under the lock; delivery happens outside it.
    pub fn broadcast_room(&self, room: &str, message: Value) {
        let targets: Vec<(ConnectionId, mpsc::Sender<Value>)> = {
            let inner = self.inner.read();
            let Some(members) = inner.rooms.get(room) else {
                log::debug!("no subscribers in room {room}");
                return;
            };
            members
                .iter()
                .filter_map(|id| {
                    inner
                        .connections
                        .get(id)
                        .map(|handle| (*id, handle.sender.clone()))
                })
                .collect()
        };

        for (connection_id, sender) in targets {
            if sender.try_send(message.clone()).is_err() {
                log::warn!("dropping room message for slow or closed connection {connection_id}");
            }
        }
    }

    /// Serialize and fan out an executor event to its room.
    pub fn publish(&self, event: &ExecutionEvent) {
        self.broadcast_room(&event.room(), event.to_message());
    }

    /// Answer a keepalive ping with a pong on the same connection.
    pub fn ping(&self, connection_id: ConnectionId) {
        self.send_personal(
            connection_id,
            json!({
                "type": "pong",
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn room_subscriber_count(&self, room: &str) -> usize {
        self.inner
            .read()
            .rooms
            .get(room)
            .map_or(0, |members| members.len())
    }

    pub fn connection_user(&self, connection_id: ConnectionId) -> Option<Uuid> {
        self.inner
            .read()
            .connections
            .get(&connection_id)
            .map(|handle| handle.user_id)
    }
}

fn subscription_message(event: &str, room: &str) -> Value {
    json!({
        "type": "subscription",
        "event": event,
        "room_id": room,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ExecutionStatus;
    use super::events::execution_room;

    fn drain(receiver: &mut mpsc::Receiver<Value>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            out.push(message);
        }
        out
    }

    #[tokio::test]
    async fn connect_auto_subscribes_user_room() {
        let bus = EventBus::new(16);
        let user = Uuid::new_v4();
        let (connection_id, mut receiver) = bus.connect(user);

        let greeting = receiver.try_recv().unwrap();
        assert_eq!(greeting["type"], "connection");
        assert_eq!(greeting["event"], "connected");

        bus.send_to_user(user, json!({"hello": true}));
        let messages = drain(&mut receiver);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["hello"], true);

        assert_eq!(bus.room_subscriber_count(&user_room(user)), 1);
        bus.disconnect(connection_id);
        assert_eq!(bus.room_subscriber_count(&user_room(user)), 0);
        assert_eq!(bus.connection_count(), 0);
    }

    #[tokio::test]
    async fn room_broadcast_reaches_only_subscribers() {
        let bus = EventBus::new(16);
        let execution_id = Uuid::new_v4();
        let room = execution_room(execution_id);

        let (subscriber, mut sub_rx) = bus.connect(Uuid::new_v4());
        let (_bystander, mut other_rx) = bus.connect(Uuid::new_v4());
        assert!(bus.subscribe(subscriber, &room));

        drain(&mut sub_rx);
        drain(&mut other_rx);

        let event = ExecutionEvent::ExecutionUpdate {
            execution_id,
            status: ExecutionStatus::Running,
            progress_percentage: 0.0,
            completed_nodes: 0,
            total_nodes: 2,
            current_node: None,
        };
        bus.publish(&event);

        let received = drain(&mut sub_rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["type"], "execution_update");
        assert!(drain(&mut other_rx).is_empty());
    }

    #[tokio::test]
    async fn per_connection_order_is_preserved() {
        let bus = EventBus::new(16);
        let (connection_id, mut receiver) = bus.connect(Uuid::new_v4());
        drain(&mut receiver);

        for i in 0..5 {
            bus.send_personal(connection_id, json!({"seq": i}));
        }

        let seqs: Vec<i64> = drain(&mut receiver)
            .iter()
            .map(|m| m["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(16);
        let (connection_id, mut receiver) = bus.connect(Uuid::new_v4());
        bus.subscribe(connection_id, "execution:test");
        drain(&mut receiver);

        bus.unsubscribe(connection_id, "execution:test");
        drain(&mut receiver);

        bus.broadcast_room("execution:test", json!({"x": 1}));
        assert!(drain(&mut receiver).is_empty());
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let bus = EventBus::new(2);
        let (connection_id, mut receiver) = bus.connect(Uuid::new_v4());

        for i in 0..10 {
            bus.send_personal(connection_id, json!({"seq": i}));
        }

        // Greeting + at most buffer-many queued messages; the rest were
        // dropped without blocking the publisher.
        let received = drain(&mut receiver);
        assert!(received.len() <= 3);
    }
}
