//! Message delivery: the fan-out seam and its in-process implementation.
//!
//! The state machine produces [`Outbound`] values; the [`Dispatcher`] routes
//! them onto a [`Fanout`] — the trait modeling the pub/sub collaborator that
//! can deliver a message to one connection or to every connection subscribed
//! to a named group. [`LocalFanout`] is the in-process implementation used by
//! the bundled WebSocket transport; a hosted pub/sub service can be slotted
//! in behind the same trait.
//!
//! Delivery is fire-and-forget: a failed send (stale connection, lagging
//! subscriber) is logged and counted, never propagated. State transitions
//! commit before dispatch and are never rolled back by delivery problems.
//!
//! Reference: Kleppmann, Chapter 11 — fan-out message delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, mpsc};

use crate::protocol::ServerMessage;
use crate::room::{Outbound, Recipient};

/// Pub/sub fan-out consumed by the synchronization core.
///
/// A room identifier maps 1:1 to a group name. Implementations must not
/// block: sends are buffered channel operations, not network round trips.
pub trait Fanout: Send + Sync {
    /// Deliver a message to one specific connection.
    fn send_to_connection(&self, connection_id: &str, message: &ServerMessage);

    /// Deliver a message to every connection subscribed to `group`,
    /// skipping connections attributed to `exclude_user` if given.
    fn send_to_group(&self, group: &str, message: &ServerMessage, exclude_user: Option<&str>);
}

/// Routes state-machine output onto a [`Fanout`].
pub struct Dispatcher {
    fanout: Arc<dyn Fanout>,
}

impl Dispatcher {
    pub fn new(fanout: Arc<dyn Fanout>) -> Self {
        Self { fanout }
    }

    /// Deliver a batch of outbound messages produced for `group`.
    pub fn deliver(&self, group: &str, outbound: Vec<Outbound>) {
        for out in outbound {
            match out.recipient {
                Recipient::Connection(connection_id) => {
                    self.fanout.send_to_connection(&connection_id, &out.message);
                }
                Recipient::Group { exclude } => {
                    self.fanout.send_to_group(group, &out.message, exclude.as_deref());
                }
            }
        }
    }
}

/// A group frame as seen by subscribers: the message encoded once, plus the
/// exclusion tag the subscriber pump checks against its own user.
#[derive(Debug, Clone)]
pub struct GroupFrame {
    pub payload: String,
    pub exclude_user: Option<String>,
}

/// Delivery counters for monitoring.
#[derive(Debug, Clone, Default)]
pub struct FanoutStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_groups: usize,
    pub active_connections: usize,
}

/// In-process [`Fanout`]: one tokio broadcast channel per group, one
/// unbounded sender per registered connection.
///
/// Frames are pre-encoded so a broadcast serializes the message exactly once
/// regardless of subscriber count. Stats are atomics, so the send paths
/// never take more than a map read lock.
pub struct LocalFanout {
    groups: RwLock<HashMap<String, broadcast::Sender<Arc<GroupFrame>>>>,
    connections: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl LocalFanout {
    /// Create a fan-out whose group channels buffer `capacity` frames per
    /// subscriber before lagging subscribers start dropping.
    pub fn new(capacity: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe to a group, creating its channel on first reference.
    pub fn subscribe(&self, group: &str) -> broadcast::Receiver<Arc<GroupFrame>> {
        if let Ok(groups) = self.groups.read() {
            if let Some(tx) = groups.get(group) {
                return tx.subscribe();
            }
        }

        match self.groups.write() {
            Ok(mut groups) => groups
                .entry(group.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe(),
            Err(_) => {
                // Poisoned map: the caller gets a receiver that never fires.
                log::error!("fanout group map poisoned, subscription to {group} is inert");
                broadcast::channel(self.capacity).0.subscribe()
            }
        }
    }

    /// Register a connection for direct delivery. Returns the receiving end
    /// the transport pumps to the socket.
    pub fn register_connection(&self, connection_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.connections.write() {
            Ok(mut connections) => {
                connections.insert(connection_id.to_string(), tx);
            }
            Err(_) => log::error!("fanout connection map poisoned, {connection_id} unreachable"),
        }
        rx
    }

    /// Drop a connection's direct channel. Called by the transport on
    /// disconnect; room participation is unaffected.
    pub fn unregister_connection(&self, connection_id: &str) {
        if let Ok(mut connections) = self.connections.write() {
            connections.remove(connection_id);
        }
    }

    /// Number of groups with a live channel.
    pub fn group_count(&self) -> usize {
        self.groups.read().map(|g| g.len()).unwrap_or(0)
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Snapshot of the delivery counters.
    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_groups: self.group_count(),
            active_connections: self.connection_count(),
        }
    }

    fn encode(&self, message: &ServerMessage) -> Option<String> {
        match message.encode() {
            Ok(payload) => Some(payload),
            Err(e) => {
                log::error!("dropping undeliverable message: {e}");
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

impl Fanout for LocalFanout {
    fn send_to_connection(&self, connection_id: &str, message: &ServerMessage) {
        let Some(payload) = self.encode(message) else {
            return;
        };

        let sender = match self.connections.read() {
            Ok(connections) => connections.get(connection_id).cloned(),
            Err(_) => {
                log::error!("fanout connection map poisoned");
                None
            }
        };

        match sender {
            Some(tx) => {
                if tx.send(payload).is_err() {
                    log::debug!("connection {connection_id} gone, message dropped");
                    self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                log::debug!("no such connection {connection_id}, message dropped");
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn send_to_group(&self, group: &str, message: &ServerMessage, exclude_user: Option<&str>) {
        let Some(payload) = self.encode(message) else {
            return;
        };

        let frame = Arc::new(GroupFrame {
            payload,
            exclude_user: exclude_user.map(str::to_string),
        });

        let sent = match self.groups.read() {
            Ok(groups) => match groups.get(group) {
                // send only errors when no subscriber is listening
                Some(tx) => tx.send(frame).unwrap_or(0),
                None => 0,
            },
            Err(_) => {
                log::error!("fanout group map poisoned");
                0
            }
        };

        if sent == 0 {
            log::debug!("group {group} has no subscribers");
            self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::Outbound;

    fn voted(user: &str) -> ServerMessage {
        ServerMessage::Voted {
            user_id: user.into(),
        }
    }

    #[tokio::test]
    async fn test_group_send_reaches_all_subscribers() {
        let fanout = LocalFanout::new(16);
        let mut rx1 = fanout.subscribe("r1");
        let mut rx2 = fanout.subscribe("r1");

        fanout.send_to_group("r1", &voted("u1"), None);

        let frame1 = rx1.recv().await.unwrap();
        let frame2 = rx2.recv().await.unwrap();
        assert_eq!(frame1.payload, frame2.payload);
        assert!(frame1.exclude_user.is_none());
        assert_eq!(
            ServerMessage::decode(&frame1.payload).unwrap(),
            voted("u1")
        );
    }

    #[tokio::test]
    async fn test_group_send_carries_exclusion_tag() {
        let fanout = LocalFanout::new(16);
        let mut rx = fanout.subscribe("r1");

        fanout.send_to_group("r1", &voted("u2"), Some("u2"));

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.exclude_user.as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn test_groups_are_isolated() {
        let fanout = LocalFanout::new(16);
        let mut rx_other = fanout.subscribe("r2");

        fanout.send_to_group("r1", &voted("u1"), None);
        fanout.send_to_group("r2", &voted("u9"), None);

        let frame = rx_other.recv().await.unwrap();
        assert_eq!(
            ServerMessage::decode(&frame.payload).unwrap(),
            voted("u9")
        );
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connection_send_and_unregister() {
        let fanout = LocalFanout::new(16);
        let mut rx = fanout.register_connection("c1");
        assert_eq!(fanout.connection_count(), 1);

        fanout.send_to_connection("c1", &voted("u1"));
        let payload = rx.recv().await.unwrap();
        assert_eq!(ServerMessage::decode(&payload).unwrap(), voted("u1"));

        fanout.unregister_connection("c1");
        assert_eq!(fanout.connection_count(), 0);

        // Sends to a gone connection are swallowed and counted.
        fanout.send_to_connection("c1", &voted("u1"));
        let stats = fanout.stats();
        assert_eq!(stats.messages_sent, 1);
        assert!(stats.messages_dropped >= 1);
    }

    #[tokio::test]
    async fn test_send_to_empty_group_is_harmless() {
        let fanout = LocalFanout::new(16);
        fanout.send_to_group("nobody-here", &voted("u1"), None);
        assert_eq!(fanout.stats().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_dispatcher_routes_by_recipient() {
        let fanout = Arc::new(LocalFanout::new(16));
        let dispatcher = Dispatcher::new(fanout.clone());

        let mut conn_rx = fanout.register_connection("c1");
        let mut group_rx = fanout.subscribe("r1");

        dispatcher.deliver(
            "r1",
            vec![
                Outbound::to_connection("c1", voted("direct")),
                Outbound::to_group_except("u1", voted("broadcast")),
            ],
        );

        let direct = conn_rx.recv().await.unwrap();
        assert_eq!(ServerMessage::decode(&direct).unwrap(), voted("direct"));

        let frame = group_rx.recv().await.unwrap();
        assert_eq!(
            ServerMessage::decode(&frame.payload).unwrap(),
            voted("broadcast")
        );
        assert_eq!(frame.exclude_user.as_deref(), Some("u1"));
    }
}
