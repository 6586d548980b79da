//! Process-wide room registry.
//!
//! Maps room identifiers to live [`Room`] state. Rooms are created lazily on
//! first reference and never evicted — state lives for the process lifetime,
//! which is the only durability this service promises.
//!
//! Each room is wrapped in its own async mutex: that mutex is the room's
//! serialization point, so two concurrent events for the same room apply one
//! after the other while unrelated rooms proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::room::Room;

/// Registry of all live rooms, keyed by room identifier.
///
/// Constructed once at process start and shared by handle; never an ambient
/// singleton, so tests can substitute their own instance.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Get the room for `room_id`, creating it if this is the first reference.
    ///
    /// Creation always succeeds and is safe under concurrent access: losers
    /// of the creation race observe the winner's room.
    pub async fn get_or_create(&self, room_id: &str) -> Arc<Mutex<Room>> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        log::info!("creating room {room_id}");
        let room = Arc::new(Mutex::new(Room::new(room_id)));
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    /// Look up a room without creating it.
    pub async fn get(&self, room_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Identifiers of all live rooms.
    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientEvent;

    #[tokio::test]
    async fn test_get_or_create_returns_same_room() {
        let registry = RoomRegistry::new();

        let room1 = registry.get_or_create("r1").await;
        let room2 = registry.get_or_create("r1").await;

        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let registry = RoomRegistry::new();

        let room1 = registry.get_or_create("r1").await;
        let room2 = registry.get_or_create("r2").await;

        room1.lock().await.apply(
            "u1",
            "c1",
            ClientEvent::Join {
                nickname: "Alice".into(),
            },
        );

        assert_eq!(room1.lock().await.participant_count(), 1);
        assert_eq!(room2.lock().await.participant_count(), 0);
        assert_eq!(registry.room_count().await, 2);

        let mut active = registry.active_rooms().await;
        active.sort();
        assert_eq!(active, vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_get_does_not_create() {
        let registry = RoomRegistry::new();
        assert!(registry.get("r1").await.is_none());
        registry.get_or_create("r1").await;
        assert!(registry.get("r1").await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_one_room() {
        let registry = Arc::new(RoomRegistry::new());

        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let room = registry.get_or_create("shared").await;
                room.lock().await.apply(
                    &format!("u{i}"),
                    &format!("c{i}"),
                    ClientEvent::Join {
                        nickname: format!("User {i}"),
                    },
                );
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.room_count().await, 1);
        let room = registry.get("shared").await.unwrap();
        assert_eq!(room.lock().await.participant_count(), 32);
    }
}
