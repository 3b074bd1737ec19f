#![forbid(unsafe_code)]

use super::Room;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Server-wide room id -> Room map.
///
/// Every iteration collects a `Vec` first so no shard guard outlives the call.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<String, Arc<Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, room: Arc<Room>) {
        self.rooms.insert(room.id().to_string(), room);
    }

    /// Inserts `room` unless its id is taken, returning whichever room ends up
    /// registered under that id.
    pub fn insert_if_absent(&self, room: Arc<Room>) -> Arc<Room> {
        match self.rooms.entry(room.id().to_string()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => slot.insert(room).clone(),
        }
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| r.value().clone())
    }

    pub fn remove(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.remove(room_id).map(|(_, room)| room)
    }

    /// Removes the entry only if it still points at `room`. A rehydrated room
    /// that reused the id in the meantime is left alone.
    pub fn remove_if_same(&self, room: &Arc<Room>) -> bool {
        self.rooms
            .remove_if(room.id(), |_, current| Arc::ptr_eq(current, room))
            .is_some()
    }

    pub fn snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|r| r.value().clone()).collect()
    }

    /// Rooms whose peer set currently contains `identity`.
    pub fn rooms_with_peer(&self, identity: &str) -> Vec<Arc<Room>> {
        self.snapshot()
            .into_iter()
            .filter(|room| room.has_peer(identity))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn total_peers(&self) -> usize {
        self.snapshot().iter().map(|room| room.peer_count()).sum()
    }

    /// Removes and returns every room.
    pub fn drain(&self) -> Vec<Arc<Room>> {
        let ids: Vec<String> = self.rooms.iter().map(|r| r.key().clone()).collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }
}
