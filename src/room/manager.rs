#![forbid(unsafe_code)]

// Room manager - the operations behind each protocol action

use super::{Peer, Room, RoomError, RoomRegistry, RoomState, Timestamps, TracingObserver};
use crate::config::LivenessConfig;
use crate::metrics::ServerMetrics;
use crate::signaling::broadcast::{BroadcastReport, Broadcaster};
use crate::signaling::protocol::ServerMessage;
use crate::signaling::registry::{ConnectionId, ConnectionRegistry};
use crate::store::WriteThrough;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Owns the room and connection registries for the lifetime of the process.
pub struct RoomManager {
    rooms: Arc<RoomRegistry>,
    connections: Arc<ConnectionRegistry>,
    broadcaster: Broadcaster,
    persistence: WriteThrough,
    metrics: ServerMetrics,
    room_capacity: usize,
    shutting_down: AtomicBool,
}

impl RoomManager {
    pub fn new(
        persistence: WriteThrough,
        metrics: ServerMetrics,
        room_capacity: usize,
        write_timeout: Duration,
    ) -> Self {
        let rooms = Arc::new(RoomRegistry::new());
        let connections = Arc::new(ConnectionRegistry::new());
        let broadcaster = Broadcaster::new(
            rooms.clone(),
            connections.clone(),
            metrics.clone(),
            write_timeout,
        );
        Self {
            rooms,
            connections,
            broadcaster,
            persistence,
            metrics,
            room_capacity,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn total_peer_count(&self) -> usize {
        self.rooms.total_peers()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn peer_for(&self, conn_id: ConnectionId, email: &str) -> Peer {
        let addr = self.connections.remote_addr(conn_id).unwrap_or_default();
        Peer::new(email, addr)
    }

    /// A connection carries one identity; rebinding it would orphan the
    /// previous identity's peers.
    fn check_binding(&self, conn_id: ConnectionId, email: &str) -> Result<(), RoomError> {
        match self.connections.identity(conn_id) {
            Some(bound) if bound != email => Err(RoomError::IdentityMismatch),
            _ => Ok(()),
        }
    }

    /// Undoes a registration that raced `shutdown`'s drain.
    fn reject_if_shutting_down(&self, room: &Arc<Room>) -> Result<(), RoomError> {
        if !self.is_shutting_down() {
            return Ok(());
        }
        room.close();
        self.rooms.remove_if_same(room);
        Err(RoomError::RoomClosed)
    }

    /// Creates a room with the caller as its first peer and binds the
    /// connection to the caller.
    pub async fn create_room(
        &self,
        conn_id: ConnectionId,
        email: &str,
        video_source: &str,
        timestamp: Timestamps,
    ) -> Result<Arc<Room>, RoomError> {
        self.check_binding(conn_id, email)?;
        let room = Arc::new(Room::new(
            email.to_string(),
            video_source.to_string(),
            timestamp,
            self.room_capacity,
        ));
        room.subscribe(Arc::new(TracingObserver));

        let peer = self.peer_for(conn_id, email);
        room.add_peer(peer.clone())?;
        self.rooms.insert(room.clone());
        self.reject_if_shutting_down(&room)?;
        self.connections.bind(conn_id, email);
        self.metrics.inc_rooms_created();
        self.metrics.inc_joins();
        info!("Room {} created by {}", room.id(), email);

        self.persistence.save_room(&room).await;
        self.announce_join(&room, peer).await;
        Ok(room)
    }

    /// Adds the caller to an existing room, rehydrating it from the store if
    /// this process has not seen it yet.
    pub async fn join_room(
        &self,
        conn_id: ConnectionId,
        room_id: &str,
        email: &str,
    ) -> Result<Arc<Room>, RoomError> {
        self.check_binding(conn_id, email)?;
        let room = match self.rooms.get(room_id) {
            Some(room) => room,
            None => self.rehydrate(room_id).await.ok_or(RoomError::RoomNotFound)?,
        };

        let peer = self.peer_for(conn_id, email);
        room.add_peer(peer.clone())?;
        self.connections.bind(conn_id, email);
        self.metrics.inc_joins();
        info!("{} joined room {} ({}/{})", email, room_id, room.peer_count(), room.max_capacity());

        self.persistence.save_room(&room).await;
        self.announce_join(&room, peer).await;
        Ok(room)
    }

    async fn rehydrate(&self, room_id: &str) -> Option<Arc<Room>> {
        let snapshot = self.persistence.load_room(room_id).await?;
        if snapshot.status == RoomState::Closed {
            debug!("Stored room {} is closed, not rehydrating", room_id);
            return None;
        }
        let room = Arc::new(Room::from_snapshot(snapshot));
        room.subscribe(Arc::new(TracingObserver));
        let room = self.rooms.insert_if_absent(room);
        self.reject_if_shutting_down(&room).ok()?;
        info!("Rehydrated room {} from store", room_id);
        Some(room)
    }

    async fn announce_join(&self, room: &Room, peer: Peer) {
        let message = ServerMessage::UserJoined {
            peer,
            peers: room.peers(),
            room: room.snapshot(),
        };
        self.broadcaster.broadcast_to_room(room.id(), &message).await;
    }

    /// Removes `email` from the room. A room that is not known is a no-op.
    pub async fn leave_room(&self, room_id: &str, email: &str) -> Result<(), RoomError> {
        let Some(room) = self.rooms.get(room_id) else {
            debug!("Leave for unknown room {} ignored", room_id);
            return Ok(());
        };
        self.remove_from(&room, email).await
    }

    /// The single removal path shared by leave, disconnect and the reaper.
    async fn remove_from(&self, room: &Arc<Room>, email: &str) -> Result<(), RoomError> {
        room.remove_peer(email)?;
        self.metrics.inc_leaves();
        if self.rooms.rooms_with_peer(email).is_empty() {
            self.connections.unbind_identity(email);
        }

        if room.close_if_empty() {
            // Store first: until the registry entry goes, joins see the closed
            // room instead of rehydrating the old snapshot
            self.persistence.delete_room(room.id()).await;
            self.rooms.remove_if_same(room);
            self.metrics.inc_rooms_closed();
            info!("Room {} closed after last peer left", room.id());
            return Ok(());
        }

        info!("{} left room {}", email, room.id());
        self.persistence.save_room(room).await;
        let message = ServerMessage::UserLeft {
            email: email.to_string(),
            peers: room.peers(),
            room: room.snapshot(),
        };
        self.broadcaster.broadcast_to_room(room.id(), &message).await;
        Ok(())
    }

    /// Transport-close cleanup: leave every room the bound identity occupies,
    /// forget the connection, then close it.
    pub async fn disconnect(&self, conn_id: ConnectionId) {
        if let Some(email) = self.connections.identity(conn_id) {
            for room in self.rooms.rooms_with_peer(&email) {
                if let Err(e) = self.remove_from(&room, &email).await {
                    debug!("Disconnect cleanup for {} in room {}: {}", email, room.id(), e);
                }
            }
        }
        if let Some(handle) = self.connections.remove(conn_id) {
            handle.close();
        }
    }

    /// Refreshes liveness for `email` in every room it occupies.
    pub fn ping(&self, email: &str) -> usize {
        self.rooms
            .rooms_with_peer(email)
            .iter()
            .filter(|room| room.update_last_seen(email).is_ok())
            .count()
    }

    pub async fn player_state(
        &self,
        room_id: &str,
        email: &str,
        paused: bool,
    ) -> Result<BroadcastReport, RoomError> {
        self.require_room(room_id)?;
        let message = ServerMessage::UpdatePlayerState {
            email: email.to_string(),
            state: paused,
            room: room_id.to_string(),
        };
        Ok(self.broadcaster.broadcast_to_room(room_id, &message).await)
    }

    pub async fn update_timestamp(
        &self,
        room_id: &str,
        email: &str,
        timestamp: f64,
        seeking: bool,
    ) -> Result<BroadcastReport, RoomError> {
        self.require_room(room_id)?;
        let message = ServerMessage::UpdateTimestamp {
            email: email.to_string(),
            timestamp,
            seeking,
            room: room_id.to_string(),
        };
        Ok(self.broadcaster.broadcast_to_room(room_id, &message).await)
    }

    pub async fn chat_message(
        &self,
        room_id: &str,
        email: &str,
        message: String,
    ) -> Result<BroadcastReport, RoomError> {
        self.require_room(room_id)?;
        let message = ServerMessage::chat(room_id, email, message);
        Ok(self.broadcaster.broadcast_to_room(room_id, &message).await)
    }

    fn require_room(&self, room_id: &str) -> Result<Arc<Room>, RoomError> {
        self.rooms.get(room_id).ok_or(RoomError::RoomNotFound)
    }

    /// Removes every peer not seen within `timeout`. Returns how many were removed.
    pub async fn reap_idle(&self, timeout: Duration) -> usize {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return 0;
        };
        let cutoff = Utc::now() - timeout;
        let mut reaped = 0;
        for room in self.rooms.snapshot() {
            let stale: Vec<String> = room
                .peers()
                .into_values()
                .filter(|peer| peer.is_stale(cutoff))
                .map(|peer| peer.email)
                .collect();
            for email in stale {
                if self.remove_from(&room, &email).await.is_ok() {
                    info!("Reaped idle peer {} from room {}", email, room.id());
                    self.metrics.inc_peers_reaped();
                    reaped += 1;
                }
            }
        }
        reaped
    }

    /// Starts the periodic idle-peer reaper when a peer timeout is configured.
    pub fn spawn_reaper(self: &Arc<Self>, liveness: LivenessConfig) -> Option<tokio::task::JoinHandle<()>> {
        let timeout = liveness.peer_timeout?;
        let manager = Arc::clone(self);
        info!(
            "Idle peer reaper enabled: timeout {:?}, interval {:?}",
            timeout, liveness.reaper_interval
        );
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(liveness.reaper_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if manager.is_shutting_down() {
                    break;
                }
                let reaped = manager.reap_idle(timeout).await;
                if reaped > 0 {
                    debug!("Reaper removed {} idle peers", reaped);
                }
            }
        }))
    }

    /// Stops admitting work, closes every room and connection, then the store.
    /// Persisted snapshots are kept so a later process can rehydrate them.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let rooms = self.rooms.drain();
        for room in &rooms {
            if room.close() {
                self.metrics.inc_rooms_closed();
            }
        }
        let closed = self.connections.close_all();
        info!("Shutdown: closed {} rooms and signalled {} connections", rooms.len(), closed);
        self.persistence.store().close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistPolicy;
    use crate::signaling::registry::ConnectionHandle;
    use crate::store::{room_key, MemoryStore, Store, StoreResult};
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::mpsc;

    /// Memory store whose next `set` is held back once armed.
    #[derive(Default)]
    struct SlowStore {
        inner: MemoryStore,
        delay_next_set: AtomicBool,
    }

    #[async_trait]
    impl Store for SlowStore {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
            if self.delay_next_set.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.inner.delete(key).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    struct Harness {
        manager: Arc<RoomManager>,
        store: Arc<MemoryStore>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let metrics = ServerMetrics::new();
        let persistence = WriteThrough::new(store.clone(), PersistPolicy::default(), metrics.clone());
        let manager = Arc::new(RoomManager::new(persistence, metrics, 10, Duration::from_millis(50)));
        Harness { manager, store }
    }

    fn connect(h: &Harness) -> (ConnectionId, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(16);
        let (handle, _closed) = ConnectionHandle::new("127.0.0.1:7000", tx);
        let id = handle.id();
        h.manager.connections().register(handle);
        (id, rx)
    }

    fn next(rx: &mut mpsc::Receiver<Arc<String>>) -> Value {
        let frame = rx.try_recv().expect("expected a frame");
        serde_json::from_str(&frame).unwrap()
    }

    fn ts() -> Timestamps {
        Timestamps { start: 0.0, end: 100.0, current: 0.0 }
    }

    #[tokio::test]
    async fn test_room_lifecycle_scenario() {
        let h = harness();
        let (a, mut ra) = connect(&h);
        let (b, mut rb) = connect(&h);

        let room = h.manager.create_room(a, "a@x.com", "v1", ts()).await.unwrap();
        let room_id = room.id().to_string();
        assert_eq!(room.state(), RoomState::Active);
        assert_eq!(room.peer_count(), 1);
        assert_eq!(next(&mut ra)["action"], "user_joined");
        assert!(h.store.get(&room_key(&room_id)).await.unwrap().is_some());

        h.manager.join_room(b, &room_id, "b@x.com").await.unwrap();
        assert_eq!(room.peer_count(), 2);
        for rx in [&mut ra, &mut rb] {
            let joined = next(rx);
            assert_eq!(joined["action"], "user_joined");
            assert_eq!(joined["data"]["peer"]["email"], "b@x.com");
            assert_eq!(joined["data"]["peers"].as_object().unwrap().len(), 2);
        }

        h.manager.leave_room(&room_id, "a@x.com").await.unwrap();
        assert_eq!(room.peer_count(), 1);
        let left = next(&mut rb);
        assert_eq!(left["action"], "user_left");
        assert_eq!(left["data"]["email"], "a@x.com");
        assert!(ra.try_recv().is_err());
        assert_eq!(h.manager.connections().identity(a), None);

        h.manager.leave_room(&room_id, "b@x.com").await.unwrap();
        assert!(h.manager.rooms().get(&room_id).is_none());
        assert!(h.store.get(&room_key(&room_id)).await.unwrap().is_none());
        assert_eq!(room.state(), RoomState::Closed);
    }

    #[tokio::test]
    async fn test_join_unknown_room() {
        let h = harness();
        let (b, _rb) = connect(&h);
        assert_eq!(
            h.manager.join_room(b, "missing", "b@x.com").await.unwrap_err(),
            RoomError::RoomNotFound
        );
        assert_eq!(h.manager.connections().identity(b), None);
    }

    #[tokio::test]
    async fn test_join_rehydrates_from_store() {
        let h = harness();
        let stored = Room::new("a@x.com".to_string(), "v1".to_string(), ts(), 10);
        stored.add_peer(Peer::new("a@x.com", "10.0.0.1:1")).unwrap();
        let json = serde_json::to_string(&stored.snapshot()).unwrap();
        h.store.set(&room_key(stored.id()), &json).await.unwrap();

        let (b, mut rb) = connect(&h);
        let room = h.manager.join_room(b, stored.id(), "b@x.com").await.unwrap();
        assert_eq!(room.id(), stored.id());
        assert_eq!(room.video_source(), "v1");
        assert_eq!(room.identities(), vec!["b@x.com".to_string()]);
        assert_eq!(next(&mut rb)["action"], "user_joined");
    }

    #[tokio::test]
    async fn test_closed_snapshot_is_not_rehydrated() {
        let h = harness();
        let stored = Room::new("a@x.com".to_string(), "v1".to_string(), ts(), 10);
        stored.close();
        let json = serde_json::to_string(&stored.snapshot()).unwrap();
        h.store.set(&room_key(stored.id()), &json).await.unwrap();

        let (b, _rb) = connect(&h);
        assert_eq!(
            h.manager.join_room(b, stored.id(), "b@x.com").await.unwrap_err(),
            RoomError::RoomNotFound
        );
        assert_eq!(h.manager.room_count(), 0);
    }

    #[tokio::test]
    async fn test_join_full_room() {
        let h = harness();
        let (a, _ra) = connect(&h);
        let room = h.manager.create_room(a, "p0@x.com", "v1", ts()).await.unwrap();
        for i in 1..10 {
            let (c, _rc) = connect(&h);
            h.manager.join_room(c, room.id(), &format!("p{i}@x.com")).await.unwrap();
        }
        let (late, _rl) = connect(&h);
        assert_eq!(
            h.manager.join_room(late, room.id(), "late@x.com").await.unwrap_err(),
            RoomError::RoomFull
        );
        assert_eq!(room.peer_count(), 10);
    }

    #[tokio::test]
    async fn test_leave_unknown_room_and_unknown_peer() {
        let h = harness();
        assert!(h.manager.leave_room("missing", "a@x.com").await.is_ok());

        let (a, _ra) = connect(&h);
        let room = h.manager.create_room(a, "a@x.com", "v1", ts()).await.unwrap();
        assert_eq!(
            h.manager.leave_room(room.id(), "z@x.com").await.unwrap_err(),
            RoomError::PeerNotFound
        );
        assert_eq!(room.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_rooms_and_forgets_connection() {
        let h = harness();
        let (a, _ra) = connect(&h);
        let (b, mut rb) = connect(&h);
        let room = h.manager.create_room(a, "a@x.com", "v1", ts()).await.unwrap();
        h.manager.join_room(b, room.id(), "b@x.com").await.unwrap();
        let _ = next(&mut rb);

        let handle = h.manager.connections().handle(a).unwrap();
        h.manager.disconnect(a).await;

        assert!(handle.is_closed());
        assert!(h.manager.connections().handle(a).is_none());
        assert_eq!(room.identities(), vec!["b@x.com".to_string()]);
        assert_eq!(next(&mut rb)["action"], "user_left");
    }

    #[tokio::test]
    async fn test_relay_events_require_room() {
        let h = harness();
        let (a, mut ra) = connect(&h);
        let room = h.manager.create_room(a, "a@x.com", "v1", ts()).await.unwrap();
        let _ = next(&mut ra);

        let report = h.manager.player_state(room.id(), "a@x.com", true).await.unwrap();
        assert_eq!(report.delivered, 1);
        let msg = next(&mut ra);
        assert_eq!(msg["action"], "update_player_state");
        assert_eq!(msg["data"]["state"], true);

        h.manager.update_timestamp(room.id(), "a@x.com", 42.0, false).await.unwrap();
        assert_eq!(next(&mut ra)["data"]["timestamp"], 42.0);

        h.manager.chat_message(room.id(), "a@x.com", "hi".to_string()).await.unwrap();
        assert_eq!(next(&mut ra)["data"]["message"], "hi");

        assert_eq!(
            h.manager.chat_message("missing", "a@x.com", "hi".to_string()).await.unwrap_err(),
            RoomError::RoomNotFound
        );
    }

    #[tokio::test]
    async fn test_ping_and_reaper() {
        let h = harness();
        let (a, _ra) = connect(&h);
        let (b, mut rb) = connect(&h);
        let room = h.manager.create_room(a, "a@x.com", "v1", ts()).await.unwrap();
        h.manager.join_room(b, room.id(), "b@x.com").await.unwrap();
        let _ = next(&mut rb);

        assert_eq!(h.manager.ping("b@x.com"), 1);
        assert_eq!(h.manager.ping("nobody@x.com"), 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        h.manager.ping("b@x.com");
        assert_eq!(h.manager.reap_idle(Duration::from_millis(20)).await, 1);
        assert_eq!(room.identities(), vec!["b@x.com".to_string()]);
        assert_eq!(next(&mut rb)["action"], "user_left");
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let h = harness();
        let (a, _ra) = connect(&h);
        let room = h.manager.create_room(a, "a@x.com", "v1", ts()).await.unwrap();
        let handle = h.manager.connections().handle(a).unwrap();

        h.manager.shutdown().await;
        assert!(h.manager.is_shutting_down());
        assert_eq!(room.state(), RoomState::Closed);
        assert_eq!(h.manager.room_count(), 0);
        assert!(handle.is_closed());
        assert!(h.store.get("room:x").await.is_err());
    }

    #[tokio::test]
    async fn test_slow_save_cannot_resurrect_deleted_room() {
        let store = Arc::new(SlowStore::default());
        let metrics = ServerMetrics::new();
        let persistence = WriteThrough::new(store.clone(), PersistPolicy::default(), metrics.clone());
        let manager = Arc::new(RoomManager::new(persistence, metrics, 10, Duration::from_millis(50)));
        let register = |manager: &RoomManager| {
            let (tx, rx) = mpsc::channel(16);
            let (handle, _closed) = ConnectionHandle::new("127.0.0.1:7000", tx);
            let id = handle.id();
            manager.connections().register(handle);
            (id, rx)
        };
        let (a, _ra) = register(&manager);
        let (b, _rb) = register(&manager);
        let room = manager.create_room(a, "a@x.com", "v1", ts()).await.unwrap();
        let room_id = room.id().to_string();
        manager.join_room(b, &room_id, "b@x.com").await.unwrap();

        // a's leave snapshot is still in flight when b's leave deletes the room
        store.delay_next_set.store(true, Ordering::SeqCst);
        let first_leave = {
            let (manager, room_id) = (manager.clone(), room_id.clone());
            tokio::spawn(async move { manager.leave_room(&room_id, "a@x.com").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.leave_room(&room_id, "b@x.com").await.unwrap();
        first_leave.await.unwrap().unwrap();

        assert!(manager.rooms().get(&room_id).is_none());
        assert!(store.get(&room_key(&room_id)).await.unwrap().is_none());
        let (c, _rc) = register(&manager);
        assert_eq!(
            manager.join_room(c, &room_id, "c@x.com").await.unwrap_err(),
            RoomError::RoomNotFound
        );
    }

    #[tokio::test]
    async fn test_connection_cannot_switch_identity() {
        let h = harness();
        let (a, _ra) = connect(&h);
        let first = h.manager.create_room(a, "a@x.com", "v1", ts()).await.unwrap();

        assert_eq!(
            h.manager.create_room(a, "b@x.com", "v2", ts()).await.unwrap_err(),
            RoomError::IdentityMismatch
        );
        assert_eq!(
            h.manager.join_room(a, first.id(), "b@x.com").await.unwrap_err(),
            RoomError::IdentityMismatch
        );
        assert_eq!(h.manager.room_count(), 1);
        assert_eq!(first.identities(), vec!["a@x.com".to_string()]);
        assert_eq!(h.manager.connections().identity(a).as_deref(), Some("a@x.com"));

        // Same identity may open a second room on the same connection
        h.manager.create_room(a, "a@x.com", "v2", ts()).await.unwrap();
        assert_eq!(h.manager.room_count(), 2);

        h.manager.disconnect(a).await;
        assert_eq!(h.manager.room_count(), 0);
        assert_eq!(first.state(), RoomState::Closed);
    }

    #[tokio::test]
    async fn test_create_after_shutdown_leaves_nothing_registered() {
        let h = harness();
        let (a, _ra) = connect(&h);
        h.manager.shutdown().await;

        assert_eq!(
            h.manager.create_room(a, "a@x.com", "v1", ts()).await.unwrap_err(),
            RoomError::RoomClosed
        );
        assert_eq!(h.manager.room_count(), 0);
        assert_eq!(h.manager.connections().identity(a), None);
    }

    #[tokio::test]
    async fn test_join_after_room_emptied_is_rejected() {
        let h = harness();
        let (a, _ra) = connect(&h);
        let (b, _rb) = connect(&h);
        let room = h.manager.create_room(a, "a@x.com", "v1", ts()).await.unwrap();
        // Last peer removed and room closed, registry removal not yet applied
        room.remove_peer("a@x.com").unwrap();
        assert!(room.close_if_empty());

        assert_eq!(
            h.manager.join_room(b, room.id(), "b@x.com").await.unwrap_err(),
            RoomError::RoomClosed
        );
        assert_eq!(h.manager.connections().identity(b), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_last_leave_races_join() {
        for _ in 0..50 {
            let h = harness();
            let (a, _ra) = connect(&h);
            let (b, _rb) = connect(&h);
            let room = h.manager.create_room(a, "a@x.com", "v1", ts()).await.unwrap();
            let room_id = room.id().to_string();

            let leave = {
                let (manager, room_id) = (h.manager.clone(), room_id.clone());
                tokio::spawn(async move { manager.leave_room(&room_id, "a@x.com").await })
            };
            let join = {
                let (manager, room_id) = (h.manager.clone(), room_id.clone());
                tokio::spawn(async move { manager.join_room(b, &room_id, "b@x.com").await.map(|_| ()) })
            };
            leave.await.unwrap().unwrap();
            let joined = join.await.unwrap();
            let stored = h.store.get(&room_key(&room_id)).await.unwrap();

            match joined {
                Ok(()) => {
                    assert_eq!(room.state(), RoomState::Active);
                    assert_eq!(room.identities(), vec!["b@x.com".to_string()]);
                    assert!(h.manager.rooms().get(&room_id).is_some());
                    assert!(stored.is_some());
                }
                Err(e) => {
                    assert!(matches!(e, RoomError::RoomClosed | RoomError::RoomNotFound), "{e}");
                    assert_eq!(room.state(), RoomState::Closed);
                    assert!(h.manager.rooms().get(&room_id).is_none());
                    assert!(stored.is_none());
                }
            }
        }
    }
}
