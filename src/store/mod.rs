#![forbid(unsafe_code)]

// Store module - key-value persistence for user records and room snapshots

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::config::PersistPolicy;
use crate::metrics::ServerMetrics;
use crate::room::{Room, RoomSnapshot, RoomState};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store is closed")]
    Closed,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Minimal key-value interface. Values are opaque strings (JSON in practice).
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns `None` when the key is absent.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
    async fn close(&self);
}

pub fn user_key(identity: &str) -> String {
    format!("user:{identity}")
}

pub fn room_key(room_id: &str) -> String {
    format!("room:{room_id}")
}

/// Mirrors room mutations into the store after they have been applied in memory.
///
/// Failures are logged and counted but never propagated: the in-memory room
/// stays authoritative and nothing is rolled back.
///
/// Writes for one room are serialised through a per-room lock, so a save that
/// is still retrying can never land after the room's delete.
#[derive(Clone)]
pub struct WriteThrough {
    store: Arc<dyn Store>,
    policy: PersistPolicy,
    metrics: ServerMetrics,
    write_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl WriteThrough {
    pub fn new(store: Arc<dyn Store>, policy: PersistPolicy, metrics: ServerMetrics) -> Self {
        Self {
            store,
            policy,
            metrics,
            write_locks: Arc::new(DashMap::new()),
        }
    }

    fn write_lock(&self, room_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(&self.write_locks.entry(room_id.to_string()).or_default())
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Serialises the room's current snapshot and writes it under `room:<id>`.
    /// Returns whether the write eventually succeeded. A closed room is never
    /// written.
    pub async fn save_room(&self, room: &Room) -> bool {
        let lock = self.write_lock(room.id());
        let _guard = lock.lock().await;
        if room.state() == RoomState::Closed {
            debug!("Skipping snapshot of closed room {}", room.id());
            return false;
        }

        let key = room_key(room.id());
        let json = match serde_json::to_string(&room.snapshot()) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize snapshot for room {}: {}", room.id(), e);
                self.metrics.inc_persist_failures();
                return false;
            }
        };

        let mut attempt: u32 = 0;
        loop {
            match self.store.set(&key, &json).await {
                Ok(()) => {
                    debug!("Persisted snapshot for room {}", room.id());
                    return true;
                }
                Err(e) if attempt < self.policy.retries => {
                    attempt += 1;
                    warn!(
                        "Persisting room {} failed (attempt {}/{}): {}",
                        room.id(),
                        attempt,
                        self.policy.retries + 1,
                        e
                    );
                    tokio::time::sleep(self.policy.backoff * attempt).await;
                }
                Err(e) => {
                    warn!("Giving up persisting room {}: {}", room.id(), e);
                    self.metrics.inc_persist_failures();
                    return false;
                }
            }
        }
    }

    /// Removes the persisted copy of a closed room.
    pub async fn delete_room(&self, room_id: &str) -> bool {
        let lock = self.write_lock(room_id);
        let _guard = lock.lock().await;
        let deleted = self.delete_with_retry(room_id).await;
        self.write_locks.remove(room_id);
        deleted
    }

    async fn delete_with_retry(&self, room_id: &str) -> bool {
        let key = room_key(room_id);
        let mut attempt: u32 = 0;
        loop {
            match self.store.delete(&key).await {
                Ok(()) => return true,
                Err(e) if attempt < self.policy.retries => {
                    attempt += 1;
                    warn!("Deleting room {} failed (attempt {}): {}", room_id, attempt, e);
                    tokio::time::sleep(self.policy.backoff * attempt).await;
                }
                Err(e) => {
                    warn!("Giving up deleting persisted room {}: {}", room_id, e);
                    self.metrics.inc_persist_failures();
                    return false;
                }
            }
        }
    }

    /// Reads a persisted snapshot. Missing keys and undecodable values both
    /// come back as `None`; the latter is logged.
    pub async fn load_room(&self, room_id: &str) -> Option<RoomSnapshot> {
        let raw = match self.store.get(&room_key(room_id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read snapshot for room {}: {}", room_id, e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Corrupt snapshot for room {}: {}", room_id, e);
                None
            }
        }
    }
}
