#![forbid(unsafe_code)]

// Room module - room state machine and peer membership

pub mod manager;
pub mod observer;
pub mod peer;
pub mod registry;

pub use manager::RoomManager;
pub use observer::{ChannelObserver, RoomEvent, RoomObserver, TracingObserver};
pub use peer::Peer;
pub use registry::RoomRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("Invalid peer data: {0}")]
    InvalidPeer(&'static str),

    #[error("Room is not active")]
    RoomInactive,

    #[error("Room is closed")]
    RoomClosed,

    #[error("Room is full")]
    RoomFull,

    #[error("Already in room")]
    PeerExists,

    #[error("Peer not found in room")]
    PeerNotFound,

    #[error("Invalid room state transition: {from} -> {to}")]
    InvalidTransition { from: RoomState, to: RoomState },

    #[error("Room not found")]
    RoomNotFound,

    #[error("Connection is already bound to another identity")]
    IdentityMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum RoomState {
    Active = 0,
    Inactive = 1,
    Closed = 2,
}

impl RoomState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RoomState::Active,
            1 => RoomState::Inactive,
            _ => RoomState::Closed,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RoomState::Active => "active",
            RoomState::Inactive => "inactive",
            RoomState::Closed => "closed",
        }
    }

    /// Active and Inactive may move to each other or to Closed. Closed is terminal.
    pub fn can_transition_to(self, next: RoomState) -> bool {
        matches!(
            (self, next),
            (RoomState::Active, RoomState::Inactive)
                | (RoomState::Active, RoomState::Closed)
                | (RoomState::Inactive, RoomState::Active)
                | (RoomState::Inactive, RoomState::Closed)
        )
    }
}

impl fmt::Display for RoomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Playback bounds and current position, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timestamps {
    pub start: f64,
    pub end: f64,
    pub current: f64,
}

impl Timestamps {
    /// `0 <= start`, `end > 0` and `start <= current <= end`.
    pub fn is_valid(&self) -> bool {
        self.start >= 0.0 && self.end > 0.0 && self.start <= self.current && self.current <= self.end
    }
}

/// Serialized form of a room, written to the store and embedded in room events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub id: String,
    pub status: RoomState,
    pub video_source: String,
    pub timestamp: Timestamps,
    pub created_by: String,
    pub created_on: DateTime<Utc>,
    pub max_capacity: usize,
    #[serde(default)]
    pub peers: HashMap<String, Peer>,
}

/// A bounded group session synchronizing playback of one video source.
///
/// The peer map is guarded by a short-held std RwLock (never held across an
/// await); capacity, uniqueness and state checks for a join all happen under
/// one write guard. The state lives in an atomic so reads never block.
pub struct Room {
    id: String,
    created_by: String,
    video_source: String,
    timestamp: Timestamps,
    created_on: DateTime<Utc>,
    max_capacity: usize,
    state: AtomicU8,
    peers: StdRwLock<HashMap<String, Peer>>,
    observers: StdRwLock<Vec<Arc<dyn RoomObserver>>>,
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("peer_count", &self.peer_count())
            .field("max_capacity", &self.max_capacity)
            .finish()
    }
}

impl Room {
    pub fn new(
        created_by: String,
        video_source: String,
        timestamp: Timestamps,
        max_capacity: usize,
    ) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            created_by,
            video_source,
            timestamp,
            max_capacity,
        )
    }

    pub fn with_id(
        id: String,
        created_by: String,
        video_source: String,
        timestamp: Timestamps,
        max_capacity: usize,
    ) -> Self {
        Self {
            id,
            created_by,
            video_source,
            timestamp,
            created_on: Utc::now(),
            max_capacity,
            state: AtomicU8::new(RoomState::Active as u8),
            peers: StdRwLock::new(HashMap::new()),
            observers: StdRwLock::new(Vec::new()),
        }
    }

    /// Rebuilds a room from a persisted snapshot. Stored peers are dropped:
    /// their connections belonged to another process.
    pub fn from_snapshot(snapshot: RoomSnapshot) -> Self {
        Self {
            id: snapshot.id,
            created_by: snapshot.created_by,
            video_source: snapshot.video_source,
            timestamp: snapshot.timestamp,
            created_on: snapshot.created_on,
            max_capacity: snapshot.max_capacity,
            state: AtomicU8::new(snapshot.status as u8),
            peers: StdRwLock::new(HashMap::new()),
            observers: StdRwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    pub fn video_source(&self) -> &str {
        &self.video_source
    }

    pub fn timestamp(&self) -> Timestamps {
        self.timestamp
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn state(&self) -> RoomState {
        RoomState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn subscribe(&self, observer: Arc<dyn RoomObserver>) {
        if self.state() == RoomState::Closed {
            return;
        }
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    fn notify(&self, event: RoomEvent) {
        let observers: Vec<Arc<dyn RoomObserver>> = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            observer.on_event(&self.id, &event);
        }
    }

    /// Registers a peer.
    ///
    /// # Errors
    /// `InvalidPeer`, `RoomInactive`, `RoomClosed`, `RoomFull` or `PeerExists`.
    /// A failed call never changes the peer count.
    pub fn add_peer(&self, peer: Peer) -> Result<(), RoomError> {
        peer.validate()?;
        {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            // State is re-read under the guard so a concurrent close cannot slip in between
            match self.state() {
                RoomState::Active => {}
                RoomState::Inactive => return Err(RoomError::RoomInactive),
                RoomState::Closed => return Err(RoomError::RoomClosed),
            }
            if peers.len() >= self.max_capacity {
                return Err(RoomError::RoomFull);
            }
            if peers.contains_key(&peer.email) {
                return Err(RoomError::PeerExists);
            }
            peers.insert(peer.email.clone(), peer.clone());
        }
        self.notify(RoomEvent::PeerJoined(peer));
        Ok(())
    }

    pub fn remove_peer(&self, email: &str) -> Result<Peer, RoomError> {
        let removed = self
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(email)
            .ok_or(RoomError::PeerNotFound)?;
        self.notify(RoomEvent::PeerLeft(email.to_string()));
        Ok(removed)
    }

    /// Refreshes a peer's liveness timestamp and returns the updated record.
    pub fn update_last_seen(&self, email: &str) -> Result<Peer, RoomError> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let peer = peers.get_mut(email).ok_or(RoomError::PeerNotFound)?;
        peer.last_ping = Utc::now();
        Ok(peer.clone())
    }

    /// Applies a state transition. Moving to Closed also releases every peer
    /// and detaches all observers.
    pub fn set_state(&self, next: RoomState) -> Result<(), RoomError> {
        let mut current = self.state();
        loop {
            if !current.can_transition_to(next) {
                return Err(RoomError::InvalidTransition { from: current, to: next });
            }
            match self.state.compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = RoomState::from_u8(actual),
            }
        }
        self.notify(RoomEvent::StateChanged(next));
        if next == RoomState::Closed {
            self.release();
        }
        Ok(())
    }

    /// Transitions to Closed from any state. Returns false if the room was
    /// already closed, in which case nothing happens.
    pub fn close(&self) -> bool {
        let previous = self.state.swap(RoomState::Closed as u8, Ordering::AcqRel);
        if RoomState::from_u8(previous) == RoomState::Closed {
            return false;
        }
        self.notify(RoomEvent::StateChanged(RoomState::Closed));
        self.release();
        true
    }

    /// Closes the room only if it has no peers, atomically with respect to
    /// `add_peer`. Returns whether the room was closed by this call.
    pub fn close_if_empty(&self) -> bool {
        {
            let peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            if !peers.is_empty() {
                return false;
            }
            let previous = self.state.swap(RoomState::Closed as u8, Ordering::AcqRel);
            if RoomState::from_u8(previous) == RoomState::Closed {
                return false;
            }
        }
        self.notify(RoomEvent::StateChanged(RoomState::Closed));
        self.release();
        true
    }

    fn release(&self) {
        self.peers.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.observers.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    // --- Point-in-time reads ---

    pub fn peers(&self) -> HashMap<String, Peer> {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn peer(&self, email: &str) -> Result<Peer, RoomError> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(email)
            .cloned()
            .ok_or(RoomError::PeerNotFound)
    }

    pub fn has_peer(&self, email: &str) -> bool {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).contains_key(email)
    }

    /// Visits a snapshot of the peer set; return false from `f` to stop early.
    pub fn for_each_peer<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Peer) -> bool,
    {
        for (email, peer) in &self.peers() {
            if !f(email, peer) {
                break;
            }
        }
    }

    pub fn identities(&self) -> Vec<String> {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.peer_count() == 0
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            id: self.id.clone(),
            status: self.state(),
            video_source: self.video_source.clone(),
            timestamp: self.timestamp,
            created_by: self.created_by.clone(),
            created_on: self.created_on,
            max_capacity: self.max_capacity,
            peers: self.peers(),
        }
    }
}
