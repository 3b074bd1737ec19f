#![forbid(unsafe_code)]

// Connection registry - live connections and the identity bound to each

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("write deadline exceeded")]
    Timeout,

    #[error("connection closed")]
    Closed,
}

/// Cloneable handle to one client connection: its outbound queue and a close
/// signal observed by both of its tasks.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    remote_addr: String,
    outbox: mpsc::Sender<Arc<String>>,
    closer: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    pub fn new(
        remote_addr: impl Into<String>,
        outbox: mpsc::Sender<Arc<String>>,
    ) -> (Self, watch::Receiver<bool>) {
        let (closer, closed) = watch::channel(false);
        let handle = Self {
            id: Uuid::new_v4(),
            remote_addr: remote_addr.into(),
            outbox,
            closer: Arc::new(closer),
        };
        (handle, closed)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Queues a pre-serialized frame, waiting at most `deadline` for room.
    pub async fn deliver(&self, payload: Arc<String>, deadline: Duration) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.outbox
            .send_timeout(payload, deadline)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => DeliveryError::Timeout,
                mpsc::error::SendTimeoutError::Closed(_) => DeliveryError::Closed,
            })
    }

    /// Signals both connection tasks to stop. Idempotent.
    pub fn close(&self) {
        self.closer.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closer.borrow() || self.outbox.is_closed()
    }

    pub fn subscribe_close(&self) -> watch::Receiver<bool> {
        self.closer.subscribe()
    }
}

struct Binding {
    handle: ConnectionHandle,
    /// Empty until the connection creates or joins a room
    identity: String,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Binding>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ConnectionHandle) {
        self.connections.insert(
            handle.id(),
            Binding { handle, identity: String::new() },
        );
    }

    /// Binds `identity` to the connection. Returns false if the connection is gone.
    pub fn bind(&self, id: ConnectionId, identity: &str) -> bool {
        match self.connections.get_mut(&id) {
            Some(mut binding) => {
                binding.identity = identity.to_string();
                true
            }
            None => false,
        }
    }

    pub fn unbind(&self, id: ConnectionId) -> Option<String> {
        let mut binding = self.connections.get_mut(&id)?;
        let previous = std::mem::take(&mut binding.identity);
        (!previous.is_empty()).then_some(previous)
    }

    /// Clears the binding of every connection bound to `identity`.
    pub fn unbind_identity(&self, identity: &str) -> usize {
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|b| b.identity == identity)
            .map(|b| *b.key())
            .collect();
        ids.into_iter().filter(|id| self.unbind(*id).is_some()).count()
    }

    pub fn identity(&self, id: ConnectionId) -> Option<String> {
        self.connections
            .get(&id)
            .map(|b| b.identity.clone())
            .filter(|identity| !identity.is_empty())
    }

    pub fn handle(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.get(&id).map(|b| b.handle.clone())
    }

    pub fn remote_addr(&self, id: ConnectionId) -> Option<String> {
        self.connections.get(&id).map(|b| b.handle.remote_addr.clone())
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.remove(&id).map(|(_, b)| b.handle)
    }

    /// Handles of every live connection currently bound to `identity`.
    pub fn bound_to(&self, identity: &str) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .filter(|b| b.identity == identity)
            .map(|b| b.handle.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<(ConnectionId, String)> {
        self.connections
            .iter()
            .map(|b| (*b.key(), b.identity.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Signals every tracked connection to close. Each receive loop then runs
    /// its own disconnect cleanup.
    pub fn close_all(&self) -> usize {
        let handles: Vec<ConnectionHandle> =
            self.connections.iter().map(|b| b.handle.clone()).collect();
        for handle in &handles {
            handle.close();
        }
        handles.len()
    }
}
