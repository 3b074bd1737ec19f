#![forbid(unsafe_code)]

// Fire-and-forget room event hooks. Nothing in the server depends on these
// being observed; they exist for logging and tests.

use super::{Peer, RoomState};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    PeerJoined(Peer),
    PeerLeft(String),
    StateChanged(RoomState),
}

/// Receives room events synchronously on the mutating task.
/// Implementations must not block.
pub trait RoomObserver: Send + Sync {
    fn on_event(&self, room_id: &str, event: &RoomEvent);
}

/// Logs every room event at debug level.
pub struct TracingObserver;

impl RoomObserver for TracingObserver {
    fn on_event(&self, room_id: &str, event: &RoomEvent) {
        match event {
            RoomEvent::PeerJoined(peer) => debug!("Room {}: peer {} joined", room_id, peer.email),
            RoomEvent::PeerLeft(email) => debug!("Room {}: peer {} left", room_id, email),
            RoomEvent::StateChanged(state) => debug!("Room {}: state -> {}", room_id, state),
        }
    }
}

/// Forwards events into a bounded channel, dropping them when the channel is
/// full or the receiver is gone.
pub struct ChannelObserver {
    tx: mpsc::Sender<(String, RoomEvent)>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<(String, RoomEvent)>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl RoomObserver for ChannelObserver {
    fn on_event(&self, room_id: &str, event: &RoomEvent) {
        let _ = self.tx.try_send((room_id.to_string(), event.clone()));
    }
}
