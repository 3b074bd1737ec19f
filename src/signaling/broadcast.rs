#![forbid(unsafe_code)]

// Fan-out of one event to every live connection of a room's members

use super::protocol::ServerMessage;
use super::registry::{ConnectionId, ConnectionRegistry};
use crate::metrics::ServerMetrics;
use crate::room::RoomRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of one broadcast. A failed delivery never aborts the others.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    /// Members with no live connection bound to their identity
    pub skipped: usize,
}

#[derive(Clone)]
pub struct Broadcaster {
    rooms: Arc<RoomRegistry>,
    connections: Arc<ConnectionRegistry>,
    metrics: ServerMetrics,
    write_timeout: Duration,
}

impl Broadcaster {
    pub fn new(
        rooms: Arc<RoomRegistry>,
        connections: Arc<ConnectionRegistry>,
        metrics: ServerMetrics,
        write_timeout: Duration,
    ) -> Self {
        Self { rooms, connections, metrics, write_timeout }
    }

    /// Delivers `message` to every connection bound to a current member of
    /// `room_id`. An unknown room is a no-op.
    pub async fn broadcast_to_room(&self, room_id: &str, message: &ServerMessage) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let Some(room) = self.rooms.get(room_id) else {
            debug!("Broadcast to unknown room {} dropped", room_id);
            return report;
        };
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return report;
            }
        };
        self.metrics.inc_broadcasts();

        // Membership and bindings are snapshotted; no lock is held across a send
        for email in room.identities() {
            let targets = self.connections.bound_to(&email);
            if targets.is_empty() {
                debug!("No connection found for peer {} in room {}", email, room_id);
                report.skipped += 1;
                continue;
            }
            for conn in targets {
                match conn.deliver(json.clone(), self.write_timeout).await {
                    Ok(()) => {
                        debug!("Delivered to {} at {}", email, conn.remote_addr());
                        report.delivered += 1;
                    }
                    Err(e) => {
                        warn!("Error broadcasting to {} at {}: {}", email, conn.remote_addr(), e);
                        self.metrics.inc_deliveries_failed();
                        report.failed += 1;
                    }
                }
            }
        }
        report
    }

    /// Unicast to one connection. Returns false if it could not be queued.
    pub async fn send_to(&self, conn_id: ConnectionId, message: &ServerMessage) -> bool {
        let Some(conn) = self.connections.handle(conn_id) else {
            return false;
        };
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize message: {}", e);
                return false;
            }
        };
        match conn.deliver(json, self.write_timeout).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping message for connection {}: {}", conn_id, e);
                false
            }
        }
    }

    pub async fn send_error(&self, conn_id: ConnectionId, message: impl Into<String>) -> bool {
        self.send_to(conn_id, &ServerMessage::error(message)).await
    }
}
