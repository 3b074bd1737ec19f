#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{Command, ProtocolError};
use super::registry::{ConnectionHandle, ConnectionId};
use crate::config::ServerConfig;
use crate::metrics::ServerMetrics;
use crate::room::{RoomError, RoomManager};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, info, warn};

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
const CHANNEL_CAPACITY: usize = 64;

/// Interval between server-initiated WebSocket pings.
const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Room(#[from] RoomError),

    #[error("Already joined as {0} on this connection")]
    AlreadyJoined(String),

    #[error("Not joined as {0} on this connection")]
    NotJoined(String),

    #[error("Server is shutting down")]
    ShuttingDown,
}

/// Per-connection token bucket.
struct RateLimiter {
    tokens_us: u64,
    last_refill: Instant,
    warned: bool,
}

enum RateDecision {
    Allow,
    /// First rejection of a burst; the client is told once
    RejectAndWarn,
    Reject,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: Instant::now(),
            warned: false,
        }
    }

    fn check(&mut self, now: Instant) -> RateDecision {
        let elapsed_us = now.saturating_duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(RATE_LIMIT_REFILL_RATE))
            .min(MAX_TOKENS_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            RateDecision::Allow
        } else if !self.warned {
            self.warned = true;
            RateDecision::RejectAndWarn
        } else {
            RateDecision::Reject
        }
    }
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    remote_addr: SocketAddr,
    manager: Arc<RoomManager>,
    config: Arc<ServerConfig>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);
    let (handle, mut close_rx) = ConnectionHandle::new(remote_addr.to_string(), tx);
    let conn_id = handle.id();
    manager.connections().register(handle.clone());
    info!("New WebSocket connection {} from {}", conn_id, remote_addr);

    let send_metrics = metrics.clone();
    let send_handle = handle.clone();
    let write_timeout = config.write_timeout;
    let mut send_close_rx = handle.subscribe_close();

    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(json) = msg else { break };
                    let frame = Message::Text((*json).clone().into());
                    match tokio::time::timeout(write_timeout, ws_sender.send(frame)).await {
                        Ok(Ok(())) => send_metrics.inc_messages_sent(),
                        Ok(Err(e)) => {
                            debug!("Write to {} failed: {}", conn_id, e);
                            break;
                        }
                        Err(_) => {
                            warn!("Write deadline exceeded for {}", conn_id);
                            break;
                        }
                    }
                }
                _ = ping.tick() => {
                    let sent = tokio::time::timeout(write_timeout, ws_sender.send(Message::Ping(Bytes::new()))).await;
                    if !matches!(sent, Ok(Ok(()))) {
                        break;
                    }
                }
                _ = send_close_rx.changed() => {
                    let _ = tokio::time::timeout(write_timeout, ws_sender.send(Message::Close(None))).await;
                    break;
                }
            }
        }
        // Wake the receive loop if the socket failed on our side
        send_handle.close();
        debug!("Send task finished for connection {}", conn_id);
    });

    let mut limiter = RateLimiter::new();

    loop {
        let frame = tokio::select! {
            _ = close_rx.changed() => {
                debug!("Connection {} signalled to close", conn_id);
                break;
            }
            frame = tokio::time::timeout(config.idle_timeout, ws_receiver.next()) => frame,
        };

        let msg = match frame {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!("Read error on {}: {}", conn_id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for connection {}", conn_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                match limiter.check(Instant::now()) {
                    RateDecision::Allow => {}
                    RateDecision::RejectAndWarn => {
                        warn!("Rate limit exceeded for connection {}", conn_id);
                        manager
                            .broadcaster()
                            .send_error(
                                conn_id,
                                format!("Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"),
                            )
                            .await;
                        continue;
                    }
                    RateDecision::Reject => continue,
                }

                let start = Instant::now();
                let result = handle_text(&manager, conn_id, text.as_str()).await;
                metrics.observe_message_handling(start.elapsed());

                if let Err(e) = result {
                    warn!("Rejected message from {}: {}", conn_id, e);
                    metrics.inc_errors();
                    manager.broadcaster().send_error(conn_id, e.to_string()).await;
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Any frame resets the idle timer; axum answers pings itself
            }
            Message::Binary(_) => {
                warn!("Unexpected binary frame from connection {}", conn_id);
            }
        }
    }

    manager.disconnect(conn_id).await;
    let _ = send_task.await;
    info!("Connection {} closed", conn_id);
}

/// Decodes one text frame and applies it. Errors are meant for the
/// originating connection only.
pub async fn handle_text(
    manager: &RoomManager,
    conn_id: ConnectionId,
    text: &str,
) -> Result<(), DispatchError> {
    let command = Command::parse(text)?;
    if manager.is_shutting_down() {
        return Err(DispatchError::ShuttingDown);
    }
    debug!("Connection {}: {:?}", conn_id, command.action());

    let bound = manager.connections().identity(conn_id);

    match command {
        Command::CreateRoom { email, video_source, timestamp } => {
            manager.create_room(conn_id, &email, &video_source, timestamp).await?;
        }
        Command::JoinRoom { room_id, email } => {
            if bound.as_deref() == Some(email.as_str()) {
                return Err(DispatchError::AlreadyJoined(email));
            }
            manager.join_room(conn_id, &room_id, &email).await?;
        }
        Command::LeaveRoom { room_id, email } => {
            if bound.as_deref() != Some(email.as_str()) {
                return Err(DispatchError::NotJoined(email));
            }
            manager.leave_room(&room_id, &email).await?;
        }
        Command::Ping { email } => {
            manager.ping(&email);
        }
        Command::PlayerState { room_id, email, paused } => {
            manager.player_state(&room_id, &email, paused).await?;
        }
        Command::UpdateTimestamp { room_id, email, timestamp, seeking } => {
            manager.update_timestamp(&room_id, &email, timestamp, seeking).await?;
        }
        Command::ChatMessage { room_id, email, message } => {
            manager.chat_message(&room_id, &email, message).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistPolicy;
    use crate::store::{MemoryStore, WriteThrough};
    use serde_json::{json, Value};

    fn manager() -> RoomManager {
        let metrics = ServerMetrics::new();
        let persistence = WriteThrough::new(
            Arc::new(MemoryStore::new()),
            PersistPolicy::default(),
            metrics.clone(),
        );
        RoomManager::new(persistence, metrics, 10, Duration::from_millis(50))
    }

    fn connect(manager: &RoomManager) -> (ConnectionId, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(16);
        let (handle, _closed) = ConnectionHandle::new("127.0.0.1:8000", tx);
        let id = handle.id();
        manager.connections().register(handle);
        (id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|frame| serde_json::from_str(&frame).unwrap())
            .collect()
    }

    async fn create(manager: &RoomManager, conn: ConnectionId, email: &str) -> String {
        let text = json!({
            "action": "create_room",
            "data": {"email": email, "video_source": "v1", "timestamp": {"start": 0, "end": 100, "current": 0}}
        });
        handle_text(manager, conn, &text.to_string()).await.unwrap();
        manager.rooms().snapshot()[0].id().to_string()
    }

    #[tokio::test]
    async fn test_create_join_leave_flow() {
        let manager = manager();
        let (a, mut ra) = connect(&manager);
        let (b, mut rb) = connect(&manager);

        let room_id = create(&manager, a, "a@x.com").await;
        assert_eq!(manager.connections().identity(a).as_deref(), Some("a@x.com"));

        let join = json!({"action": "join_room", "data": {"room_id": room_id, "email": "b@x.com"}});
        handle_text(&manager, b, &join.to_string()).await.unwrap();

        let to_a = drain(&mut ra);
        assert_eq!(to_a.len(), 2);
        assert_eq!(to_a[1]["data"]["peers"].as_object().unwrap().len(), 2);
        assert_eq!(drain(&mut rb)[0]["action"], "user_joined");

        let leave = json!({"action": "leave_room", "data": {"room_id": room_id, "email": "b@x.com"}});
        handle_text(&manager, b, &leave.to_string()).await.unwrap();
        assert_eq!(drain(&mut ra)[0]["action"], "user_left");
        assert_eq!(manager.rooms().get(&room_id).unwrap().peer_count(), 1);
    }

    #[tokio::test]
    async fn test_validation_error_mutates_nothing() {
        let manager = manager();
        let (a, _ra) = connect(&manager);

        let join = json!({"action": "join_room", "data": {"room_id": "", "email": "b@x.com"}});
        let err = handle_text(&manager, a, &join.to_string()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(ProtocolError::Invalid { field: "room_id", .. })));
        assert_eq!(manager.connections().identity(a), None);

        let create = json!({
            "action": "create_room",
            "data": {"email": "a@x.com", "video_source": "v1", "timestamp": {"start": 0, "end": 100, "current": 150}}
        });
        assert!(handle_text(&manager, a, &create.to_string()).await.is_err());
        assert_eq!(manager.room_count(), 0);
    }

    #[tokio::test]
    async fn test_sequencing_rules() {
        let manager = manager();
        let (a, _ra) = connect(&manager);
        let room_id = create(&manager, a, "a@x.com").await;

        let rejoin = json!({"action": "join_room", "data": {"room_id": room_id, "email": "a@x.com"}});
        let err = handle_text(&manager, a, &rejoin.to_string()).await.unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyJoined(_)));

        let (c, _rc) = connect(&manager);
        let leave = json!({"action": "leave_room", "data": {"room_id": room_id, "email": "a@x.com"}});
        let err = handle_text(&manager, c, &leave.to_string()).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotJoined(_)));
        assert_eq!(manager.rooms().get(&room_id).unwrap().peer_count(), 1);

        let other = json!({
            "action": "create_room",
            "data": {"email": "b@x.com", "video_source": "v1", "timestamp": {"start": 0, "end": 100, "current": 0}}
        });
        let err = handle_text(&manager, a, &other.to_string()).await.unwrap_err();
        assert_eq!(err.to_string(), "Connection is already bound to another identity");
        assert_eq!(manager.room_count(), 1);
    }

    #[tokio::test]
    async fn test_room_errors_are_human_readable() {
        let manager = manager();
        let (a, _ra) = connect(&manager);

        let join = json!({"action": "join_room", "data": {"room_id": "nope", "email": "a@x.com"}});
        let err = handle_text(&manager, a, &join.to_string()).await.unwrap_err();
        assert_eq!(err.to_string(), "Room not found");

        let chat = json!({"action": "chat_message", "data": {"room_id": "nope", "email": "a@x.com", "message": "hi"}});
        let err = handle_text(&manager, a, &chat.to_string()).await.unwrap_err();
        assert_eq!(err.to_string(), "Room not found");

        let err = handle_text(&manager, a, r#"{"action":"fly","data":{}}"#).await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown message action: fly");
    }

    #[tokio::test]
    async fn test_ping_is_silent() {
        let manager = manager();
        let (a, mut ra) = connect(&manager);
        create(&manager, a, "a@x.com").await;
        drain(&mut ra);

        handle_text(&manager, a, r#"{"action":"ping","data":{"email":"a@x.com"}}"#).await.unwrap();
        handle_text(&manager, a, r#"{"action":"ping","data":{"email":"ghost@x.com"}}"#).await.unwrap();
        assert!(drain(&mut ra).is_empty());
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown() {
        let manager = manager();
        let (a, _ra) = connect(&manager);
        manager.shutdown().await;

        let err = handle_text(&manager, a, r#"{"action":"ping","data":{"email":"a@x.com"}}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ShuttingDown));
    }

    #[test]
    fn test_rate_limiter_burst_then_refill() {
        let mut limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..RATE_LIMIT_MAX_TOKENS {
            assert!(matches!(limiter.check(now), RateDecision::Allow));
        }
        assert!(matches!(limiter.check(now), RateDecision::RejectAndWarn));
        assert!(matches!(limiter.check(now), RateDecision::Reject));

        let later = now + Duration::from_millis(50);
        assert!(matches!(limiter.check(later), RateDecision::Allow));
    }
}
