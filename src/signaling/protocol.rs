#![forbid(unsafe_code)]

// Signaling protocol - JSON envelopes exchanged over the WebSocket.
// Inbound frames are validated once here into a typed `Command`.

use crate::room::{Peer, RoomSnapshot, Timestamps};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Identities are emails; RFC 5321 caps those at 320 bytes.
pub const MAX_IDENTITY_LEN: usize = 320;
pub const MAX_ROOM_ID_LEN: usize = 128;
pub const MAX_VIDEO_SOURCE_LEN: usize = 2048;
pub const MAX_CHAT_LEN: usize = 2000;

/// Wire shape of every frame in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateRoom,
    JoinRoom,
    LeaveRoom,
    Ping,
    PlayerState,
    UpdateTimestamp,
    ChatMessage,
}

impl Action {
    pub fn from_wire(action: &str) -> Option<Self> {
        Some(match action {
            "create_room" => Action::CreateRoom,
            "join_room" => Action::JoinRoom,
            "leave_room" => Action::LeaveRoom,
            "ping" => Action::Ping,
            "player_state" => Action::PlayerState,
            "update_timestamp" => Action::UpdateTimestamp,
            "chat_message" => Action::ChatMessage,
            _ => return None,
        })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::CreateRoom => "create room",
            Action::JoinRoom => "join room",
            Action::LeaveRoom => "leave room",
            Action::Ping => "ping",
            Action::PlayerState => "player state",
            Action::UpdateTimestamp => "update timestamp",
            Action::ChatMessage => "chat message",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid message format")]
    Malformed,

    #[error("Unknown message action: {0}")]
    UnknownAction(String),

    #[error("Invalid {action} data: {reason}")]
    InvalidPayload { action: Action, reason: String },

    #[error("Invalid {action} data: invalid {field}")]
    Invalid { action: Action, field: &'static str },
}

/// A validated inbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateRoom {
        email: String,
        video_source: String,
        timestamp: Timestamps,
    },
    JoinRoom {
        room_id: String,
        email: String,
    },
    LeaveRoom {
        room_id: String,
        email: String,
    },
    Ping {
        email: String,
    },
    PlayerState {
        room_id: String,
        email: String,
        paused: bool,
    },
    UpdateTimestamp {
        room_id: String,
        email: String,
        timestamp: f64,
        seeking: bool,
    },
    ChatMessage {
        room_id: String,
        email: String,
        message: String,
    },
}

// Raw payloads: every field optional so a missing one is reported by name.

#[derive(Deserialize)]
struct RawTimestamps {
    start: Option<f64>,
    end: Option<f64>,
    current: Option<f64>,
}

#[derive(Deserialize)]
struct CreateRoomData {
    email: Option<String>,
    video_source: Option<String>,
    timestamp: Option<RawTimestamps>,
}

#[derive(Deserialize)]
struct MembershipData {
    room_id: Option<String>,
    email: Option<String>,
}

#[derive(Deserialize)]
struct PingData {
    email: Option<String>,
}

#[derive(Deserialize)]
struct PlayerStateData {
    room_id: Option<String>,
    email: Option<String>,
    #[serde(alias = "state")]
    paused: Option<bool>,
}

#[derive(Deserialize)]
struct VideoSyncData {
    room_id: Option<String>,
    email: Option<String>,
    timestamp: Option<f64>,
    seeking: Option<bool>,
}

#[derive(Deserialize)]
struct ChatData {
    room_id: Option<String>,
    email: Option<String>,
    message: Option<String>,
}

impl Command {
    /// Decodes one text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|_| ProtocolError::Malformed)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let action = Action::from_wire(&envelope.action)
            .ok_or_else(|| ProtocolError::UnknownAction(envelope.action.clone()))?;
        let data = envelope.data;

        match action {
            Action::CreateRoom => {
                let raw: CreateRoomData = payload(action, data)?;
                let email = required(action, "email", raw.email, MAX_IDENTITY_LEN)?;
                let ts = raw.timestamp.ok_or(ProtocolError::Invalid {
                    action,
                    field: "timestamp data",
                })?;
                let timestamp = validate_timestamps(action, ts)?;
                let video_source =
                    required(action, "video source", raw.video_source, MAX_VIDEO_SOURCE_LEN)?;
                Ok(Command::CreateRoom { email, video_source, timestamp })
            }
            Action::JoinRoom | Action::LeaveRoom => {
                let raw: MembershipData = payload(action, data)?;
                let room_id = required(action, "room_id", raw.room_id, MAX_ROOM_ID_LEN)?;
                let email = required(action, "email", raw.email, MAX_IDENTITY_LEN)?;
                Ok(if action == Action::JoinRoom {
                    Command::JoinRoom { room_id, email }
                } else {
                    Command::LeaveRoom { room_id, email }
                })
            }
            Action::Ping => {
                let raw: PingData = payload(action, data)?;
                let email = required(action, "email", raw.email, MAX_IDENTITY_LEN)?;
                Ok(Command::Ping { email })
            }
            Action::PlayerState => {
                let raw: PlayerStateData = payload(action, data)?;
                let email = required(action, "email", raw.email, MAX_IDENTITY_LEN)?;
                let paused = raw.paused.ok_or(ProtocolError::Invalid { action, field: "paused" })?;
                let room_id = required(action, "room_id", raw.room_id, MAX_ROOM_ID_LEN)?;
                Ok(Command::PlayerState { room_id, email, paused })
            }
            Action::UpdateTimestamp => {
                let raw: VideoSyncData = payload(action, data)?;
                let email = required(action, "email", raw.email, MAX_IDENTITY_LEN)?;
                let timestamp = raw
                    .timestamp
                    .filter(|t| t.is_finite())
                    .ok_or(ProtocolError::Invalid { action, field: "timestamp" })?;
                let seeking = raw.seeking.ok_or(ProtocolError::Invalid { action, field: "seeking" })?;
                let room_id = required(action, "room_id", raw.room_id, MAX_ROOM_ID_LEN)?;
                Ok(Command::UpdateTimestamp { room_id, email, timestamp, seeking })
            }
            Action::ChatMessage => {
                let raw: ChatData = payload(action, data)?;
                let email = required(action, "email", raw.email, MAX_IDENTITY_LEN)?;
                let message = required(action, "message", raw.message, MAX_CHAT_LEN)?;
                let room_id = required(action, "room_id", raw.room_id, MAX_ROOM_ID_LEN)?;
                Ok(Command::ChatMessage { room_id, email, message })
            }
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Command::CreateRoom { .. } => Action::CreateRoom,
            Command::JoinRoom { .. } => Action::JoinRoom,
            Command::LeaveRoom { .. } => Action::LeaveRoom,
            Command::Ping { .. } => Action::Ping,
            Command::PlayerState { .. } => Action::PlayerState,
            Command::UpdateTimestamp { .. } => Action::UpdateTimestamp,
            Command::ChatMessage { .. } => Action::ChatMessage,
        }
    }
}

fn payload<T: DeserializeOwned>(action: Action, data: Value) -> Result<T, ProtocolError> {
    if !data.is_object() {
        return Err(ProtocolError::InvalidPayload {
            action,
            reason: "invalid data format".to_string(),
        });
    }
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        action,
        reason: e.to_string(),
    })
}

fn required(
    action: Action,
    field: &'static str,
    value: Option<String>,
    max_len: usize,
) -> Result<String, ProtocolError> {
    match value {
        Some(v) if !v.trim().is_empty() && v.len() <= max_len => Ok(v),
        _ => Err(ProtocolError::Invalid { action, field }),
    }
}

fn validate_timestamps(action: Action, raw: RawTimestamps) -> Result<Timestamps, ProtocolError> {
    let start = raw
        .start
        .filter(|s| s.is_finite() && *s >= 0.0)
        .ok_or(ProtocolError::Invalid { action, field: "start timestamp" })?;
    let end = raw
        .end
        .filter(|e| e.is_finite() && *e > 0.0)
        .ok_or(ProtocolError::Invalid { action, field: "end timestamp" })?;
    let current = raw
        .current
        .filter(|c| *c >= start && *c <= end)
        .ok_or(ProtocolError::Invalid { action, field: "current timestamp" })?;
    Ok(Timestamps { start, end, current })
}

/// Server-to-client events, serialized as `{"action": ..., "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    UserJoined {
        peer: Peer,
        peers: HashMap<String, Peer>,
        room: RoomSnapshot,
    },
    UserLeft {
        email: String,
        peers: HashMap<String, Peer>,
        room: RoomSnapshot,
    },
    UpdatePlayerState {
        email: String,
        state: bool,
        room: String,
    },
    UpdateTimestamp {
        email: String,
        timestamp: f64,
        seeking: bool,
        room: String,
    },
    ChatMessage {
        id: Uuid,
        email: String,
        message: String,
        timestamp: DateTime<Utc>,
        room: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }

    pub fn chat(room: &str, email: &str, message: String) -> Self {
        ServerMessage::ChatMessage {
            id: Uuid::new_v4(),
            email: email.to_string(),
            message,
            timestamp: Utc::now(),
            room: room.to_string(),
        }
    }
}
