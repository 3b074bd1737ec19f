#![forbid(unsafe_code)]

use super::RoomError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One joined identity inside a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// Identity, unique within a room (an email in practice)
    pub email: String,
    pub joined_at: DateTime<Utc>,
    /// Transport address of the connection that joined
    pub connection: String,
    pub last_ping: DateTime<Utc>,
}

impl Peer {
    pub fn new(email: impl Into<String>, connection: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            email: email.into(),
            joined_at: now,
            connection: connection.into(),
            last_ping: now,
        }
    }

    pub fn validate(&self) -> Result<(), RoomError> {
        if self.email.trim().is_empty() {
            return Err(RoomError::InvalidPeer("email is required"));
        }
        if self.connection.trim().is_empty() {
            return Err(RoomError::InvalidPeer("connection is required"));
        }
        Ok(())
    }

    /// True if the peer has not been seen since `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_ping < cutoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_validate() {
        assert!(Peer::new("a@x.com", "127.0.0.1:5000").validate().is_ok());
        assert!(matches!(
            Peer::new("", "127.0.0.1:5000").validate(),
            Err(RoomError::InvalidPeer(_))
        ));
        assert!(matches!(
            Peer::new("a@x.com", " ").validate(),
            Err(RoomError::InvalidPeer(_))
        ));
    }

    #[test]
    fn test_is_stale() {
        let mut peer = Peer::new("a@x.com", "127.0.0.1:5000");
        let now = Utc::now();
        assert!(!peer.is_stale(now - Duration::seconds(30)));
        peer.last_ping = now - Duration::seconds(60);
        assert!(peer.is_stale(now - Duration::seconds(30)));
    }
}
