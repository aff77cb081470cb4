use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Globally unique message identifier
pub type MessageId = String;

/// Unique device identifier of a mesh peer
pub type PeerId = String;

// Message models
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: PeerId,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub group_id: Option<String>,
    /// Remaining hops; a message at zero is stored but never rebroadcast
    pub ttl: u8,
    /// True when authored on this node, false when received from the mesh
    pub is_local: bool,
}

impl Message {
    /// Create a locally authored message with a fresh identifier
    pub fn new_local(
        sender_id: impl Into<PeerId>,
        sender_name: impl Into<String>,
        content: impl Into<String>,
        group_id: Option<String>,
        ttl: u8,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            content: content.into(),
            timestamp,
            group_id,
            ttl,
            is_local: true,
        }
    }

    /// Copy sent to the next hop, or `None` when the hop budget is spent
    pub fn next_hop(&self) -> Option<Message> {
        let ttl = self.ttl.checked_sub(1)?;
        Some(Message {
            ttl,
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenMessageId {
    pub message_id: MessageId,
    pub first_seen: DateTime<Utc>,
}

impl SeenMessageId {
    pub fn new(message_id: impl Into<MessageId>, first_seen: DateTime<Utc>) -> Self {
        Self {
            message_id: message_id.into(),
            first_seen,
        }
    }
}

// Peer models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Discovered => "DISCOVERED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DISCOVERED" => Ok(ConnectionStatus::Discovered),
            "CONNECTING" => Ok(ConnectionStatus::Connecting),
            "CONNECTED" => Ok(ConnectionStatus::Connected),
            "DISCONNECTED" => Ok(ConnectionStatus::Disconnected),
            other => Err(Error::Validation(format!(
                "unknown connection status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub device_id: PeerId,
    pub name: String,
    pub last_seen: DateTime<Utc>,
    pub status: ConnectionStatus,
    pub group_id: Option<String>,
}

impl Peer {
    /// A freshly discovered peer
    pub fn discovered(
        device_id: impl Into<PeerId>,
        name: impl Into<String>,
        group_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            name: name.into(),
            last_seen: now,
            status: ConnectionStatus::Discovered,
            group_id,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_local_message() {
        let now = Utc::now();
        let message = Message::new_local("dev-1", "alice", "hello", None, 5, now);

        assert!(message.is_local);
        assert_eq!(message.ttl, 5);
        assert_eq!(message.timestamp, now);
        assert!(Uuid::parse_str(&message.id).is_ok());
    }

    #[test]
    fn test_next_hop_decrements_ttl() {
        let message = Message::new_local("dev-1", "alice", "hello", None, 2, Utc::now());

        let hop = message.next_hop().unwrap();
        assert_eq!(hop.ttl, 1);
        assert_eq!(hop.id, message.id);
        assert_eq!(hop.content, message.content);

        let last = hop.next_hop().unwrap();
        assert_eq!(last.ttl, 0);
        assert!(last.next_hop().is_none());
    }

    #[test]
    fn test_connection_status_parsing() {
        for status in [
            ConnectionStatus::Discovered,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
        ] {
            assert_eq!(status.as_str().parse::<ConnectionStatus>().unwrap(), status);
        }
        assert!("ONLINE".parse::<ConnectionStatus>().is_err());
    }

    #[test]
    fn test_connection_status_serializes_like_the_peers_table() {
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Disconnected).unwrap(),
            "\"DISCONNECTED\""
        );
    }
}
