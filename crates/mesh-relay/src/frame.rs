//! Wire representation of relayed messages

use crate::error::{MeshError, MeshResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{Message, MessageId, PeerId};

/// Largest encoded frame a transport should accept
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// A message as it travels between peers
///
/// The origin flag is local bookkeeping and is not transmitted: every decoded
/// frame is a relayed message from the receiver's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshFrame {
    pub id: MessageId,
    pub sender_id: PeerId,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub ttl: u8,
}

impl From<&Message> for MeshFrame {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            sender_name: message.sender_name.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
            group_id: message.group_id.clone(),
            ttl: message.ttl,
        }
    }
}

impl From<MeshFrame> for Message {
    fn from(frame: MeshFrame) -> Self {
        Message {
            id: frame.id,
            sender_id: frame.sender_id,
            sender_name: frame.sender_name,
            content: frame.content,
            timestamp: frame.timestamp,
            group_id: frame.group_id,
            ttl: frame.ttl,
            is_local: false,
        }
    }
}

/// Serialize a message for transmission
pub fn encode(message: &Message) -> MeshResult<Vec<u8>> {
    let bytes = serde_json::to_vec(&MeshFrame::from(message))?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(MeshError::InvalidMessage(format!(
            "encoded frame is {} bytes, limit is {}",
            bytes.len(),
            MAX_FRAME_LEN
        )));
    }
    Ok(bytes)
}

/// Parse a received frame into a relayed message
pub fn decode(bytes: &[u8]) -> MeshResult<Message> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(MeshError::InvalidMessage(format!(
            "frame of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    let frame: MeshFrame = serde_json::from_slice(bytes)
        .map_err(|e| MeshError::InvalidMessage(format!("undecodable frame: {}", e)))?;
    if frame.id.is_empty() {
        return Err(MeshError::InvalidMessage("frame without message id".to_string()));
    }
    Ok(frame.into())
}
