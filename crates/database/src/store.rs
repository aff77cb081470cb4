//! Durable store contract shared by the relay engine and the display layer

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{ConnectionStatus, Message, MessageId, Peer, SeenMessageId};
use thiserror::Error;
use tokio::sync::broadcast;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a durable store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store closed")]
    Closed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        StoreError::Pool(err.to_string())
    }
}

/// Entity families a subscriber can filter on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Message,
    Peer,
    SeenMessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Upsert,
    Delete,
}

/// A change notification pushed to every subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub entity: EntityKind,
    pub op: ChangeOp,
    /// Key of the affected record, `None` for bulk deletions
    pub key: Option<String>,
    /// Rows affected
    pub count: u64,
}

impl StoreChange {
    pub fn upsert(entity: EntityKind, key: impl Into<String>) -> Self {
        Self {
            entity,
            op: ChangeOp::Upsert,
            key: Some(key.into()),
            count: 1,
        }
    }

    pub fn delete(entity: EntityKind, key: impl Into<String>) -> Self {
        Self {
            entity,
            op: ChangeOp::Delete,
            key: Some(key.into()),
            count: 1,
        }
    }

    pub fn bulk_delete(entity: EntityKind, count: u64) -> Self {
        Self {
            entity,
            op: ChangeOp::Delete,
            key: None,
            count,
        }
    }
}

/// Capacity of the change notification channel
pub const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Persistence for messages, peers and seen message ids
///
/// Implementations must be safe to share across tasks. Writes publish a
/// [`StoreChange`] to subscribers after they become visible to readers.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert or replace a message
    async fn put_message(&self, message: &Message) -> StoreResult<()>;

    async fn get_message(&self, id: &str) -> StoreResult<Option<Message>>;

    /// Messages newest first, restricted to one group when `group_id` is set
    async fn list_messages(&self, group_id: Option<&str>) -> StoreResult<Vec<Message>>;

    /// Delete messages whose timestamp is strictly before `cutoff`
    ///
    /// A message whose seen id was first seen at or after `cutoff` is kept,
    /// so a message and its seen id expire together.
    async fn delete_messages_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    async fn count_messages(&self) -> StoreResult<u64>;

    /// Record a seen id; returns false when the id was already present
    async fn put_seen(&self, seen: &SeenMessageId) -> StoreResult<bool>;

    async fn get_seen(&self, message_id: &str) -> StoreResult<Option<SeenMessageId>>;

    async fn list_seen(&self) -> StoreResult<Vec<SeenMessageId>>;

    /// Delete seen ids first seen strictly before `cutoff`, returning them
    ///
    /// Ids whose message is still stored are kept.
    async fn delete_seen_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<MessageId>>;

    async fn count_seen(&self) -> StoreResult<u64>;

    /// Persist an accepted message and its seen id as one atomic write
    ///
    /// Either both records become visible or neither does.
    async fn accept_message(&self, message: &Message, seen: &SeenMessageId) -> StoreResult<()>;

    /// Insert or replace a peer
    async fn put_peer(&self, peer: &Peer) -> StoreResult<()>;

    async fn get_peer(&self, device_id: &str) -> StoreResult<Option<Peer>>;

    /// Peers ordered by most recently seen
    async fn list_peers(&self) -> StoreResult<Vec<Peer>>;

    async fn delete_peer(&self, device_id: &str) -> StoreResult<bool>;

    /// Count peers, optionally only those in `status`
    async fn count_peers(&self, status: Option<ConnectionStatus>) -> StoreResult<u64>;

    /// Subscribe to change notifications
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;

    /// Release underlying handles; later writes fail with [`StoreError::Closed`]
    async fn close(&self);
}
