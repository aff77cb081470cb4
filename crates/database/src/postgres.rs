use crate::store::{
    DurableStore, EntityKind, StoreChange, StoreError, StoreResult, CHANGE_CHANNEL_CAPACITY,
};
use crate::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{ConnectionStatus, Message, MessageId, Peer, SeenMessageId};
use tokio::sync::broadcast;
use tokio_postgres::Row;

const UPSERT_MESSAGE: &str = "INSERT INTO messages
     (id, sender_id, sender_name, content, sent_at, group_id, ttl, is_local)
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
     ON CONFLICT (id) DO UPDATE SET
        sender_id = EXCLUDED.sender_id,
        sender_name = EXCLUDED.sender_name,
        content = EXCLUDED.content,
        sent_at = EXCLUDED.sent_at,
        group_id = EXCLUDED.group_id,
        ttl = EXCLUDED.ttl,
        is_local = EXCLUDED.is_local";

const INSERT_SEEN: &str = "INSERT INTO seen_message_ids (message_id, first_seen)
     VALUES ($1, $2)
     ON CONFLICT (message_id) DO NOTHING";

const MESSAGE_COLUMNS: &str = "id, sender_id, sender_name, content, sent_at, group_id, ttl, is_local";

/// Durable store backed by PostgreSQL
pub struct PgStore {
    pool: DbPool,
    changes: broadcast::Sender<StoreChange>,
}

impl PgStore {
    /// Wrap a pool whose schema has already been migrated
    pub fn new(pool: DbPool) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { pool, changes }
    }

    /// Create a pool, run migrations and wrap it
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = crate::create_pool(database_url, max_connections).await?;
        crate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn client(&self) -> StoreResult<deadpool_postgres::Object> {
        if self.pool.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(self.pool.get().await?)
    }

    fn publish(&self, change: StoreChange) {
        let _ = self.changes.send(change);
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn row_to_message(row: &Row) -> StoreResult<Message> {
    let ttl: i16 = row.try_get("ttl")?;
    let ttl = u8::try_from(ttl)
        .map_err(|_| StoreError::Corrupt(format!("message ttl out of range: {}", ttl)))?;

    Ok(Message {
        id: row.try_get("id")?,
        sender_id: row.try_get("sender_id")?,
        sender_name: row.try_get("sender_name")?,
        content: row.try_get("content")?,
        timestamp: row.try_get("sent_at")?,
        group_id: row.try_get("group_id")?,
        ttl,
        is_local: row.try_get("is_local")?,
    })
}

fn row_to_peer(row: &Row) -> StoreResult<Peer> {
    let status: String = row.try_get("connection_status")?;
    let status = status
        .parse::<ConnectionStatus>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;

    Ok(Peer {
        device_id: row.try_get("device_id")?,
        name: row.try_get("name")?,
        last_seen: row.try_get("last_seen")?,
        status,
        group_id: row.try_get("group_id")?,
    })
}

fn row_to_seen(row: &Row) -> StoreResult<SeenMessageId> {
    Ok(SeenMessageId {
        message_id: row.try_get("message_id")?,
        first_seen: row.try_get("first_seen")?,
    })
}

#[async_trait]
impl DurableStore for PgStore {
    // ========================================================================
    // Messages
    // ========================================================================

    async fn put_message(&self, message: &Message) -> StoreResult<()> {
        let client = self.client().await?;
        let ttl = i16::from(message.ttl);
        client
            .execute(
                UPSERT_MESSAGE,
                &[
                    &message.id,
                    &message.sender_id,
                    &message.sender_name,
                    &message.content,
                    &message.timestamp,
                    &message.group_id,
                    &ttl,
                    &message.is_local,
                ],
            )
            .await?;
        self.publish(StoreChange::upsert(EntityKind::Message, message.id.clone()));
        Ok(())
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<Message>> {
        let client = self.client().await?;
        let query = format!("SELECT {} FROM messages WHERE id = $1", MESSAGE_COLUMNS);
        let row = client.query_opt(query.as_str(), &[&id]).await?;
        row.as_ref().map(row_to_message).transpose()
    }

    async fn list_messages(&self, group_id: Option<&str>) -> StoreResult<Vec<Message>> {
        let client = self.client().await?;
        let rows = match group_id {
            Some(group) => {
                let query = format!(
                    "SELECT {} FROM messages WHERE group_id = $1 ORDER BY sent_at DESC",
                    MESSAGE_COLUMNS
                );
                client.query(query.as_str(), &[&group]).await?
            }
            None => {
                let query = format!("SELECT {} FROM messages ORDER BY sent_at DESC", MESSAGE_COLUMNS);
                client.query(query.as_str(), &[]).await?
            }
        };
        rows.iter().map(row_to_message).collect()
    }

    async fn delete_messages_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let client = self.client().await?;
        let removed = client
            .execute(
                "DELETE FROM messages m
                 WHERE m.sent_at < $1
                   AND NOT EXISTS (
                       SELECT 1 FROM seen_message_ids s
                       WHERE s.message_id = m.id AND s.first_seen >= $1
                   )",
                &[&cutoff],
            )
            .await?;
        if removed > 0 {
            tracing::debug!("Deleted {} messages older than {}", removed, cutoff);
            self.publish(StoreChange::bulk_delete(EntityKind::Message, removed));
        }
        Ok(removed)
    }

    async fn count_messages(&self) -> StoreResult<u64> {
        let client = self.client().await?;
        let row = client.query_one("SELECT COUNT(*) FROM messages", &[]).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }

    // ========================================================================
    // Seen message ids
    // ========================================================================

    async fn put_seen(&self, seen: &SeenMessageId) -> StoreResult<bool> {
        let client = self.client().await?;
        let inserted = client
            .execute(INSERT_SEEN, &[&seen.message_id, &seen.first_seen])
            .await?;
        if inserted > 0 {
            self.publish(StoreChange::upsert(
                EntityKind::SeenMessageId,
                seen.message_id.clone(),
            ));
        }
        Ok(inserted > 0)
    }

    async fn get_seen(&self, message_id: &str) -> StoreResult<Option<SeenMessageId>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT message_id, first_seen FROM seen_message_ids WHERE message_id = $1",
                &[&message_id],
            )
            .await?;
        row.as_ref().map(row_to_seen).transpose()
    }

    async fn list_seen(&self) -> StoreResult<Vec<SeenMessageId>> {
        let client = self.client().await?;
        let rows = client
            .query("SELECT message_id, first_seen FROM seen_message_ids", &[])
            .await?;
        rows.iter().map(row_to_seen).collect()
    }

    async fn delete_seen_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<MessageId>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "DELETE FROM seen_message_ids s
                 WHERE s.first_seen < $1
                   AND NOT EXISTS (SELECT 1 FROM messages m WHERE m.id = s.message_id)
                 RETURNING s.message_id",
                &[&cutoff],
            )
            .await?;
        let removed = rows
            .iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<Result<Vec<_>, _>>()?;
        if !removed.is_empty() {
            self.publish(StoreChange::bulk_delete(
                EntityKind::SeenMessageId,
                removed.len() as u64,
            ));
        }
        Ok(removed)
    }

    async fn count_seen(&self) -> StoreResult<u64> {
        let client = self.client().await?;
        let row = client
            .query_one("SELECT COUNT(*) FROM seen_message_ids", &[])
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }

    async fn accept_message(&self, message: &Message, seen: &SeenMessageId) -> StoreResult<()> {
        let mut client = self.client().await?;
        let ttl = i16::from(message.ttl);

        // Dropping the transaction without commit rolls both writes back
        let tx = client.transaction().await?;
        tx.execute(
            UPSERT_MESSAGE,
            &[
                &message.id,
                &message.sender_id,
                &message.sender_name,
                &message.content,
                &message.timestamp,
                &message.group_id,
                &ttl,
                &message.is_local,
            ],
        )
        .await?;
        tx.execute(INSERT_SEEN, &[&seen.message_id, &seen.first_seen])
            .await?;
        tx.commit().await?;

        self.publish(StoreChange::upsert(EntityKind::Message, message.id.clone()));
        self.publish(StoreChange::upsert(
            EntityKind::SeenMessageId,
            seen.message_id.clone(),
        ));
        Ok(())
    }

    // ========================================================================
    // Peers
    // ========================================================================

    async fn put_peer(&self, peer: &Peer) -> StoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO peers (device_id, name, last_seen, connection_status, group_id)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (device_id) DO UPDATE SET
                    name = EXCLUDED.name,
                    last_seen = GREATEST(peers.last_seen, EXCLUDED.last_seen),
                    connection_status = EXCLUDED.connection_status,
                    group_id = EXCLUDED.group_id",
                &[
                    &peer.device_id,
                    &peer.name,
                    &peer.last_seen,
                    &peer.status.as_str(),
                    &peer.group_id,
                ],
            )
            .await?;
        self.publish(StoreChange::upsert(EntityKind::Peer, peer.device_id.clone()));
        Ok(())
    }

    async fn get_peer(&self, device_id: &str) -> StoreResult<Option<Peer>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT device_id, name, last_seen, connection_status, group_id
                 FROM peers WHERE device_id = $1",
                &[&device_id],
            )
            .await?;
        row.as_ref().map(row_to_peer).transpose()
    }

    async fn list_peers(&self) -> StoreResult<Vec<Peer>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT device_id, name, last_seen, connection_status, group_id
                 FROM peers ORDER BY last_seen DESC",
                &[],
            )
            .await?;
        rows.iter().map(row_to_peer).collect()
    }

    async fn delete_peer(&self, device_id: &str) -> StoreResult<bool> {
        let client = self.client().await?;
        let removed = client
            .execute("DELETE FROM peers WHERE device_id = $1", &[&device_id])
            .await?;
        if removed > 0 {
            self.publish(StoreChange::delete(EntityKind::Peer, device_id));
        }
        Ok(removed > 0)
    }

    async fn count_peers(&self, status: Option<ConnectionStatus>) -> StoreResult<u64> {
        let client = self.client().await?;
        let row = match status {
            Some(status) => {
                client
                    .query_one(
                        "SELECT COUNT(*) FROM peers WHERE connection_status = $1",
                        &[&status.as_str()],
                    )
                    .await?
            }
            None => client.query_one("SELECT COUNT(*) FROM peers", &[]).await?,
        };
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    async fn close(&self) {
        tracing::info!("Closing database connection pool");
        self.pool.close();
    }
}
