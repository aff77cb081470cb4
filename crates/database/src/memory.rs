//! In-process durable store
//!
//! Keeps every table behind one lock so that [`DurableStore::accept_message`]
//! is atomic. Used by nodes started without `DATABASE_URL` and by tests.

use crate::store::{
    DurableStore, EntityKind, StoreChange, StoreError, StoreResult, CHANGE_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{ConnectionStatus, Message, MessageId, Peer, SeenMessageId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

#[derive(Default)]
struct Tables {
    messages: HashMap<String, Message>,
    peers: HashMap<String, Peer>,
    seen: HashMap<String, SeenMessageId>,
}

pub struct MemoryStore {
    tables: RwLock<Tables>,
    changes: broadcast::Sender<StoreChange>,
    closed: AtomicBool,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            tables: RwLock::new(Tables::default()),
            changes,
            closed: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: while set, every write fails with
    /// [`StoreError::Unavailable`] and leaves the tables untouched
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }

    fn publish(&self, change: StoreChange) {
        // No subscribers is not an error
        let _ = self.changes.send(change);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn put_message(&self, message: &Message) -> StoreResult<()> {
        self.check_writable()?;
        self.tables
            .write()
            .await
            .messages
            .insert(message.id.clone(), message.clone());
        self.publish(StoreChange::upsert(EntityKind::Message, message.id.clone()));
        Ok(())
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<Message>> {
        Ok(self.tables.read().await.messages.get(id).cloned())
    }

    async fn list_messages(&self, group_id: Option<&str>) -> StoreResult<Vec<Message>> {
        let tables = self.tables.read().await;
        let mut messages: Vec<Message> = tables
            .messages
            .values()
            .filter(|m| group_id.map_or(true, |g| m.group_id.as_deref() == Some(g)))
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(messages)
    }

    async fn delete_messages_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.check_writable()?;
        let removed = {
            let mut tables = self.tables.write().await;
            let Tables { messages, seen, .. } = &mut *tables;
            let before = messages.len();
            messages.retain(|id, m| {
                m.timestamp >= cutoff || seen.get(id).map_or(false, |s| s.first_seen >= cutoff)
            });
            (before - messages.len()) as u64
        };
        if removed > 0 {
            debug!("Deleted {} messages older than {}", removed, cutoff);
            self.publish(StoreChange::bulk_delete(EntityKind::Message, removed));
        }
        Ok(removed)
    }

    async fn count_messages(&self) -> StoreResult<u64> {
        Ok(self.tables.read().await.messages.len() as u64)
    }

    async fn put_seen(&self, seen: &SeenMessageId) -> StoreResult<bool> {
        self.check_writable()?;
        let inserted = {
            let mut tables = self.tables.write().await;
            if tables.seen.contains_key(&seen.message_id) {
                false
            } else {
                tables.seen.insert(seen.message_id.clone(), seen.clone());
                true
            }
        };
        if inserted {
            self.publish(StoreChange::upsert(
                EntityKind::SeenMessageId,
                seen.message_id.clone(),
            ));
        }
        Ok(inserted)
    }

    async fn get_seen(&self, message_id: &str) -> StoreResult<Option<SeenMessageId>> {
        Ok(self.tables.read().await.seen.get(message_id).cloned())
    }

    async fn list_seen(&self) -> StoreResult<Vec<SeenMessageId>> {
        Ok(self.tables.read().await.seen.values().cloned().collect())
    }

    async fn delete_seen_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<MessageId>> {
        self.check_writable()?;
        let removed: Vec<MessageId> = {
            let mut tables = self.tables.write().await;
            let Tables { messages, seen, .. } = &mut *tables;
            let expired: Vec<MessageId> = seen
                .values()
                .filter(|s| s.first_seen < cutoff && !messages.contains_key(&s.message_id))
                .map(|s| s.message_id.clone())
                .collect();
            for id in &expired {
                seen.remove(id);
            }
            expired
        };
        if !removed.is_empty() {
            self.publish(StoreChange::bulk_delete(
                EntityKind::SeenMessageId,
                removed.len() as u64,
            ));
        }
        Ok(removed)
    }

    async fn count_seen(&self) -> StoreResult<u64> {
        Ok(self.tables.read().await.seen.len() as u64)
    }

    async fn accept_message(&self, message: &Message, seen: &SeenMessageId) -> StoreResult<()> {
        self.check_writable()?;
        {
            let mut tables = self.tables.write().await;
            tables.messages.insert(message.id.clone(), message.clone());
            tables
                .seen
                .entry(seen.message_id.clone())
                .or_insert_with(|| seen.clone());
        }
        self.publish(StoreChange::upsert(EntityKind::Message, message.id.clone()));
        self.publish(StoreChange::upsert(
            EntityKind::SeenMessageId,
            seen.message_id.clone(),
        ));
        Ok(())
    }

    async fn put_peer(&self, peer: &Peer) -> StoreResult<()> {
        self.check_writable()?;
        self.tables
            .write()
            .await
            .peers
            .insert(peer.device_id.clone(), peer.clone());
        self.publish(StoreChange::upsert(EntityKind::Peer, peer.device_id.clone()));
        Ok(())
    }

    async fn get_peer(&self, device_id: &str) -> StoreResult<Option<Peer>> {
        Ok(self.tables.read().await.peers.get(device_id).cloned())
    }

    async fn list_peers(&self) -> StoreResult<Vec<Peer>> {
        let mut peers: Vec<Peer> = self.tables.read().await.peers.values().cloned().collect();
        peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(peers)
    }

    async fn delete_peer(&self, device_id: &str) -> StoreResult<bool> {
        self.check_writable()?;
        let removed = self.tables.write().await.peers.remove(device_id).is_some();
        if removed {
            self.publish(StoreChange::delete(EntityKind::Peer, device_id));
        }
        Ok(removed)
    }

    async fn count_peers(&self, status: Option<ConnectionStatus>) -> StoreResult<u64> {
        let tables = self.tables.read().await;
        let count = tables
            .peers
            .values()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .count();
        Ok(count as u64)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Memory store closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeOp;
    use chrono::Duration;

    fn message(id: &str, group: Option<&str>, timestamp: DateTime<Utc>) -> Message {
        Message {
            id: id.to_string(),
            sender_id: "dev-1".to_string(),
            sender_name: "alice".to_string(),
            content: format!("content of {}", id),
            timestamp,
            group_id: group.map(str::to_string),
            ttl: 5,
            is_local: false,
        }
    }

    #[tokio::test]
    async fn test_put_and_get_message() {
        let store = MemoryStore::new();
        let msg = message("m1", None, Utc::now());

        store.put_message(&msg).await.unwrap();

        assert_eq!(store.get_message("m1").await.unwrap(), Some(msg));
        assert_eq!(store.get_message("missing").await.unwrap(), None);
        assert_eq!(store.count_messages().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_messages_newest_first_and_group_filter() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.put_message(&message("old", Some("g1"), now - Duration::minutes(5))).await.unwrap();
        store.put_message(&message("new", Some("g1"), now)).await.unwrap();
        store.put_message(&message("other", Some("g2"), now)).await.unwrap();
        store.put_message(&message("none", None, now)).await.unwrap();

        let all = store.list_messages(None).await.unwrap();
        assert_eq!(all.len(), 4);

        let g1: Vec<String> = store
            .list_messages(Some("g1"))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(g1, vec!["new".to_string(), "old".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_messages_before() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.put_message(&message("stale", None, now - Duration::days(8))).await.unwrap();
        store.put_message(&message("fresh", None, now)).await.unwrap();

        let removed = store.delete_messages_before(now - Duration::days(7)).await.unwrap();

        assert_eq!(removed, 1);
        assert!(store.get_message("stale").await.unwrap().is_none());
        assert!(store.get_message("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_message_and_seen_id_expire_together() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let cutoff = now - Duration::days(7);
        let long_ago = now - Duration::days(8);

        // Sender clock ahead: timestamp is fresh, first sighting is old
        let ahead = message("ahead", None, now + Duration::days(2));
        store.accept_message(&ahead, &SeenMessageId::new("ahead", long_ago)).await.unwrap();
        // Sender clock behind: timestamp is old, first sighting is fresh
        let behind = message("behind", None, long_ago);
        store.accept_message(&behind, &SeenMessageId::new("behind", now)).await.unwrap();
        let expired = message("expired", None, long_ago);
        store.accept_message(&expired, &SeenMessageId::new("expired", long_ago)).await.unwrap();
        store.put_seen(&SeenMessageId::new("orphan", long_ago)).await.unwrap();

        assert_eq!(store.delete_messages_before(cutoff).await.unwrap(), 1);
        let mut purged = store.delete_seen_before(cutoff).await.unwrap();
        purged.sort();

        assert_eq!(purged, vec!["expired".to_string(), "orphan".to_string()]);
        for id in ["ahead", "behind"] {
            assert!(store.get_message(id).await.unwrap().is_some());
            assert!(store.get_seen(id).await.unwrap().is_some());
        }
        assert!(store.get_message("expired").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_seen_is_insert_or_ignore() {
        let store = MemoryStore::new();
        let now = Utc::now();

        assert!(store.put_seen(&SeenMessageId::new("m1", now)).await.unwrap());
        assert!(!store
            .put_seen(&SeenMessageId::new("m1", now + Duration::seconds(5)))
            .await
            .unwrap());

        // First-seen timestamp is not overwritten
        assert_eq!(store.get_seen("m1").await.unwrap().unwrap().first_seen, now);
        assert_eq!(store.count_seen().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_accept_message_writes_both_records() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let msg = message("m1", None, now);

        store.accept_message(&msg, &SeenMessageId::new("m1", now)).await.unwrap();

        assert!(store.get_message("m1").await.unwrap().is_some());
        assert!(store.get_seen("m1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unavailable_store_writes_nothing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.set_unavailable(true);

        let result = store
            .accept_message(&message("m1", None, now), &SeenMessageId::new("m1", now))
            .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.count_messages().await.unwrap(), 0);
        assert_eq!(store.count_seen().await.unwrap(), 0);

        store.set_unavailable(false);
        assert!(store
            .accept_message(&message("m1", None, now), &SeenMessageId::new("m1", now))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_peer_counts_by_status() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut a = Peer::discovered("a", "Alice", None, now);
        a.status = ConnectionStatus::Connected;
        let b = Peer::discovered("b", "Bob", None, now - Duration::minutes(1));

        store.put_peer(&a).await.unwrap();
        store.put_peer(&b).await.unwrap();

        assert_eq!(store.count_peers(None).await.unwrap(), 2);
        assert_eq!(store.count_peers(Some(ConnectionStatus::Connected)).await.unwrap(), 1);

        let ordered: Vec<String> = store
            .list_peers()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.device_id)
            .collect();
        assert_eq!(ordered, vec!["a".to_string(), "b".to_string()]);

        assert!(store.delete_peer("b").await.unwrap());
        assert!(!store.delete_peer("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_subscribers_receive_changes() {
        let store = MemoryStore::new();
        let mut changes = store.subscribe();
        let now = Utc::now();

        store.put_peer(&Peer::discovered("a", "Alice", None, now)).await.unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.entity, EntityKind::Peer);
        assert_eq!(change.op, ChangeOp::Upsert);
        assert_eq!(change.key.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_writes() {
        let store = MemoryStore::new();
        store.close().await;

        let result = store.put_message(&message("m1", None, Utc::now())).await;
        assert!(matches!(result, Err(StoreError::Closed)));
    }
}
