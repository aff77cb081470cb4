//! Ledger of message ids this node has already accepted

use crate::error::MeshResult;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use database::DurableStore;
use shared::{MessageId, SeenMessageId};
use std::sync::Arc;
use tracing::{debug, info};

/// Exact set of seen message ids with their first-seen time
///
/// The in-memory map is authoritative for concurrent checks. Every id that
/// ends up committed is also written to the durable store so the set
/// survives a restart.
pub struct DedupLedger {
    seen: DashMap<MessageId, DateTime<Utc>>,
    store: Arc<dyn DurableStore>,
}

/// A reservation on a message id, released on drop unless committed
pub struct Claim<'a> {
    ledger: &'a DedupLedger,
    id: MessageId,
    committed: bool,
}

impl<'a> Claim<'a> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Keep the id marked as seen
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl<'a> Drop for Claim<'a> {
    fn drop(&mut self) {
        if !self.committed {
            self.ledger.release(&self.id);
        }
    }
}

impl DedupLedger {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            seen: DashMap::new(),
            store,
        }
    }

    /// Populate the ledger from the durable store
    pub async fn load(&self) -> MeshResult<usize> {
        let records = self.store.list_seen().await?;
        let mut loaded = 0;
        for record in records {
            if let Entry::Vacant(slot) = self.seen.entry(record.message_id) {
                slot.insert(record.first_seen);
                loaded += 1;
            }
        }

        info!(loaded = loaded, "Loaded seen message ids from store");
        Ok(loaded)
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.seen.contains_key(id)
    }

    /// Atomically check and mark an id
    ///
    /// Returns `None` if the id was already present. Of any number of
    /// concurrent claims on the same id exactly one succeeds.
    pub fn claim(&self, id: &str, now: DateTime<Utc>) -> Option<Claim<'_>> {
        match self.seen.entry(id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(now);
                Some(Claim {
                    ledger: self,
                    id: id.to_string(),
                    committed: false,
                })
            }
        }
    }

    /// Mark an id as seen and persist it
    ///
    /// Marking an id that is already present is a no-op.
    pub async fn mark_seen(&self, id: &str, now: DateTime<Utc>) -> MeshResult<()> {
        let Some(claim) = self.claim(id, now) else {
            return Ok(());
        };

        self.store.put_seen(&SeenMessageId::new(id, now)).await?;
        claim.commit();
        Ok(())
    }

    /// Forget ids first seen before `cutoff`, in the store and in memory
    ///
    /// An id whose message is still stored is kept, so duplicates of a
    /// stored message stay suppressed.
    pub async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> MeshResult<usize> {
        let purged = self.store.delete_seen_before(cutoff).await?;
        for id in &purged {
            self.seen.remove(id);
        }

        debug!(removed = purged.len(), cutoff = %cutoff, "Evicted seen message ids");
        Ok(purged.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn release(&self, id: &str) {
        self.seen.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use database::MemoryStore;

    fn ledger() -> (DedupLedger, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (DedupLedger::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_mark_seen_is_idempotent() {
        let (ledger, store) = ledger();
        let now = Utc::now();

        ledger.mark_seen("m1", now).await.unwrap();
        ledger.mark_seen("m1", now + Duration::seconds(5)).await.unwrap();

        assert!(ledger.has_seen("m1"));
        assert_eq!(ledger.len(), 1);
        let record = store.get_seen("m1").await.unwrap().unwrap();
        assert_eq!(record.first_seen, now);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (ledger, _) = ledger();

        let first = ledger.claim("m1", Utc::now());
        let second = ledger.claim("m1", Utc::now());

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_uncommitted_claim_is_released() {
        let (ledger, _) = ledger();

        {
            let _claim = ledger.claim("m1", Utc::now()).unwrap();
            assert!(ledger.has_seen("m1"));
        }

        assert!(!ledger.has_seen("m1"));
        assert!(ledger.claim("m1", Utc::now()).is_some());
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_id_unseen() {
        let (ledger, store) = ledger();
        store.set_unavailable(true);

        assert!(ledger.mark_seen("m1", Utc::now()).await.is_err());
        assert!(!ledger.has_seen("m1"));

        store.set_unavailable(false);
        ledger.mark_seen("m1", Utc::now()).await.unwrap();
        assert!(ledger.has_seen("m1"));
    }

    #[tokio::test]
    async fn test_evict_older_than() {
        let (ledger, store) = ledger();
        let now = Utc::now();
        ledger.mark_seen("old", now - Duration::days(8)).await.unwrap();
        ledger.mark_seen("fresh", now).await.unwrap();

        let removed = ledger.evict_older_than(now - Duration::days(7)).await.unwrap();

        assert_eq!(removed, 1);
        assert!(!ledger.has_seen("old"));
        assert!(ledger.has_seen("fresh"));
        assert!(store.get_seen("old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evict_keeps_ids_of_stored_messages() {
        let (ledger, store) = ledger();
        let now = Utc::now();
        let first_seen = now - Duration::days(8);
        let message = shared::Message {
            id: "kept".to_string(),
            sender_id: "a".to_string(),
            sender_name: "A".to_string(),
            content: "still on disk".to_string(),
            timestamp: now,
            group_id: None,
            ttl: 0,
            is_local: false,
        };
        store
            .accept_message(&message, &SeenMessageId::new("kept", first_seen))
            .await
            .unwrap();
        ledger.load().await.unwrap();

        let removed = ledger.evict_older_than(now - Duration::days(7)).await.unwrap();

        assert_eq!(removed, 0);
        assert!(ledger.has_seen("kept"));
        assert!(store.get_seen("kept").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_load_restores_persisted_ids() {
        let store = Arc::new(MemoryStore::new());
        {
            let ledger = DedupLedger::new(store.clone());
            ledger.mark_seen("m1", Utc::now()).await.unwrap();
            ledger.mark_seen("m2", Utc::now()).await.unwrap();
        }

        let restarted = DedupLedger::new(store);
        assert_eq!(restarted.load().await.unwrap(), 2);
        assert!(restarted.has_seen("m1"));
        assert!(restarted.has_seen("m2"));
    }
}
