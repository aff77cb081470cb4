//! Registry of known peers and their connection lifecycle

use crate::error::{MeshError, MeshResult};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use database::DurableStore;
use shared::{ConnectionStatus, Peer, PeerId};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Slot holding one peer. `None` means not yet created or already evicted.
type PeerSlot = Arc<Mutex<Option<Peer>>>;

/// Whether the lifecycle allows moving from `from` to `to`
pub fn is_valid_transition(from: ConnectionStatus, to: ConnectionStatus) -> bool {
    use shared::ConnectionStatus::*;

    matches!(
        (from, to),
        (Discovered, Connecting)
            | (Connecting, Connected)
            | (_, Disconnected)
            | (Disconnected, Discovered)
            | (Disconnected, Connecting)
    )
}

/// Known peers, written through to the durable store
///
/// Each peer sits behind its own lock so updates to one peer are
/// serialized, including the store write, while different peers proceed
/// independently. Readers never take those locks: they see the last state
/// that reached the store.
pub struct PeerRegistry {
    slots: DashMap<PeerId, PeerSlot>,
    /// Last committed state per peer, only written while holding its slot
    view: DashMap<PeerId, Peer>,
    store: Arc<dyn DurableStore>,
}

impl PeerRegistry {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            slots: DashMap::new(),
            view: DashMap::new(),
            store,
        }
    }

    /// Restore peers from the store
    ///
    /// Links do not survive a restart, so every restored peer starts out
    /// disconnected.
    pub async fn load(&self) -> MeshResult<usize> {
        let stored = self.store.list_peers().await?;
        let mut loaded = 0;
        for mut peer in stored {
            if peer.status != ConnectionStatus::Disconnected {
                peer.status = ConnectionStatus::Disconnected;
                self.store.put_peer(&peer).await?;
            }
            self.view.insert(peer.device_id.clone(), peer.clone());
            self.slots
                .insert(peer.device_id.clone(), Arc::new(Mutex::new(Some(peer))));
            loaded += 1;
        }

        info!(loaded = loaded, "Loaded peers from store");
        Ok(loaded)
    }

    /// Record a sighting of a peer
    ///
    /// Unknown peers are created as discovered. Known peers get their name
    /// refreshed, their group replaced when one is given, and `last_seen`
    /// advanced; the connection state is left alone.
    pub async fn observe(
        &self,
        peer_id: &str,
        name: &str,
        group_id: Option<String>,
        now: DateTime<Utc>,
    ) -> MeshResult<Peer> {
        loop {
            let slot = self
                .slots
                .entry(peer_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone();
            let mut guard = slot.lock().await;

            // Evicted between lookup and lock
            if !self.is_current(peer_id, &slot) {
                continue;
            }

            let next = match guard.as_ref() {
                Some(existing) => {
                    let mut updated = existing.clone();
                    updated.name = name.to_string();
                    if group_id.is_some() {
                        updated.group_id = group_id.clone();
                    }
                    updated.last_seen = updated.last_seen.max(now);
                    updated
                }
                None => {
                    debug!(peer_id = %peer_id, name = %name, "Discovered new peer");
                    Peer::discovered(peer_id, name, group_id.clone(), now)
                }
            };

            if let Err(e) = self.store.put_peer(&next).await {
                if guard.is_none() {
                    self.discard(peer_id, &slot);
                }
                return Err(e.into());
            }
            self.commit(&mut guard, next.clone());
            return Ok(next);
        }
    }

    /// Move a peer to a new connection state
    ///
    /// Transitions to the current state are accepted without change.
    pub async fn transition(&self, peer_id: &str, to: ConnectionStatus) -> MeshResult<Peer> {
        let slot = self.slot(peer_id)?;
        let mut guard = slot.lock().await;
        let current = guard
            .as_ref()
            .ok_or_else(|| MeshError::DeviceNotFound(peer_id.to_string()))?;
        let from = current.status;

        if from == to {
            return Ok(current.clone());
        }

        if !is_valid_transition(from, to) {
            warn!(
                peer_id = %peer_id,
                from = %from,
                to = %to,
                "Rejected invalid peer transition"
            );
            return Err(MeshError::InvalidTransition {
                peer_id: peer_id.to_string(),
                from,
                to,
            });
        }

        let mut next = current.clone();
        next.status = to;
        self.store.put_peer(&next).await?;

        debug!(peer_id = %peer_id, from = %from, to = %to, "Peer transitioned");
        self.commit(&mut guard, next.clone());
        Ok(next)
    }

    /// Advance `last_seen` for a known peer
    ///
    /// Returns `false` if the peer is unknown.
    pub async fn touch(&self, peer_id: &str, now: DateTime<Utc>) -> MeshResult<bool> {
        let Ok(slot) = self.slot(peer_id) else {
            return Ok(false);
        };
        let mut guard = slot.lock().await;
        let Some(current) = guard.as_ref() else {
            return Ok(false);
        };

        if now <= current.last_seen {
            return Ok(true);
        }

        let mut next = current.clone();
        next.last_seen = now;
        self.store.put_peer(&next).await?;
        self.commit(&mut guard, next);
        Ok(true)
    }

    pub fn get(&self, peer_id: &str) -> Option<Peer> {
        self.view.get(peer_id).map(|peer| peer.value().clone())
    }

    /// Every known peer, most recently seen first
    pub fn all(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.view.iter().map(|peer| peer.value().clone()).collect();
        peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        peers
    }

    pub fn connected_peers(&self) -> Vec<Peer> {
        self.view
            .iter()
            .filter(|peer| peer.is_connected())
            .map(|peer| peer.value().clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.view.iter().filter(|peer| peer.is_connected()).count()
    }

    /// Forget peers not seen for longer than `threshold`
    ///
    /// Connected peers are kept regardless of age.
    pub async fn evict_stale(&self, threshold: Duration, now: DateTime<Utc>) -> MeshResult<usize> {
        let cutoff = now - threshold;
        let mut removed = 0;

        for (peer_id, slot) in self.entries() {
            let mut guard = slot.lock().await;
            let stale = match guard.as_ref() {
                Some(peer) => !peer.is_connected() && peer.last_seen < cutoff,
                None => false,
            };
            if !stale {
                continue;
            }

            self.store.delete_peer(&peer_id).await?;
            *guard = None;
            self.view.remove(&peer_id);
            self.discard(&peer_id, &slot);
            removed += 1;
        }

        if removed > 0 {
            info!(removed = removed, cutoff = %cutoff, "Evicted stale peers");
        }
        Ok(removed)
    }

    /// Publish a stored state; the caller holds the peer's slot
    fn commit(&self, guard: &mut Option<Peer>, peer: Peer) {
        self.view.insert(peer.device_id.clone(), peer.clone());
        *guard = Some(peer);
    }

    /// Drop `slot` from the map unless it has already been replaced
    fn discard(&self, peer_id: &str, slot: &PeerSlot) {
        self.slots
            .remove_if(peer_id, |_, current| Arc::ptr_eq(current, slot));
    }

    fn slot(&self, peer_id: &str) -> MeshResult<PeerSlot> {
        self.slots
            .get(peer_id)
            .map(|slot| slot.value().clone())
            .ok_or_else(|| MeshError::DeviceNotFound(peer_id.to_string()))
    }

    fn entries(&self) -> Vec<(PeerId, PeerSlot)> {
        self.slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn is_current(&self, peer_id: &str, slot: &PeerSlot) -> bool {
        self.slots
            .get(peer_id)
            .map_or(false, |current| Arc::ptr_eq(current.value(), slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use database::MemoryStore;
    use shared::ConnectionStatus::*;

    fn registry() -> (PeerRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (PeerRegistry::new(store.clone()), store)
    }

    #[test]
    fn test_transition_table() {
        assert!(is_valid_transition(Discovered, Connecting));
        assert!(is_valid_transition(Connecting, Connected));
        assert!(is_valid_transition(Connected, Disconnected));
        assert!(is_valid_transition(Discovered, Disconnected));
        assert!(is_valid_transition(Connecting, Disconnected));
        assert!(is_valid_transition(Disconnected, Discovered));
        assert!(is_valid_transition(Disconnected, Connecting));

        assert!(!is_valid_transition(Discovered, Connected));
        assert!(!is_valid_transition(Connected, Connecting));
        assert!(!is_valid_transition(Connected, Discovered));
        assert!(!is_valid_transition(Disconnected, Connected));
    }

    #[tokio::test]
    async fn test_observe_creates_discovered_peer() {
        let (registry, store) = registry();
        let now = Utc::now();

        let peer = registry.observe("b", "Bob", None, now).await.unwrap();

        assert_eq!(peer.status, Discovered);
        assert_eq!(peer.last_seen, now);
        assert_eq!(store.get_peer("b").await.unwrap().unwrap(), peer);
    }

    #[tokio::test]
    async fn test_observe_updates_name_and_keeps_last_seen_monotonic() {
        let (registry, _) = registry();
        let now = Utc::now();
        registry
            .observe("b", "Bob", Some("team-1".to_string()), now)
            .await
            .unwrap();

        let peer = registry
            .observe("b", "Robert", None, now - Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(peer.name, "Robert");
        assert_eq!(peer.group_id.as_deref(), Some("team-1"));
        assert_eq!(peer.last_seen, now);
    }

    #[tokio::test]
    async fn test_full_connection_lifecycle() {
        let (registry, store) = registry();
        registry.observe("b", "Bob", None, Utc::now()).await.unwrap();

        registry.transition("b", Connecting).await.unwrap();
        registry.transition("b", Connected).await.unwrap();
        assert_eq!(registry.connected_count(), 1);

        registry.transition("b", Disconnected).await.unwrap();
        registry.transition("b", Discovered).await.unwrap();

        assert_eq!(store.get_peer("b").await.unwrap().unwrap().status, Discovered);
        assert!(registry.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_state_unchanged() {
        let (registry, store) = registry();
        registry.observe("b", "Bob", None, Utc::now()).await.unwrap();

        let result = registry.transition("b", Connected).await;

        assert!(matches!(
            result,
            Err(MeshError::InvalidTransition { from: Discovered, to: Connected, .. })
        ));
        assert_eq!(registry.get("b").unwrap().status, Discovered);
        assert_eq!(store.get_peer("b").await.unwrap().unwrap().status, Discovered);
    }

    #[tokio::test]
    async fn test_same_state_transition_is_accepted() {
        let (registry, _) = registry();
        registry.observe("b", "Bob", None, Utc::now()).await.unwrap();

        let peer = registry.transition("b", Discovered).await.unwrap();
        assert_eq!(peer.status, Discovered);
    }

    #[tokio::test]
    async fn test_unknown_peer_transition_fails() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.transition("ghost", Connecting).await,
            Err(MeshError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_touch_only_known_peers() {
        let (registry, _) = registry();
        let now = Utc::now();
        registry.observe("b", "Bob", None, now).await.unwrap();

        assert!(registry.touch("b", now + Duration::seconds(30)).await.unwrap());
        assert!(!registry.touch("ghost", now).await.unwrap());
        assert_eq!(
            registry.get("b").unwrap().last_seen,
            now + Duration::seconds(30)
        );
    }

    #[tokio::test]
    async fn test_failed_store_write_keeps_previous_state() {
        let (registry, store) = registry();
        registry.observe("b", "Bob", None, Utc::now()).await.unwrap();
        store.set_unavailable(true);

        assert!(registry.transition("b", Connecting).await.is_err());
        assert_eq!(registry.get("b").unwrap().status, Discovered);
    }

    #[tokio::test]
    async fn test_failed_first_write_leaves_no_slot_behind() {
        let (registry, store) = registry();
        store.set_unavailable(true);

        for i in 0..10 {
            let peer_id = format!("p{}", i);
            assert!(registry.observe(&peer_id, "P", None, Utc::now()).await.is_err());
        }

        assert!(registry.slots.is_empty());
        assert!(registry.all().is_empty());

        store.set_unavailable(false);
        registry.observe("p0", "P", None, Utc::now()).await.unwrap();
        assert_eq!(registry.slots.len(), 1);
        assert_eq!(registry.get("p0").unwrap().status, Discovered);
    }

    #[tokio::test]
    async fn test_readers_do_not_wait_on_a_busy_peer() {
        let (registry, _) = registry();
        for peer in ["b", "c"] {
            registry.observe(peer, peer, None, Utc::now()).await.unwrap();
            registry.transition(peer, Connecting).await.unwrap();
            registry.transition(peer, Connected).await.unwrap();
        }

        // Stands in for a slow store write on "b"
        let slot = registry.slot("b").unwrap();
        let _busy = slot.lock().await;

        let mut connected: Vec<PeerId> = registry
            .connected_peers()
            .into_iter()
            .map(|peer| peer.device_id)
            .collect();
        connected.sort();

        assert_eq!(connected, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(registry.get("b").unwrap().status, Connected);
        assert_eq!(registry.all().len(), 2);
    }

    #[tokio::test]
    async fn test_evict_stale_keeps_connected_and_recent_peers() {
        let (registry, store) = registry();
        let now = Utc::now();
        let long_ago = now - Duration::days(10);
        registry.observe("old", "Old", None, long_ago).await.unwrap();
        registry.observe("linked", "Linked", None, long_ago).await.unwrap();
        registry.transition("linked", Connecting).await.unwrap();
        registry.transition("linked", Connected).await.unwrap();
        registry.observe("recent", "Recent", None, now).await.unwrap();

        let removed = registry.evict_stale(Duration::days(7), now).await.unwrap();

        assert_eq!(removed, 1);
        assert!(registry.get("old").is_none());
        assert!(store.get_peer("old").await.unwrap().is_none());
        assert!(registry.get("linked").is_some());
        assert!(registry.get("recent").is_some());

        // An evicted peer can be rediscovered
        let again = registry.observe("old", "Old", None, now).await.unwrap();
        assert_eq!(again.status, Discovered);
    }

    #[tokio::test]
    async fn test_load_restores_peers_as_disconnected() {
        let store = Arc::new(MemoryStore::new());
        {
            let registry = PeerRegistry::new(store.clone());
            registry.observe("b", "Bob", None, Utc::now()).await.unwrap();
            registry.transition("b", Connecting).await.unwrap();
            registry.transition("b", Connected).await.unwrap();
        }

        let restarted = PeerRegistry::new(store);
        assert_eq!(restarted.load().await.unwrap(), 1);
        assert_eq!(restarted.get("b").unwrap().status, Disconnected);
    }
}
