//! Shared helpers: a recording transport and a small in-process mesh

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use database::MemoryStore;
use mesh_relay::{frame, MeshError, MeshResult, RelayEngine, Transport};
use shared::config::RelayConfig;
use shared::{ConnectionStatus, Message, PeerId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: PeerId,
    pub to: PeerId,
    pub message: Message,
}

/// Transport that queues every send instead of putting it on a link
pub struct RecordingTransport {
    node: PeerId,
    outbox: Arc<Mutex<VecDeque<Delivery>>>,
    failing: Mutex<HashSet<PeerId>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingTransport {
    pub fn new(node: &str) -> Self {
        Self::with_outbox(node, Arc::new(Mutex::new(VecDeque::new())))
    }

    pub fn with_outbox(node: &str, outbox: Arc<Mutex<VecDeque<Delivery>>>) -> Self {
        Self {
            node: node.to_string(),
            outbox,
            failing: Mutex::new(HashSet::new()),
            delay: Mutex::new(None),
        }
    }

    pub fn sent(&self) -> Vec<Delivery> {
        self.outbox.lock().unwrap().iter().cloned().collect()
    }

    pub fn fail_for(&self, peer: &str) {
        self.failing.lock().unwrap().insert(peer.to_string());
    }

    /// Make every send take `delay` before it is recorded
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn start_scanning(&self, _interval: Duration) -> MeshResult<()> {
        Ok(())
    }

    async fn send(&self, peer: &PeerId, message: &Message) -> MeshResult<()> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(peer) {
            return Err(MeshError::TransmissionFailed(format!("link to {} down", peer)));
        }
        self.outbox.lock().unwrap().push_back(Delivery {
            from: self.node.clone(),
            to: peer.clone(),
            message: message.clone(),
        });
        Ok(())
    }

    async fn disconnect(&self, _peer: &PeerId) -> MeshResult<()> {
        Ok(())
    }

    async fn connected_devices(&self) -> MeshResult<Vec<PeerId>> {
        Ok(Vec::new())
    }
}

pub fn relay_config(max_ttl: u8) -> RelayConfig {
    RelayConfig {
        max_ttl,
        ..RelayConfig::default()
    }
}

/// Build an engine with its own store and recording transport
pub fn engine(node: &str, config: RelayConfig) -> (Arc<RelayEngine>, Arc<MemoryStore>, Arc<RecordingTransport>) {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new(node));
    let engine = Arc::new(RelayEngine::new(node, config, store.clone(), transport.clone()));
    (engine, store, transport)
}

pub async fn connect(engine: &RelayEngine, peer: &str) {
    let registry = engine.registry();
    registry.observe(peer, peer, None, Utc::now()).await.unwrap();
    registry.transition(peer, ConnectionStatus::Connecting).await.unwrap();
    registry.transition(peer, ConnectionStatus::Connected).await.unwrap();
}

pub fn message(id: &str, sender: &str, ttl: u8) -> Message {
    Message {
        id: id.to_string(),
        sender_id: sender.to_string(),
        sender_name: sender.to_uppercase(),
        content: format!("report from {}", sender),
        timestamp: Utc::now(),
        group_id: None,
        ttl,
        is_local: false,
    }
}

/// Several nodes sharing one outbox; `pump` plays the links
pub struct TestMesh {
    nodes: HashMap<PeerId, Arc<RelayEngine>>,
    stores: HashMap<PeerId, Arc<MemoryStore>>,
    outbox: Arc<Mutex<VecDeque<Delivery>>>,
}

impl TestMesh {
    pub fn new(ids: &[&str], config: RelayConfig) -> Self {
        let outbox = Arc::new(Mutex::new(VecDeque::new()));
        let mut nodes = HashMap::new();
        let mut stores = HashMap::new();

        for id in ids {
            let store = Arc::new(MemoryStore::new());
            let transport = Arc::new(RecordingTransport::with_outbox(id, outbox.clone()));
            let engine = RelayEngine::new(*id, config.clone(), store.clone(), transport);
            nodes.insert(id.to_string(), Arc::new(engine));
            stores.insert(id.to_string(), store);
        }

        Self {
            nodes,
            stores,
            outbox,
        }
    }

    /// Connect two nodes in both directions
    pub async fn link(&self, a: &str, b: &str) {
        connect(self.engine(a), b).await;
        connect(self.engine(b), a).await;
    }

    pub fn engine(&self, id: &str) -> &Arc<RelayEngine> {
        &self.nodes[id]
    }

    pub fn store(&self, id: &str) -> &Arc<MemoryStore> {
        &self.stores[id]
    }

    /// Deliver queued sends through the wire codec until the mesh is quiet
    ///
    /// Returns the number of frames delivered.
    pub async fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.outbox.lock().unwrap().pop_front();
            let Some(delivery) = next else {
                return delivered;
            };

            let bytes = frame::encode(&delivery.message).unwrap();
            let received = frame::decode(&bytes).unwrap();
            self.engine(&delivery.to)
                .ingest(received, Some(delivery.from.as_str()), Utc::now())
                .await
                .unwrap();
            delivered += 1;
            assert!(delivered < 10_000, "mesh did not settle");
        }
    }
}
