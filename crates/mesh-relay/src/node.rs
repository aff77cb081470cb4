//! Event loop connecting a transport to the relay engine

use crate::engine::{RelayEngine, RelayOutcome};
use crate::error::MeshResult;
use crate::frame;
use crate::transport::TransportEvent;
use chrono::Utc;
use shared::{ConnectionStatus, PeerId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Frames buffered per peer before new ones are dropped
const PEER_QUEUE: usize = 1024;

/// Drives one relay node
///
/// Frames from the same peer are ingested in arrival order by a dedicated
/// worker; frames from different peers are ingested concurrently.
pub struct RelayNode {
    engine: Arc<RelayEngine>,
    shutdown_timeout: Duration,
}

impl RelayNode {
    pub fn new(engine: Arc<RelayEngine>, shutdown_timeout: Duration) -> Self {
        Self {
            engine,
            shutdown_timeout,
        }
    }

    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    /// Process transport events until `cancel` fires or the transport
    /// closes its event stream, then shut down
    ///
    /// On shutdown no new frames are taken. Queued frames get up to the
    /// shutdown timeout to finish before their workers are aborted, and the
    /// store is closed last.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) -> MeshResult<()> {
        let mut queues: HashMap<PeerId, mpsc::Sender<Vec<u8>>> = HashMap::new();
        let mut workers = JoinSet::new();

        info!(device_id = %self.engine.device_id(), "Relay node running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Relay node received shutdown signal");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, &mut queues, &mut workers).await,
                    None => {
                        info!("Transport event stream closed");
                        break;
                    }
                },
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Peer worker panicked");
                    }
                }
            }
        }

        // Closing the queues lets each worker finish what it already holds
        queues.clear();
        drop(events);

        let pending = workers.len();
        let drained = timeout(self.shutdown_timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => info!(workers = pending, "Peer workers drained"),
            Err(_) => {
                warn!(
                    remaining = workers.len(),
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "Shutdown timeout elapsed; aborting peer workers"
                );
                workers.abort_all();
                while workers.join_next().await.is_some() {}
            }
        }

        self.engine.store().close().await;
        info!("Relay node stopped");
        Ok(())
    }

    async fn handle_event(
        &self,
        event: TransportEvent,
        queues: &mut HashMap<PeerId, mpsc::Sender<Vec<u8>>>,
        workers: &mut JoinSet<()>,
    ) {
        match event {
            TransportEvent::PeerDiscovered { peer_id, name } => {
                if let Err(e) = self
                    .engine
                    .registry()
                    .observe(&peer_id, &name, None, Utc::now())
                    .await
                {
                    warn!(peer_id = %peer_id, error = %e, "Failed to record discovered peer");
                }
            }
            TransportEvent::PeerConnected {
                peer_id,
                name,
                group_id,
            } => {
                if let Err(e) = self.mark_connected(&peer_id, &name, group_id).await {
                    warn!(peer_id = %peer_id, error = %e, "Failed to record connected peer");
                }
                self.ensure_worker(&peer_id, queues, workers);
            }
            TransportEvent::PeerDisconnected { peer_id } => {
                if let Err(e) = self
                    .engine
                    .registry()
                    .transition(&peer_id, ConnectionStatus::Disconnected)
                    .await
                {
                    warn!(peer_id = %peer_id, error = %e, "Failed to record disconnected peer");
                }
                // Dropping the sender lets the worker drain and exit
                queues.remove(&peer_id);
            }
            TransportEvent::FrameReceived { peer_id, bytes } => {
                let queue = self.ensure_worker(&peer_id, queues, workers);
                if let Err(e) = queue.try_send(bytes) {
                    warn!(peer_id = %peer_id, error = %e, "Peer queue unavailable; dropping frame");
                }
            }
        }
    }

    /// Walk the peer through the lifecycle up to connected
    async fn mark_connected(
        &self,
        peer_id: &str,
        name: &str,
        group_id: Option<String>,
    ) -> MeshResult<()> {
        let registry = self.engine.registry();
        let peer = registry.observe(peer_id, name, group_id, Utc::now()).await?;

        match peer.status {
            ConnectionStatus::Connected => {}
            ConnectionStatus::Connecting => {
                registry
                    .transition(peer_id, ConnectionStatus::Connected)
                    .await?;
            }
            ConnectionStatus::Discovered | ConnectionStatus::Disconnected => {
                registry
                    .transition(peer_id, ConnectionStatus::Connecting)
                    .await?;
                registry
                    .transition(peer_id, ConnectionStatus::Connected)
                    .await?;
            }
        }
        Ok(())
    }

    fn ensure_worker(
        &self,
        peer_id: &str,
        queues: &mut HashMap<PeerId, mpsc::Sender<Vec<u8>>>,
        workers: &mut JoinSet<()>,
    ) -> mpsc::Sender<Vec<u8>> {
        if let Some(queue) = queues.get(peer_id) {
            if !queue.is_closed() {
                return queue.clone();
            }
        }

        let (tx, rx) = mpsc::channel(PEER_QUEUE);
        workers.spawn(peer_worker(self.engine.clone(), peer_id.to_string(), rx));
        queues.insert(peer_id.to_string(), tx.clone());
        debug!(peer_id = %peer_id, "Started peer worker");
        tx
    }
}

async fn peer_worker(engine: Arc<RelayEngine>, peer_id: PeerId, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = frames.recv().await {
        let message = match frame::decode(&bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "Dropping undecodable frame");
                continue;
            }
        };

        match engine.ingest(message, Some(peer_id.as_str()), Utc::now()).await {
            Ok(RelayOutcome::Duplicate) => {}
            Ok(outcome) => debug!(peer_id = %peer_id, outcome = ?outcome, "Ingested frame"),
            Err(e) => warn!(peer_id = %peer_id, error = %e, "Failed to ingest frame"),
        }
    }
    debug!(peer_id = %peer_id, "Peer worker stopped");
}
