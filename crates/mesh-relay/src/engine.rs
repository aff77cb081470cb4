//! Relay decision: deduplicate, persist, decrement TTL, fan out

use crate::dedup::DedupLedger;
use crate::error::{MeshError, MeshResult};
use crate::peers::PeerRegistry;
use crate::stats::{RelayStats, RelayStatsSnapshot};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use database::DurableStore;
use futures::future::join_all;
use shared::config::RelayConfig;
use shared::{Message, MessageId, PeerId, SeenMessageId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Result of ingesting one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Already accepted earlier; nothing stored or sent
    Duplicate,

    /// Stored but not rebroadcast
    AcceptedTerminal,

    /// Stored and rebroadcast with a decremented TTL
    AcceptedForward {
        outbound: Message,
        sent_to: Vec<PeerId>,
        failed: Vec<PeerId>,
    },
}

impl RelayOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, RelayOutcome::Duplicate)
    }
}

/// Notifications for observers of the relay
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Accepted {
        message: Message,
        from_peer: Option<PeerId>,
        forwarded_to: Vec<PeerId>,
    },
    Duplicate {
        message_id: MessageId,
        from_peer: Option<PeerId>,
    },
}

/// Store-and-forward relay for one node
pub struct RelayEngine {
    device_id: PeerId,
    config: RelayConfig,
    relay_enabled: AtomicBool,
    ledger: DedupLedger,
    registry: PeerRegistry,
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<RelayEvent>,
    stats: RelayStats,
}

impl RelayEngine {
    pub fn new(
        device_id: impl Into<PeerId>,
        config: RelayConfig,
        store: Arc<dyn DurableStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let device_id = device_id.into();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            device_id = %device_id,
            max_ttl = config.max_ttl,
            relay_enabled = config.relay_enabled,
            "RelayEngine initialized"
        );

        Self {
            relay_enabled: AtomicBool::new(config.relay_enabled),
            ledger: DedupLedger::new(store.clone()),
            registry: PeerRegistry::new(store.clone()),
            device_id,
            config,
            store,
            transport,
            events,
            stats: RelayStats::new(),
        }
    }

    /// Reload the dedup ledger and peer registry from the store
    pub async fn restore(&self) -> MeshResult<()> {
        self.ledger.load().await?;
        self.registry.load().await?;
        Ok(())
    }

    /// Handle a message that was received from `from_peer`, or created
    /// locally when `from_peer` is `None`
    ///
    /// A message is accepted at most once. Acceptance persists the message
    /// and its seen record in one store transaction; if that fails the
    /// message stays unseen so a later copy can still be accepted.
    pub async fn ingest(
        &self,
        message: Message,
        from_peer: Option<&str>,
        now: DateTime<Utc>,
    ) -> MeshResult<RelayOutcome> {
        self.validate(&message)?;

        let Some(claim) = self.ledger.claim(&message.id, now) else {
            debug!(
                message_id = %message.id,
                from_peer = ?from_peer,
                "Dropping duplicate message"
            );
            self.stats.record_duplicate();
            self.publish(RelayEvent::Duplicate {
                message_id: message.id.clone(),
                from_peer: from_peer.map(str::to_string),
            });
            return Ok(RelayOutcome::Duplicate);
        };

        let seen = SeenMessageId::new(claim.id(), now);
        if let Err(e) = self.store.accept_message(&message, &seen).await {
            error!(
                message_id = %message.id,
                error = %e,
                "Failed to persist message; leaving it unseen"
            );
            self.stats.record_store_failure();
            return Err(e.into());
        }
        claim.commit();
        self.stats.record_accepted();

        if let Some(peer_id) = from_peer {
            if let Err(e) = self.registry.touch(peer_id, now).await {
                warn!(peer_id = %peer_id, error = %e, "Failed to refresh peer last_seen");
            }
        }

        let outcome = match message.next_hop() {
            None => {
                debug!(message_id = %message.id, "TTL exhausted; not relaying");
                RelayOutcome::AcceptedTerminal
            }
            Some(_) if from_peer.is_some() && !self.relay_enabled() => {
                debug!(message_id = %message.id, "Relaying disabled; not relaying");
                RelayOutcome::AcceptedTerminal
            }
            Some(outbound) => {
                let (sent_to, failed) = self.fan_out(&outbound, from_peer).await;
                RelayOutcome::AcceptedForward {
                    outbound,
                    sent_to,
                    failed,
                }
            }
        };

        let forwarded_to = match &outcome {
            RelayOutcome::AcceptedForward { sent_to, .. } => sent_to.clone(),
            _ => {
                self.stats.record_terminal();
                Vec::new()
            }
        };

        info!(
            message_id = %message.id,
            sender_id = %message.sender_id,
            from_peer = ?from_peer,
            ttl = message.ttl,
            forwarded = forwarded_to.len(),
            "Accepted message"
        );

        self.publish(RelayEvent::Accepted {
            message,
            from_peer: from_peer.map(str::to_string),
            forwarded_to,
        });

        Ok(outcome)
    }

    /// Create a message on this node and push it into the mesh
    pub async fn originate(
        &self,
        content: impl Into<String>,
        sender_name: impl Into<String>,
        group_id: Option<String>,
        now: DateTime<Utc>,
    ) -> MeshResult<Message> {
        let message = Message::new_local(
            self.device_id.clone(),
            sender_name,
            content,
            group_id,
            self.config.max_ttl,
            now,
        );

        self.ingest(message.clone(), None, now).await?;
        Ok(message)
    }

    /// Send `outbound` to every connected peer except the one it came from
    ///
    /// Individual send failures are logged and do not stop the fan-out.
    async fn fan_out(
        &self,
        outbound: &Message,
        from_peer: Option<&str>,
    ) -> (Vec<PeerId>, Vec<PeerId>) {
        let targets: Vec<PeerId> = self
            .registry
            .connected_peers()
            .into_iter()
            .map(|peer| peer.device_id)
            .filter(|id| Some(id.as_str()) != from_peer && *id != self.device_id)
            .collect();

        if targets.is_empty() {
            debug!(message_id = %outbound.id, "No peers available for forwarding");
            return (Vec::new(), Vec::new());
        }

        let results = join_all(targets.into_iter().map(|peer_id| async move {
            let result = self.transport.send(&peer_id, outbound).await;
            (peer_id, result)
        }))
        .await;

        let mut sent_to = Vec::new();
        let mut failed = Vec::new();
        for (peer_id, result) in results {
            match result {
                Ok(()) => sent_to.push(peer_id),
                Err(e) => {
                    warn!(
                        message_id = %outbound.id,
                        peer_id = %peer_id,
                        error = %e,
                        "Failed to forward message to peer"
                    );
                    self.stats.record_send_failure();
                    failed.push(peer_id);
                }
            }
        }

        self.stats.record_forwarded(sent_to.len() as u64);
        debug!(
            message_id = %outbound.id,
            ttl = outbound.ttl,
            sent = sent_to.len(),
            failed = failed.len(),
            "Forwarded message"
        );
        (sent_to, failed)
    }

    fn validate(&self, message: &Message) -> MeshResult<()> {
        if message.id.is_empty() {
            return Err(MeshError::InvalidMessage("missing message id".to_string()));
        }
        if message.content.len() > self.config.max_content_len {
            return Err(MeshError::InvalidMessage(format!(
                "content is {} bytes, limit is {}",
                message.content.len(),
                self.config.max_content_len
            )));
        }
        Ok(())
    }

    fn publish(&self, event: RelayEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn relay_enabled(&self) -> bool {
        self.relay_enabled.load(Ordering::SeqCst)
    }

    /// Turn rebroadcasting of received messages on or off
    pub fn set_relay_enabled(&self, enabled: bool) {
        let previous = self.relay_enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(relay_enabled = enabled, "Relay mode changed");
        }
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.ledger
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stored messages, newest first, optionally limited to one group
    pub async fn messages(&self, group_id: Option<&str>) -> MeshResult<Vec<Message>> {
        Ok(self.store.list_messages(group_id).await?)
    }

    pub async fn message_count(&self) -> MeshResult<u64> {
        Ok(self.store.count_messages().await?)
    }
}
