//! Periodic removal of expired messages, seen ids and stale peers

use crate::engine::RelayEngine;
use crate::error::MeshResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::config::RetentionConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// What one sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub messages_removed: u64,
    pub seen_removed: u64,
    pub peers_removed: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.messages_removed + self.seen_removed + self.peers_removed
    }
}

pub struct RetentionPolicy {
    engine: Arc<RelayEngine>,
    config: RetentionConfig,
    auto_delete: AtomicBool,
}

impl RetentionPolicy {
    pub fn new(engine: Arc<RelayEngine>, config: RetentionConfig) -> Self {
        Self {
            auto_delete: AtomicBool::new(config.auto_delete_enabled),
            engine,
            config,
        }
    }

    pub fn auto_delete_enabled(&self) -> bool {
        self.auto_delete.load(Ordering::SeqCst)
    }

    pub fn set_auto_delete(&self, enabled: bool) {
        self.auto_delete.store(enabled, Ordering::SeqCst);
        info!(auto_delete = enabled, "Retention auto-delete changed");
    }

    /// Remove everything older than the retention window as of `now`
    ///
    /// A message and its seen id go together, once both its timestamp and
    /// its first sighting are older than the window. Messages are removed
    /// first, and a seen id stays while its message is stored, so a stored
    /// message always keeps the record that suppresses its duplicates. Does
    /// nothing while auto-delete is off.
    pub async fn sweep(&self, now: DateTime<Utc>) -> MeshResult<SweepReport> {
        if !self.auto_delete_enabled() {
            debug!("Auto-delete disabled; skipping retention sweep");
            return Ok(SweepReport::default());
        }

        let cutoff = now - self.config.retention_window();
        let store = self.engine.store();

        let messages_removed = store.delete_messages_before(cutoff).await?;
        let seen_removed = self.engine.ledger().evict_older_than(cutoff).await? as u64;
        let peers_removed = self
            .engine
            .registry()
            .evict_stale(self.config.peer_staleness(), now)
            .await? as u64;

        let report = SweepReport {
            messages_removed,
            seen_removed,
            peers_removed,
        };

        if report.total() > 0 {
            info!(
                messages = messages_removed,
                seen_ids = seen_removed,
                peers = peers_removed,
                cutoff = %cutoff,
                "Retention sweep removed expired records"
            );
        } else {
            debug!(cutoff = %cutoff, "Retention sweep found nothing to remove");
        }

        Ok(report)
    }

    /// Sweep on every `sweep_interval` tick until cancelled
    ///
    /// The first sweep runs immediately. A failed sweep is logged and retried
    /// on the next tick.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.sweep_interval());
            info!(
                retention_days = self.config.retention_days,
                interval_secs = self.config.sweep_interval_secs,
                "Retention worker started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Retention worker received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep(Utc::now()).await {
                            error!(error = %e, "Retention sweep failed");
                        }
                    }
                }
            }
        })
    }
}
