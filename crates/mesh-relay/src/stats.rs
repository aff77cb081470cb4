//! Counters for relay activity

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters updated by the relay engine
#[derive(Debug, Default)]
pub struct RelayStats {
    accepted: AtomicU64,
    duplicates: AtomicU64,
    forwarded: AtomicU64,
    terminal: AtomicU64,
    send_failures: AtomicU64,
    store_failures: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatsSnapshot {
    pub accepted: u64,
    pub duplicates: u64,
    /// Individual successful sends, one per target peer
    pub forwarded: u64,
    /// Accepted messages that were not rebroadcast
    pub terminal: u64,
    pub send_failures: u64,
    pub store_failures: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forwarded(&self, sends: u64) {
        self.forwarded.fetch_add(sends, Ordering::Relaxed);
    }

    pub(crate) fn record_terminal(&self) {
        self.terminal.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            terminal: self.terminal.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}
