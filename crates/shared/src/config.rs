use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Shortest retention window a node accepts
pub const MIN_RETENTION_DAYS: u32 = 1;

/// Longest retention window a node accepts
pub const MAX_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub relay: RelayConfig,
    pub retention: RetentionConfig,
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Identifier this node announces to its peers
    pub device_id: String,
    pub nickname: String,
    pub group_id: Option<String>,
    pub listen_addr: String,
    /// Addresses dialed on every scan tick while not connected
    pub seed_peers: Vec<String>,
    pub scan_frequency: ScanFrequency,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// TTL stamped on locally originated messages (default: 5)
    pub max_ttl: u8,
    /// Longest accepted message content in bytes (default: 1024)
    pub max_content_len: usize,
    /// Rebroadcast messages received from peers (default: true)
    pub relay_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Age after which messages and seen ids are swept (1-30, default: 7)
    pub retention_days: u32,
    pub auto_delete_enabled: bool,
    /// Interval between sweeps in seconds (default: 3600)
    pub sweep_interval_secs: u64,
    /// Last-seen age after which a peer is forgotten (default: retention window)
    pub peer_staleness_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Discovery scan cadence tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanFrequency {
    /// Battery saver
    Low,
    Normal,
    /// Faster discovery
    High,
}

impl ScanFrequency {
    pub fn interval(&self) -> Duration {
        match self {
            ScanFrequency::Low => Duration::from_millis(10_000),
            ScanFrequency::Normal => Duration::from_millis(5_000),
            ScanFrequency::High => Duration::from_millis(2_000),
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ScanFrequency::Low => "Low (Battery Saver)",
            ScanFrequency::Normal => "Normal",
            ScanFrequency::High => "High (Faster Discovery)",
        }
    }
}

impl Default for ScanFrequency {
    fn default() -> Self {
        ScanFrequency::Normal
    }
}

impl FromStr for ScanFrequency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(ScanFrequency::Low),
            "normal" => Ok(ScanFrequency::Normal),
            "high" => Ok(ScanFrequency::High),
            other => Err(Error::Config(format!("unknown scan frequency: {}", other))),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_ttl: 5,
            max_content_len: 1024,
            relay_enabled: true,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            auto_delete_enabled: true,
            sweep_interval_secs: 3600,
            peer_staleness_secs: 7 * 24 * 3600,
        }
    }
}

impl RetentionConfig {
    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn peer_staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.peer_staleness_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl NodeConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_id: Uuid::new_v4().to_string(),
            nickname: "Unknown".to_string(),
            group_id: None,
            listen_addr: "0.0.0.0:7878".to_string(),
            seed_peers: Vec::new(),
            scan_frequency: ScanFrequency::Normal,
            shutdown_timeout_secs: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let retention_days: u32 = get("RETENTION_DAYS")
            .unwrap_or_else(|| "7".to_string())
            .parse()?;

        let config = Config {
            node: NodeConfig {
                device_id: get("NODE_DEVICE_ID").unwrap_or_else(|| Uuid::new_v4().to_string()),
                nickname: get("NODE_NICKNAME").unwrap_or_else(|| "Unknown".to_string()),
                group_id: get("NODE_GROUP_ID").filter(|g| !g.trim().is_empty()),
                listen_addr: get("NODE_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:7878".to_string()),
                seed_peers: get("NODE_SEED_PEERS")
                    .map(|peers| {
                        peers
                            .split(',')
                            .map(str::trim)
                            .filter(|p| !p.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                scan_frequency: get("MESH_SCAN_FREQUENCY")
                    .unwrap_or_else(|| "normal".to_string())
                    .parse()?,
                shutdown_timeout_secs: get("SHUTDOWN_TIMEOUT_SECS")
                    .unwrap_or_else(|| "5".to_string())
                    .parse()?,
            },
            relay: RelayConfig {
                max_ttl: get("MESH_MAX_TTL")
                    .unwrap_or_else(|| "5".to_string())
                    .parse()?,
                max_content_len: get("MESH_MAX_CONTENT_LEN")
                    .unwrap_or_else(|| "1024".to_string())
                    .parse()?,
                relay_enabled: get("MESH_RELAY_ENABLED")
                    .unwrap_or_else(|| "true".to_string())
                    .parse()?,
            },
            retention: RetentionConfig {
                retention_days,
                auto_delete_enabled: get("RETENTION_AUTO_DELETE")
                    .unwrap_or_else(|| "true".to_string())
                    .parse()?,
                sweep_interval_secs: get("RETENTION_SWEEP_INTERVAL_SECS")
                    .unwrap_or_else(|| "3600".to_string())
                    .parse()?,
                peer_staleness_secs: match get("RETENTION_PEER_STALENESS_SECS") {
                    Some(secs) => secs.parse()?,
                    None => u64::from(retention_days) * 24 * 3600,
                },
            },
            database: match get("DATABASE_URL") {
                Some(url) => Some(DatabaseConfig {
                    url,
                    max_connections: get("DATABASE_MAX_CONNECTIONS")
                        .unwrap_or_else(|| "10".to_string())
                        .parse()?,
                }),
                None => None,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values outside the ranges the relay supports
    pub fn validate(&self) -> Result<()> {
        let days = self.retention.retention_days;
        if !(MIN_RETENTION_DAYS..=MAX_RETENTION_DAYS).contains(&days) {
            return Err(Error::Config(format!(
                "retention window must be {}-{} days, got {}",
                MIN_RETENTION_DAYS, MAX_RETENTION_DAYS, days
            )));
        }
        if self.relay.max_content_len == 0 {
            return Err(Error::Config("max content length must be positive".to_string()));
        }
        if self.retention.sweep_interval_secs == 0 {
            return Err(Error::Config("sweep interval must be positive".to_string()));
        }
        if self.node.device_id.trim().is_empty() {
            return Err(Error::Config("device id must not be empty".to_string()));
        }
        Ok(())
    }
}
