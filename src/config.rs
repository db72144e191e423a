use std::path::PathBuf;
use std::time::Duration;

use tracing::trace;

use crate::points::{NewPoint, ProtocolType};
use crate::storage::schema::NewDevice;

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./plant.db")
}

/// Point poller settings
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Scheduler tick period
    pub tick_ms: u64,

    /// Reads in flight at once within one tick (1 = strictly sequential)
    pub max_concurrent_reads: usize,

    pub modbus_port: u16,
    pub modbus_timeout_ms: u64,
    pub bacnet_port: u16,
    pub bacnet_timeout_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            max_concurrent_reads: 4,
            modbus_port: 502,
            modbus_timeout_ms: 2000,
            bacnet_port: 47808,
            bacnet_timeout_ms: 6000,
        }
    }
}

impl PollerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn modbus_timeout(&self) -> Duration {
        Duration::from_millis(self.modbus_timeout_ms)
    }

    pub fn bacnet_timeout(&self) -> Duration {
        Duration::from_millis(self.bacnet_timeout_ms)
    }
}

/// Reachability sweep settings
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ReachabilityConfig {
    pub interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub max_concurrent_probes: usize,

    /// Link capacity used as 100% for the bandwidth indicator
    pub max_bandwidth_bytes_per_sec: u64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            interval_secs: 900,
            probe_timeout_ms: 2000,
            max_concurrent_probes: 16,
            // 100 Mbit/s
            max_bandwidth_bytes_per_sec: 12_500_000,
        }
    }
}

impl ReachabilityConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    /// Storage configuration (defaults to SQLite at `./plant.db`)
    pub storage: Option<StorageConfig>,

    #[serde(default)]
    pub poller: PollerConfig,

    #[serde(default)]
    pub reachability: ReachabilityConfig,

    /// Catalogue entries upserted at startup
    #[serde(default)]
    pub protocol_types: Vec<ProtocolType>,

    /// Points registered at startup unless one with the same name exists
    #[serde(default)]
    pub points: Vec<NewPoint>,

    /// Reachability inventory seed
    #[serde(default)]
    pub devices: Vec<NewDevice>,

    pub log_level: Option<String>,
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    parse_config(&file_content)
}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    serde_json::from_str(content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
