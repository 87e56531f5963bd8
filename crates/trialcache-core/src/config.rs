//! Replica configuration management.
//!
//! This module handles loading and saving the replica configuration: where
//! the local database lives, the timeouts applied to store operations, and
//! the per-table TTL and size budgets.
//!
//! Configuration is stored at `~/.config/trialcache/config.json`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/data directory paths
const APP_NAME: &str = "trialcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Database file name inside the data directory
const DATABASE_FILE: &str = "replica.sqlite3";

/// Clean rows older than this are considered stale unless a table overrides it.
const DEFAULT_TTL_SECS: u64 = 60 * 60;

/// Opening the physical store gets longer than a single row operation,
/// a cold open may run schema upgrades.
const DEFAULT_OPEN_TIMEOUT_MS: u64 = 5_000;

const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 3_000;

/// Pause each table takes before its first transaction on a fresh connection.
const DEFAULT_ADMISSION_STAGGER_MS: u64 = 5;

const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// Rows modified within this window are never evicted.
const DEFAULT_PROTECTION_WINDOW_SECS: u64 = 5 * 60;

const DEFAULT_BATCH_CHUNK_SIZE: usize = 500;

/// Per-table overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TableConfig {
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub size_budget_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    pub database_path: Option<PathBuf>,
    pub open_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub admission_stagger_ms: u64,
    pub debounce_ms: u64,
    pub default_ttl_secs: u64,
    pub protection_window_secs: u64,
    pub batch_chunk_size: usize,
    pub tables: HashMap<String, TableConfig>,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            open_timeout_ms: DEFAULT_OPEN_TIMEOUT_MS,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            admission_stagger_ms: DEFAULT_ADMISSION_STAGGER_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            default_ttl_secs: DEFAULT_TTL_SECS,
            protection_window_secs: DEFAULT_PROTECTION_WINDOW_SECS,
            batch_chunk_size: DEFAULT_BATCH_CHUNK_SIZE,
            tables: HashMap::new(),
        }
    }
}

impl ReplicaConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Location of the physical replica database.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.database_path {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME).join(DATABASE_FILE))
    }

    /// Staleness window for clean rows of `table`.
    pub fn ttl(&self, table: &str) -> Duration {
        let secs = self
            .tables
            .get(table)
            .and_then(|t| t.ttl_secs)
            .unwrap_or(self.default_ttl_secs);
        Duration::from_secs(secs)
    }

    /// Byte budget for `table`, if the table is bounded at all.
    pub fn size_budget(&self, table: &str) -> Option<u64> {
        self.tables.get(table).and_then(|t| t.size_budget_bytes)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn admission_stagger(&self) -> Duration {
        Duration::from_millis(self.admission_stagger_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn protection_window(&self) -> Duration {
        Duration::from_secs(self.protection_window_secs)
    }
}
