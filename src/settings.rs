use config::{Config, ConfigError, File};
use ethers::types::Address;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::range_resolver::RescanPolicy;
use crate::types::entity::EntityKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Rpc {
    pub http_url: String,
    #[serde(default = "default_qps_limit")]
    pub qps_limit: u32,
    /// Retries for head lookups; log queries are retried by the batch fetcher instead.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_qps_limit() -> u32 {
    10 // Public endpoints start throttling around here
}
fn default_max_retries() -> usize {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncSettings {
    #[serde(default = "default_recheck_interval_blocks")]
    pub recheck_interval_blocks: u64,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_entity_delay_ms")]
    pub entity_delay_ms: u64,
    #[serde(default = "default_recent_window_blocks")]
    pub recent_window_blocks: u64,
    #[serde(default = "default_progress_path")]
    pub progress_path: String,
}

fn default_recheck_interval_blocks() -> u64 {
    50_000
}
fn default_batch_delay_ms() -> u64 {
    250
}
fn default_entity_delay_ms() -> u64 {
    100
}
fn default_recent_window_blocks() -> u64 {
    200_000
}
fn default_progress_path() -> String {
    "data/progress.json".to_string()
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            recheck_interval_blocks: default_recheck_interval_blocks(),
            batch_delay_ms: default_batch_delay_ms(),
            entity_delay_ms: default_entity_delay_ms(),
            recent_window_blocks: default_recent_window_blocks(),
            progress_path: default_progress_path(),
        }
    }
}

/// Extra label → vendor rule, evaluated before the built-in table.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct VendorAlias {
    pub pattern: String,
    pub canonical: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Registry {
    #[serde(default = "default_oracle_registry_path")]
    pub oracle_registry_path: String,
    #[serde(default = "default_composite_table_path")]
    pub composite_table_path: String,
    /// Vaults that are not deployed by a configured factory but must classify as `Vault`.
    #[serde(default)]
    pub known_vaults: Vec<Address>,
    #[serde(default)]
    pub vendor_aliases: Vec<VendorAlias>,
}

fn default_oracle_registry_path() -> String {
    "data/oracle_registry.json".to_string()
}
fn default_composite_table_path() -> String {
    "data/composite_oracles.json".to_string()
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            oracle_registry_path: default_oracle_registry_path(),
            composite_table_path: default_composite_table_path(),
            known_vaults: Vec::new(),
            vendor_aliases: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RescanMode {
    #[default]
    RecentWindow,
    FromLatestCached,
}

/// A factory whose `ProxyCreated` events define the entity set.
#[derive(Debug, Deserialize, Clone)]
pub struct FactorySource {
    pub name: String,
    pub address: Address,
    pub kind: EntityKind,
    /// Required for a cold start (no checkpoint, empty cache).
    #[serde(default)]
    pub start_block: Option<u64>,
    #[serde(default)]
    pub rescan: RescanMode,
}

impl FactorySource {
    pub fn start_block_setting(&self) -> String {
        format!("factories.{}.start_block", self.name)
    }

    pub fn rescan_policy(&self, recent_window_blocks: u64) -> RescanPolicy {
        match self.rescan {
            RescanMode::RecentWindow => RescanPolicy::RecentWindow(recent_window_blocks),
            RescanMode::FromLatestCached => RescanPolicy::FromLatestCached,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub rpc: Rpc,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub registry: Registry,
    #[serde(default)]
    pub factories: Vec<FactorySource>,
    #[serde(default)]
    pub log: LogSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_path("Config.toml")
    }

    pub fn from_path(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Environment variable overrides, applied after `dotenv` has populated the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("SYNC_RPC_HTTP_URL") {
            let trimmed = url.trim();
            if !trimmed.is_empty() {
                self.rpc.http_url = trimmed.to_string();
            }
        }
        if let Some(interval) = env_u64("SYNC_RECHECK_INTERVAL_BLOCKS") {
            self.sync.recheck_interval_blocks = interval;
        }
        if let Ok(path) = env::var("SYNC_PROGRESS_PATH") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                self.sync.progress_path = trimmed.to_string();
            }
        }
        for factory in &mut self.factories {
            let key = format!("SYNC_START_BLOCK_{}", env_key(&factory.name));
            if let Some(block) = env_u64(&key) {
                factory.start_block = Some(block);
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc.http_url.trim().is_empty() {
            return Err(ConfigError::Message("rpc.http_url must not be empty".to_string()));
        }
        if self.sync.recheck_interval_blocks == 0 {
            return Err(ConfigError::Message(
                "sync.recheck_interval_blocks must be greater than zero".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for factory in &self.factories {
            if !seen.insert(factory.name.as_str()) {
                return Err(ConfigError::Message(format!(
                    "duplicate factory name `{}`",
                    factory.name
                )));
            }
        }
        Ok(())
    }

    pub fn progress_path(&self) -> PathBuf {
        PathBuf::from(&self.sync.progress_path)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}

/// `evault-factory` → `EVAULT_FACTORY`
fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}
