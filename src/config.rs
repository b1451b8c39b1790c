//! Configuration management for the Tesseract Coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub coordinator: CoordinatorConfig,
    pub channels: ChannelsConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub shards: HashMap<String, ShardConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    pub instance_id: String,
    /// Deadline for collecting every prepare vote
    pub prepare_deadline_ms: u64,
    /// Attempts per shard when prepare fails on a lock conflict
    pub max_prepare_attempts: u32,
    pub prepare_retry_delay_ms: u64,
    /// Commit/abort delivery budget before a transaction is flagged partially applied
    pub max_notify_retries: u32,
    pub notify_retry_delay_ms: u64,
    pub maintenance_interval_ms: u64,
}

impl CoordinatorConfig {
    pub fn prepare_deadline(&self) -> Duration {
        Duration::from_millis(self.prepare_deadline_ms)
    }

    pub fn prepare_retry_delay(&self) -> Duration {
        Duration::from_millis(self.prepare_retry_delay_ms)
    }

    pub fn notify_retry_delay(&self) -> Duration {
        Duration::from_millis(self.notify_retry_delay_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            instance_id: "coordinator-0".to_string(),
            prepare_deadline_ms: 5_000,
            max_prepare_attempts: 3,
            prepare_retry_delay_ms: 100,
            max_notify_retries: 5,
            notify_retry_delay_ms: 200,
            maintenance_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    pub challenge_window_secs: u64,
    /// Development keyring: participant identity -> shared secret
    #[serde(default)]
    pub keys: HashMap<String, String>,
}

impl ChannelsConfig {
    pub fn challenge_window(&self) -> Duration {
        Duration::from_secs(self.challenge_window_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL, or `memory` for the in-process store
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url == "memory"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShardConfig {
    pub shard_id: u64,
    pub validators: Vec<String>,
    #[serde(default)]
    pub consensus_params: HashMap<String, serde_json::Value>,
    /// Locks held longer than this without a decision are released unilaterally
    pub lock_max_duration_ms: u64,
    pub enabled: bool,
}

impl ShardConfig {
    pub fn lock_max_duration(&self) -> Duration {
        Duration::from_millis(self.lock_max_duration_ms)
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("TESSERACT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_shards().is_empty() {
            anyhow::bail!("At least one shard must be enabled");
        }

        let mut seen = HashSet::new();
        for (name, shard) in &self.shards {
            if !seen.insert(shard.shard_id) {
                anyhow::bail!("Shard {} reuses shard id {}", name, shard.shard_id);
            }
            if shard.enabled {
                if shard.lock_max_duration_ms == 0 {
                    anyhow::bail!("Shard {} has a zero lock max duration", name);
                }
                if shard.validators.is_empty() {
                    tracing::warn!("Shard {} has an empty validator set", name);
                }
            }
        }

        let c = &self.coordinator;
        if c.prepare_deadline_ms == 0 {
            anyhow::bail!("coordinator.prepare_deadline_ms must be positive");
        }
        if c.max_prepare_attempts == 0 {
            anyhow::bail!("coordinator.max_prepare_attempts must be positive");
        }
        if c.max_notify_retries == 0 {
            anyhow::bail!("coordinator.max_notify_retries must be positive");
        }
        if c.maintenance_interval_ms == 0 {
            anyhow::bail!("coordinator.maintenance_interval_ms must be positive");
        }
        if self.channels.challenge_window_secs == 0 {
            anyhow::bail!("channels.challenge_window_secs must be positive");
        }

        Ok(())
    }

    /// Get list of enabled shards
    pub fn enabled_shards(&self) -> Vec<(&String, &ShardConfig)> {
        self.shards.iter().filter(|(_, s)| s.enabled).collect()
    }

    /// Get shard config by shard ID
    pub fn get_shard_by_id(&self, shard_id: u64) -> Option<&ShardConfig> {
        self.shards.values().find(|s| s.shard_id == shard_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
