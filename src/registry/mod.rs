//! Shard registry
//!
//! Read-mostly directory of shard identity, validator set, consensus
//! parameters and status. Mutations come from governance actions, which are
//! serialized outside this process; shards are deactivated, never removed.

use crate::config::Settings;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::{Identity, ShardId};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardStatus {
    Active,
    Inactive,
}

/// Registry record for one shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardRecord {
    pub shard_id: ShardId,
    pub validator_set: Vec<Identity>,
    pub consensus_params: HashMap<String, serde_json::Value>,
    pub status: ShardStatus,
}

/// Shard registry
pub struct ShardRegistry {
    shards: DashMap<ShardId, ShardRecord>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self {
            shards: DashMap::new(),
        }
    }

    /// Build the registry from configured shards
    pub fn from_settings(settings: &Settings) -> CoordinatorResult<Self> {
        let registry = Self::new();
        for (name, shard) in &settings.shards {
            registry.register(ShardRecord {
                shard_id: shard.shard_id,
                validator_set: shard.validators.clone(),
                consensus_params: shard.consensus_params.clone(),
                status: if shard.enabled {
                    ShardStatus::Active
                } else {
                    ShardStatus::Inactive
                },
            })?;
            info!("Registered shard {} (ID: {})", name, shard.shard_id);
        }
        Ok(registry)
    }

    /// Register a new shard
    pub fn register(&self, record: ShardRecord) -> CoordinatorResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.shards.entry(record.shard_id) {
            Entry::Occupied(_) => Err(CoordinatorError::Config(format!(
                "shard {} already registered",
                record.shard_id
            ))),
            Entry::Vacant(v) => {
                v.insert(record);
                Ok(())
            }
        }
    }

    /// Deactivate a shard; new transactions may no longer include it
    pub fn deactivate(&self, shard_id: ShardId) -> CoordinatorResult<()> {
        let mut record = self
            .shards
            .get_mut(&shard_id)
            .ok_or(CoordinatorError::ShardNotFound { shard_id })?;
        record.status = ShardStatus::Inactive;
        info!("Shard {} deactivated", shard_id);
        Ok(())
    }

    pub fn get(&self, shard_id: ShardId) -> Option<ShardRecord> {
        self.shards.get(&shard_id).map(|r| r.clone())
    }

    pub fn is_active(&self, shard_id: ShardId) -> bool {
        self.shards
            .get(&shard_id)
            .map(|r| r.status == ShardStatus::Active)
            .unwrap_or(false)
    }

    /// Active shard ids in ascending order
    pub fn active_shards(&self) -> Vec<ShardId> {
        let mut ids: Vec<_> = self
            .shards
            .iter()
            .filter(|r| r.status == ShardStatus::Active)
            .map(|r| r.shard_id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for ShardRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(shard_id: ShardId) -> ShardRecord {
        ShardRecord {
            shard_id,
            validator_set: vec![format!("validator-{}", shard_id)],
            consensus_params: HashMap::new(),
            status: ShardStatus::Active,
        }
    }

    #[test]
    fn test_register_and_deactivate() {
        let registry = ShardRegistry::new();
        registry.register(record(2)).unwrap();
        registry.register(record(1)).unwrap();
        assert_eq!(registry.active_shards(), vec![1, 2]);

        registry.deactivate(2).unwrap();
        assert!(!registry.is_active(2));
        assert_eq!(registry.active_shards(), vec![1]);
        // never deleted
        assert_eq!(registry.get(2).map(|r| r.status), Some(ShardStatus::Inactive));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ShardRegistry::new();
        registry.register(record(1)).unwrap();
        assert!(registry.register(record(1)).is_err());
        assert!(matches!(
            registry.deactivate(9),
            Err(CoordinatorError::ShardNotFound { shard_id: 9 })
        ));
    }
}
