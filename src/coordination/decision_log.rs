//! Durable record of commit/abort decisions
//!
//! A decision is written here before any participant is notified, so a
//! restarted coordinator can re-drive notifications that never got through.

use super::transaction::Decision;
use crate::error::CoordinatorResult;
use crate::types::{Hash, ShardId, TransactionId};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Decision written, notifications outstanding
    Pending,
    /// Every participant acknowledged
    Complete,
    /// Retry budget exhausted; needs out-of-band reconciliation
    PartiallyApplied,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Complete => "complete",
            DeliveryStatus::PartiallyApplied => "partially_applied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "complete" => Some(DeliveryStatus::Complete),
            "partially_applied" => Some(DeliveryStatus::PartiallyApplied),
            _ => None,
        }
    }
}

/// Persisted decision with per-shard delivery state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub transaction_id: TransactionId,
    pub decision: Decision,
    pub shards: BTreeMap<ShardId, Vec<String>>,
    #[serde(with = "crate::types::hex_hash")]
    pub payload_hash: Hash,
    pub delivered: BTreeSet<ShardId>,
    pub status: DeliveryStatus,
    pub anchored: bool,
}

impl DecisionRecord {
    pub fn new(
        transaction_id: TransactionId,
        decision: Decision,
        shards: BTreeMap<ShardId, Vec<String>>,
        payload_hash: Hash,
    ) -> Self {
        Self {
            transaction_id,
            decision,
            shards,
            payload_hash,
            delivered: BTreeSet::new(),
            status: DeliveryStatus::Pending,
            anchored: false,
        }
    }

    /// Shards that have not acknowledged the decision yet
    pub fn undelivered(&self) -> Vec<ShardId> {
        self.shards
            .keys()
            .filter(|s| !self.delivered.contains(s))
            .copied()
            .collect()
    }
}

/// Storage for coordinator decisions
#[async_trait]
pub trait DecisionLog: Send + Sync {
    /// Persist a decision. Re-recording the same decision is a no-op; a
    /// conflicting decision for the same transaction is an error.
    async fn record_decision(&self, record: &DecisionRecord) -> CoordinatorResult<()>;

    async fn mark_delivered(&self, tx_id: TransactionId, shard_id: ShardId) -> CoordinatorResult<()>;

    async fn mark_anchored(&self, tx_id: TransactionId) -> CoordinatorResult<()>;

    async fn set_status(&self, tx_id: TransactionId, status: DeliveryStatus) -> CoordinatorResult<()>;

    /// Decisions whose delivery is still pending, or whose outcome was never anchored
    async fn pending_decisions(&self) -> CoordinatorResult<Vec<DecisionRecord>>;

    async fn get_decision(&self, tx_id: TransactionId) -> CoordinatorResult<Option<DecisionRecord>>;
}
