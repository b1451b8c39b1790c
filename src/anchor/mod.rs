//! Ledger anchor: external write-once settlement surface
//!
//! Records transaction outcomes and channel settlements, and answers
//! whether a participant's channel deposit has been confirmed.

use crate::coordination::Decision;
use crate::error::CoordinatorResult;
use crate::types::{ChannelId, Hash, ShardId, TransactionId};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a cross-shard transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutcomeRecord {
    pub transaction_id: TransactionId,
    pub decision: Decision,
    pub shard_ids: Vec<ShardId>,
}

/// Final settlement of a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettlementRecord {
    #[serde(with = "crate::types::hex_hash")]
    pub channel_id: ChannelId,
    pub final_sequence: u64,
    #[serde(with = "crate::types::hex_hash")]
    pub final_state_hash: Hash,
    pub closed_at: DateTime<Utc>,
}

/// Write-once settlement surface
#[async_trait]
pub trait LedgerAnchor: Send + Sync {
    /// Fails with `AlreadyAnchored` if the transaction already has an outcome
    async fn record_transaction_outcome(
        &self,
        record: &TransactionOutcomeRecord,
    ) -> CoordinatorResult<()>;

    /// Fails with `AlreadyAnchored` if the channel is already settled
    async fn record_channel_settlement(
        &self,
        record: &ChannelSettlementRecord,
    ) -> CoordinatorResult<()>;

    /// Confirmed deposit amount for a channel participant, if any
    async fn confirmed_deposit(
        &self,
        channel_id: &ChannelId,
        participant: &str,
    ) -> CoordinatorResult<Option<u128>>;
}
