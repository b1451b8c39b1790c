//! In-process store with the same contracts as the SQLite state manager
//!
//! Used when `database.url = "memory"` and by tests that run on a paused clock.

use crate::anchor::{ChannelSettlementRecord, LedgerAnchor, TransactionOutcomeRecord};
use crate::coordination::{DecisionLog, DecisionRecord, DeliveryStatus};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::{channel_hex, ChannelId, ShardId, TransactionId};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Default)]
pub struct MemoryStore {
    decisions: DashMap<TransactionId, DecisionRecord>,
    outcomes: DashMap<TransactionId, TransactionOutcomeRecord>,
    settlements: DashMap<ChannelId, ChannelSettlementRecord>,
    deposits: DashMap<(ChannelId, String), u128>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a deposit confirmed on the settlement layer
    pub fn record_deposit(&self, channel_id: &ChannelId, participant: &str, amount: u128) {
        self.deposits
            .insert((*channel_id, participant.to_string()), amount);
    }

    pub fn outcome(&self, tx_id: &TransactionId) -> Option<TransactionOutcomeRecord> {
        self.outcomes.get(tx_id).map(|r| r.clone())
    }

    pub fn settlement(&self, channel_id: &ChannelId) -> Option<ChannelSettlementRecord> {
        self.settlements.get(channel_id).map(|r| r.clone())
    }

    fn with_decision<F>(&self, tx_id: TransactionId, f: F) -> CoordinatorResult<()>
    where
        F: FnOnce(&mut DecisionRecord),
    {
        let mut record = self
            .decisions
            .get_mut(&tx_id)
            .ok_or_else(|| CoordinatorError::TransactionNotFound {
                tx_id: tx_id.to_string(),
            })?;
        f(&mut record);
        Ok(())
    }
}

#[async_trait]
impl DecisionLog for MemoryStore {
    async fn record_decision(&self, record: &DecisionRecord) -> CoordinatorResult<()> {
        match self.decisions.entry(record.transaction_id) {
            Entry::Occupied(existing) if existing.get().decision != record.decision => {
                Err(CoordinatorError::Internal(format!(
                    "conflicting decision for {}",
                    record.transaction_id
                )))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn mark_delivered(&self, tx_id: TransactionId, shard_id: ShardId) -> CoordinatorResult<()> {
        self.with_decision(tx_id, |r| {
            r.delivered.insert(shard_id);
        })
    }

    async fn mark_anchored(&self, tx_id: TransactionId) -> CoordinatorResult<()> {
        self.with_decision(tx_id, |r| r.anchored = true)
    }

    async fn set_status(&self, tx_id: TransactionId, status: DeliveryStatus) -> CoordinatorResult<()> {
        self.with_decision(tx_id, |r| r.status = status)
    }

    async fn pending_decisions(&self) -> CoordinatorResult<Vec<DecisionRecord>> {
        Ok(self
            .decisions
            .iter()
            .filter(|r| r.status == DeliveryStatus::Pending || !r.anchored)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn get_decision(&self, tx_id: TransactionId) -> CoordinatorResult<Option<DecisionRecord>> {
        Ok(self.decisions.get(&tx_id).map(|r| r.clone()))
    }
}

#[async_trait]
impl LedgerAnchor for MemoryStore {
    async fn record_transaction_outcome(
        &self,
        record: &TransactionOutcomeRecord,
    ) -> CoordinatorResult<()> {
        match self.outcomes.entry(record.transaction_id) {
            Entry::Occupied(_) => Err(CoordinatorError::AlreadyAnchored {
                key: record.transaction_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn record_channel_settlement(
        &self,
        record: &ChannelSettlementRecord,
    ) -> CoordinatorResult<()> {
        match self.settlements.entry(record.channel_id) {
            Entry::Occupied(_) => Err(CoordinatorError::AlreadyAnchored {
                key: channel_hex(&record.channel_id),
            }),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn confirmed_deposit(
        &self,
        channel_id: &ChannelId,
        participant: &str,
    ) -> CoordinatorResult<Option<u128>> {
        Ok(self
            .deposits
            .get(&(*channel_id, participant.to_string()))
            .map(|a| *a))
    }
}
