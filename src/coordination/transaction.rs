//! Cross-shard transaction record owned by the coordinator

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::{Hash, ShardId, TransactionId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Protocol phase; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionPhase {
    Init,
    Preparing,
    Prepared,
    Committed,
    Aborted,
}

impl TransactionPhase {
    fn rank(self) -> u8 {
        match self {
            TransactionPhase::Init => 0,
            TransactionPhase::Preparing => 1,
            TransactionPhase::Prepared => 2,
            TransactionPhase::Committed | TransactionPhase::Aborted => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionPhase::Committed | TransactionPhase::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionPhase::Init => "init",
            TransactionPhase::Preparing => "preparing",
            TransactionPhase::Prepared => "prepared",
            TransactionPhase::Committed => "committed",
            TransactionPhase::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Commit,
    Abort,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Commit => "commit",
            Decision::Abort => "abort",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "commit" => Some(Decision::Commit),
            "abort" => Some(Decision::Abort),
            _ => None,
        }
    }
}

/// One shard's answer to Prepare
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrepareResponse {
    PrepareOk,
    PrepareFail(String),
    Timeout,
}

/// Why the coordinator decided as it did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionReason {
    AllPrepared,
    PrepareFailed { shard_id: ShardId, detail: String },
    Timeout { shards: Vec<ShardId> },
    Cancelled,
}

/// Cross-shard transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossShardTransaction {
    pub id: TransactionId,
    /// Participant shards (ordered) and the resource keys to lock on each
    pub shards: BTreeMap<ShardId, Vec<String>>,
    #[serde(with = "crate::types::hex_hash")]
    pub payload_hash: Hash,
    pub phase: TransactionPhase,
    pub votes: BTreeMap<ShardId, PrepareResponse>,
    pub reason: Option<DecisionReason>,
    pub cancel_requested: bool,
    /// Shards that never acknowledged the decision
    pub undelivered: BTreeSet<ShardId>,
    pub partially_applied: bool,
    pub created_at: DateTime<Utc>,
}

impl CrossShardTransaction {
    pub fn new(id: TransactionId, shards: BTreeMap<ShardId, Vec<String>>, payload_hash: Hash) -> Self {
        Self {
            id,
            shards,
            payload_hash,
            phase: TransactionPhase::Init,
            votes: BTreeMap::new(),
            reason: None,
            cancel_requested: false,
            undelivered: BTreeSet::new(),
            partially_applied: false,
            created_at: Utc::now(),
        }
    }

    /// Terminal view rebuilt from a persisted decision after restart
    pub fn restored(
        id: TransactionId,
        decision: Decision,
        shards: BTreeMap<ShardId, Vec<String>>,
        payload_hash: Hash,
    ) -> Self {
        let mut txn = Self::new(id, shards, payload_hash);
        txn.phase = match decision {
            Decision::Commit => TransactionPhase::Committed,
            Decision::Abort => TransactionPhase::Aborted,
        };
        txn
    }

    /// Move to a later phase; backward moves and moves out of a terminal phase are rejected
    pub fn advance(&mut self, to: TransactionPhase) -> CoordinatorResult<()> {
        if self.phase.is_terminal() || to.rank() <= self.phase.rank() {
            return Err(CoordinatorError::InvalidStateTransition {
                from: self.phase.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.phase = to;
        Ok(())
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.keys().copied().collect()
    }

    /// Decision implied by the phase, once terminal
    pub fn decision(&self) -> Option<Decision> {
        match self.phase {
            TransactionPhase::Committed => Some(Decision::Commit),
            TransactionPhase::Aborted => Some(Decision::Abort),
            _ => None,
        }
    }

    /// Commit iff every shard voted PrepareOk and nobody asked to cancel
    pub fn decide(&self) -> (Decision, DecisionReason) {
        if self.cancel_requested {
            return (Decision::Abort, DecisionReason::Cancelled);
        }

        let mut timed_out = Vec::new();
        for shard_id in self.shards.keys() {
            match self.votes.get(shard_id) {
                Some(PrepareResponse::PrepareOk) => {}
                Some(PrepareResponse::PrepareFail(detail)) => {
                    return (
                        Decision::Abort,
                        DecisionReason::PrepareFailed {
                            shard_id: *shard_id,
                            detail: detail.clone(),
                        },
                    );
                }
                Some(PrepareResponse::Timeout) | None => timed_out.push(*shard_id),
            }
        }

        if timed_out.is_empty() {
            (Decision::Commit, DecisionReason::AllPrepared)
        } else {
            (Decision::Abort, DecisionReason::Timeout { shards: timed_out })
        }
    }
}

/// Result of running a transaction to completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionOutcome {
    pub transaction_id: TransactionId,
    pub decision: Decision,
    pub reason: Option<DecisionReason>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn txn(shards: &[ShardId]) -> CrossShardTransaction {
        CrossShardTransaction::new(
            Uuid::new_v4(),
            shards.iter().map(|s| (*s, vec![format!("r{}", s)])).collect(),
            [0; 32],
        )
    }

    #[test]
    fn test_phase_is_monotonic() {
        let mut t = txn(&[1]);
        t.advance(TransactionPhase::Preparing).unwrap();
        assert!(t.advance(TransactionPhase::Init).is_err());
        assert!(t.advance(TransactionPhase::Preparing).is_err());
        t.advance(TransactionPhase::Prepared).unwrap();
        t.advance(TransactionPhase::Committed).unwrap();
        assert!(t.advance(TransactionPhase::Aborted).is_err());
        assert_eq!(t.decision(), Some(Decision::Commit));
    }

    #[test]
    fn test_preparing_may_abort_directly() {
        let mut t = txn(&[1]);
        t.advance(TransactionPhase::Preparing).unwrap();
        t.advance(TransactionPhase::Aborted).unwrap();
        assert!(t.phase.is_terminal());
    }

    #[test]
    fn test_decide_requires_every_vote() {
        let mut t = txn(&[1, 2]);
        t.votes.insert(1, PrepareResponse::PrepareOk);
        assert_eq!(
            t.decide(),
            (Decision::Abort, DecisionReason::Timeout { shards: vec![2] })
        );

        t.votes.insert(2, PrepareResponse::PrepareOk);
        assert_eq!(t.decide(), (Decision::Commit, DecisionReason::AllPrepared));

        t.votes.insert(2, PrepareResponse::PrepareFail("busy".to_string()));
        assert!(matches!(
            t.decide(),
            (Decision::Abort, DecisionReason::PrepareFailed { shard_id: 2, .. })
        ));
    }

    #[test]
    fn test_cancel_forces_abort() {
        let mut t = txn(&[1]);
        t.votes.insert(1, PrepareResponse::PrepareOk);
        t.cancel_requested = true;
        assert_eq!(t.decide(), (Decision::Abort, DecisionReason::Cancelled));
    }
}
