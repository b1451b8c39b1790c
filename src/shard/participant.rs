//! Per-shard resource lock manager and commit-protocol participant

use super::message::{MessagePhase, PrepareFailure, PrepareVote, ShardMessage, ShardReply};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::{Hash, ShardId, TransactionId};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Finished transactions are remembered this many lock durations, so late
/// duplicates still get an idempotent or stale answer
const FINISHED_RETENTION_FACTOR: u32 = 10;

/// Lock on a single resource key
#[derive(Debug, Clone)]
pub struct ResourceLock {
    pub resource_key: String,
    pub transaction_id: TransactionId,
    pub acquired_at: Instant,
}

/// Committed value of a resource: the payload hash of the last transaction applied to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceVersion {
    pub payload_hash: Hash,
    pub transaction_id: TransactionId,
}

/// Local view of a transaction on this shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalPhase {
    Prepared,
    Committed,
    Aborted,
    /// Locks released unilaterally after the max lock duration
    Expired,
}

#[derive(Debug, Clone)]
struct LocalTransaction {
    phase: LocalPhase,
    resource_keys: Vec<String>,
    payload_hash: Hash,
    prepared_at: Instant,
    /// Set once the transaction reaches a terminal phase
    finished_at: Option<Instant>,
}

impl LocalTransaction {
    fn finish(&mut self, phase: LocalPhase) {
        self.phase = phase;
        self.finished_at = Some(Instant::now());
    }
}

/// Shard participant owning its own lock table
pub struct ShardParticipant {
    shard_id: ShardId,
    /// Maximum time a lock may be held without a decision
    max_lock_duration: Duration,
    /// Active locks: resource key -> lock
    locks: DashMap<String, ResourceLock>,
    /// Transactions seen by this shard
    transactions: DashMap<TransactionId, LocalTransaction>,
    /// Applied effects: resource key -> version
    resources: DashMap<String, ResourceVersion>,
}

impl ShardParticipant {
    /// Create a new participant
    pub fn new(shard_id: ShardId, max_lock_duration: Duration) -> Self {
        Self {
            shard_id,
            max_lock_duration,
            locks: DashMap::new(),
            transactions: DashMap::new(),
            resources: DashMap::new(),
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Dispatch a coordinator message
    pub fn handle(&self, msg: ShardMessage) -> CoordinatorResult<ShardReply> {
        if msg.shard_id != self.shard_id {
            return Err(CoordinatorError::Internal(format!(
                "message for shard {} delivered to shard {}",
                msg.shard_id, self.shard_id
            )));
        }

        match msg.phase {
            MessagePhase::Prepare => Ok(ShardReply::Vote(self.prepare(
                msg.transaction_id,
                &msg.resource_keys,
                msg.payload_hash,
            ))),
            MessagePhase::Commit => self.commit(msg.transaction_id).map(|_| ShardReply::Ack),
            MessagePhase::Abort => self.abort(msg.transaction_id).map(|_| ShardReply::Ack),
        }
    }

    /// Lock every resource key for `tx_id`, or none of them
    pub fn prepare(
        &self,
        tx_id: TransactionId,
        resource_keys: &[String],
        payload_hash: Hash,
    ) -> PrepareVote {
        self.expire_stale_locks();

        if let Some(existing) = self.transactions.get(&tx_id) {
            return match existing.phase {
                LocalPhase::Prepared | LocalPhase::Committed => {
                    debug!("Duplicate prepare for {} on shard {}", tx_id, self.shard_id);
                    PrepareVote::Ok
                }
                LocalPhase::Aborted | LocalPhase::Expired => {
                    PrepareVote::Fail(PrepareFailure::AlreadyAborted)
                }
            };
        }

        let now = Instant::now();
        let mut acquired: Vec<String> = Vec::with_capacity(resource_keys.len());

        for key in resource_keys {
            match self.locks.entry(key.clone()) {
                Entry::Occupied(entry) => {
                    let holder = entry.get().transaction_id;
                    if holder == tx_id {
                        continue;
                    }
                    drop(entry);

                    self.release_locks(tx_id, &acquired);
                    debug!(
                        "Prepare {} on shard {} conflicts on {} (held by {})",
                        tx_id, self.shard_id, key, holder
                    );
                    return PrepareVote::Fail(PrepareFailure::LockConflict {
                        resource: key.clone(),
                        holder,
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(ResourceLock {
                        resource_key: key.clone(),
                        transaction_id: tx_id,
                        acquired_at: now,
                    });
                    acquired.push(key.clone());
                }
            }
        }

        match self.transactions.entry(tx_id) {
            Entry::Occupied(entry) => {
                // A concurrent duplicate prepare or an early abort got here first
                let phase = entry.get().phase;
                drop(entry);
                match phase {
                    LocalPhase::Prepared | LocalPhase::Committed => PrepareVote::Ok,
                    LocalPhase::Aborted | LocalPhase::Expired => {
                        self.release_locks(tx_id, resource_keys);
                        PrepareVote::Fail(PrepareFailure::AlreadyAborted)
                    }
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(LocalTransaction {
                    phase: LocalPhase::Prepared,
                    resource_keys: resource_keys.to_vec(),
                    payload_hash,
                    prepared_at: now,
                    finished_at: None,
                });
                debug!(
                    "Prepared {} on shard {} ({} locks)",
                    tx_id,
                    self.shard_id,
                    resource_keys.len()
                );
                PrepareVote::Ok
            }
        }
    }

    /// Apply the staged effect and release locks
    pub fn commit(&self, tx_id: TransactionId) -> CoordinatorResult<()> {
        let mut entry = self.transactions.get_mut(&tx_id).ok_or_else(|| {
            CoordinatorError::TransactionNotFound {
                tx_id: tx_id.to_string(),
            }
        })?;

        match entry.phase {
            LocalPhase::Committed => {
                debug!("Duplicate commit for {} on shard {}", tx_id, self.shard_id);
                return Ok(());
            }
            LocalPhase::Aborted | LocalPhase::Expired => {
                warn!(
                    "Discarding late commit for {} on shard {} ({:?})",
                    tx_id, self.shard_id, entry.phase
                );
                crate::metrics::record_stale_decision(self.shard_id);
                return Err(self.stale(tx_id));
            }
            LocalPhase::Prepared => {}
        }

        if entry.prepared_at.elapsed() > self.max_lock_duration {
            self.release_locks(tx_id, &entry.resource_keys);
            entry.finish(LocalPhase::Expired);
            warn!(
                "Commit for {} arrived after lock expiry on shard {}",
                tx_id, self.shard_id
            );
            crate::metrics::record_lock_expired(self.shard_id);
            crate::metrics::record_stale_decision(self.shard_id);
            return Err(self.stale(tx_id));
        }

        for key in &entry.resource_keys {
            self.resources.insert(
                key.clone(),
                ResourceVersion {
                    payload_hash: entry.payload_hash,
                    transaction_id: tx_id,
                },
            );
        }
        self.release_locks(tx_id, &entry.resource_keys);
        entry.finish(LocalPhase::Committed);

        info!("Committed {} on shard {}", tx_id, self.shard_id);
        Ok(())
    }

    /// Discard the staged effect and release locks
    pub fn abort(&self, tx_id: TransactionId) -> CoordinatorResult<()> {
        match self.transactions.entry(tx_id) {
            Entry::Vacant(slot) => {
                // Tombstone so a prepare arriving after the abort is refused
                let now = Instant::now();
                slot.insert(LocalTransaction {
                    phase: LocalPhase::Aborted,
                    resource_keys: Vec::new(),
                    payload_hash: [0u8; 32],
                    prepared_at: now,
                    finished_at: Some(now),
                });
                debug!("Abort for unseen {} on shard {}", tx_id, self.shard_id);
                Ok(())
            }
            Entry::Occupied(mut entry) => match entry.get().phase {
                LocalPhase::Aborted | LocalPhase::Expired => Ok(()),
                LocalPhase::Committed => Err(CoordinatorError::InvalidStateTransition {
                    from: "committed".to_string(),
                    to: "aborted".to_string(),
                }),
                LocalPhase::Prepared => {
                    self.release_locks(tx_id, &entry.get().resource_keys);
                    entry.get_mut().finish(LocalPhase::Aborted);
                    info!("Aborted {} on shard {}", tx_id, self.shard_id);
                    Ok(())
                }
            },
        }
    }

    /// Release locks held past the max duration and mark their transactions expired
    pub fn expire_stale_locks(&self) -> Vec<TransactionId> {
        let candidates: Vec<TransactionId> = self
            .transactions
            .iter()
            .filter(|t| t.phase == LocalPhase::Prepared && self.is_expired(t.prepared_at))
            .map(|t| *t.key())
            .collect();

        let mut expired = Vec::new();
        for tx_id in candidates {
            if let Some(mut entry) = self.transactions.get_mut(&tx_id) {
                if entry.phase != LocalPhase::Prepared || !self.is_expired(entry.prepared_at) {
                    continue;
                }
                self.release_locks(tx_id, &entry.resource_keys);
                entry.finish(LocalPhase::Expired);
                warn!(
                    "Lock expiry on shard {}: released {} locks of {}",
                    self.shard_id,
                    entry.resource_keys.len(),
                    tx_id
                );
                crate::metrics::record_lock_expired(self.shard_id);
                expired.push(tx_id);
            }
        }
        expired
    }

    /// Forget finished transactions older than the retention period
    pub fn prune_finished(&self) -> usize {
        let retention = self.max_lock_duration * FINISHED_RETENTION_FACTOR;
        let before = self.transactions.len();
        self.transactions
            .retain(|_, t| t.finished_at.map_or(true, |done| done.elapsed() <= retention));
        let pruned = before.saturating_sub(self.transactions.len());
        if pruned > 0 {
            debug!("Shard {} pruned {} finished transactions", self.shard_id, pruned);
        }
        pruned
    }

    pub fn tracked_transactions(&self) -> usize {
        self.transactions.len()
    }

    /// Transaction currently holding `resource_key`
    pub fn lock_holder(&self, resource_key: &str) -> Option<TransactionId> {
        self.locks.get(resource_key).map(|l| l.transaction_id)
    }

    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    /// Committed version of a resource
    pub fn resource(&self, resource_key: &str) -> Option<ResourceVersion> {
        self.resources.get(resource_key).map(|v| *v)
    }

    pub fn local_phase(&self, tx_id: &TransactionId) -> Option<LocalPhase> {
        self.transactions.get(tx_id).map(|t| t.phase)
    }

    fn is_expired(&self, prepared_at: Instant) -> bool {
        prepared_at.elapsed() > self.max_lock_duration
    }

    fn release_locks(&self, tx_id: TransactionId, keys: &[String]) {
        for key in keys {
            self.locks.remove_if(key, |_, lock| lock.transaction_id == tx_id);
        }
    }

    fn stale(&self, tx_id: TransactionId) -> CoordinatorError {
        CoordinatorError::StaleDecision {
            shard_id: self.shard_id,
            tx_id: tx_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    const MAX_LOCK: Duration = Duration::from_secs(30);

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_prepare_and_commit_applies_effect() {
        let shard = ShardParticipant::new(1, MAX_LOCK);
        let tx = Uuid::new_v4();

        assert_eq!(shard.prepare(tx, &keys(&["a", "b"]), [7; 32]), PrepareVote::Ok);
        assert_eq!(shard.lock_holder("a"), Some(tx));
        assert!(shard.resource("a").is_none());

        shard.commit(tx).unwrap();
        assert_eq!(shard.active_locks(), 0);
        assert_eq!(shard.resource("b").map(|v| v.payload_hash), Some([7; 32]));

        // idempotent
        shard.commit(tx).unwrap();
        assert_eq!(shard.local_phase(&tx), Some(LocalPhase::Committed));
    }

    #[tokio::test]
    async fn test_conflict_rolls_back_partial_acquire() {
        let shard = ShardParticipant::new(1, MAX_LOCK);
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();

        assert_eq!(shard.prepare(t1, &keys(&["b"]), [1; 32]), PrepareVote::Ok);

        let vote = shard.prepare(t2, &keys(&["a", "b", "c"]), [2; 32]);
        assert_eq!(
            vote,
            PrepareVote::Fail(PrepareFailure::LockConflict {
                resource: "b".to_string(),
                holder: t1
            })
        );
        assert_eq!(shard.lock_holder("a"), None);
        assert_eq!(shard.lock_holder("c"), None);
        assert_eq!(shard.lock_holder("b"), Some(t1));
        assert_eq!(shard.local_phase(&t2), None);
    }

    #[tokio::test]
    async fn test_duplicate_prepare_is_idempotent() {
        let shard = ShardParticipant::new(1, MAX_LOCK);
        let tx = Uuid::new_v4();
        assert_eq!(shard.prepare(tx, &keys(&["a"]), [1; 32]), PrepareVote::Ok);
        assert_eq!(shard.prepare(tx, &keys(&["a"]), [1; 32]), PrepareVote::Ok);
        assert_eq!(shard.active_locks(), 1);
    }

    #[tokio::test]
    async fn test_abort_releases_and_is_idempotent() {
        let shard = ShardParticipant::new(1, MAX_LOCK);
        let tx = Uuid::new_v4();
        shard.prepare(tx, &keys(&["a"]), [1; 32]);

        shard.abort(tx).unwrap();
        shard.abort(tx).unwrap();
        assert_eq!(shard.active_locks(), 0);
        assert!(shard.resource("a").is_none());
        assert!(matches!(
            shard.commit(tx),
            Err(CoordinatorError::StaleDecision { .. })
        ));
    }

    #[tokio::test]
    async fn test_abort_before_prepare_refuses_late_prepare() {
        let shard = ShardParticipant::new(1, MAX_LOCK);
        let tx = Uuid::new_v4();
        shard.abort(tx).unwrap();
        assert_eq!(
            shard.prepare(tx, &keys(&["a"]), [1; 32]),
            PrepareVote::Fail(PrepareFailure::AlreadyAborted)
        );
        assert_eq!(shard.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_commit_unknown_transaction() {
        let shard = ShardParticipant::new(1, MAX_LOCK);
        assert!(matches!(
            shard.commit(Uuid::new_v4()),
            Err(CoordinatorError::TransactionNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expiry_then_late_commit_is_stale() {
        let shard = ShardParticipant::new(1, Duration::from_secs(10));
        let t1 = Uuid::new_v4();
        shard.prepare(t1, &keys(&["r"]), [1; 32]);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(shard.expire_stale_locks().is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(shard.expire_stale_locks(), vec![t1]);
        assert_eq!(shard.lock_holder("r"), None);
        assert_eq!(shard.local_phase(&t1), Some(LocalPhase::Expired));

        let err = shard.commit(t1).unwrap_err();
        assert!(matches!(err, CoordinatorError::StaleDecision { shard_id: 1, .. }));
        assert!(shard.resource("r").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_transactions_are_pruned_after_retention() {
        let shard = ShardParticipant::new(1, Duration::from_secs(10));
        let committed = Uuid::new_v4();
        let tombstone = Uuid::new_v4();
        let pending = Uuid::new_v4();

        shard.prepare(committed, &keys(&["a"]), [1; 32]);
        shard.commit(committed).unwrap();
        shard.abort(tombstone).unwrap();
        tokio::time::advance(Duration::from_secs(95)).await;
        shard.prepare(pending, &keys(&["b"]), [2; 32]);

        // still inside the retention period: duplicates get their usual answers
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(shard.prune_finished(), 0);
        shard.commit(committed).unwrap();
        assert_eq!(
            shard.prepare(tombstone, &keys(&["a"]), [1; 32]),
            PrepareVote::Fail(PrepareFailure::AlreadyAborted)
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(shard.prune_finished(), 2);
        assert_eq!(shard.tracked_transactions(), 1);
        assert_eq!(shard.local_phase(&pending), Some(LocalPhase::Prepared));
        assert_eq!(shard.local_phase(&committed), None);
        // applied effects outlive the bookkeeping
        assert_eq!(shard.resource("a").map(|v| v.transaction_id), Some(committed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_past_deadline_without_sweep_is_stale() {
        let shard = ShardParticipant::new(1, Duration::from_secs(10));
        let t1 = Uuid::new_v4();
        shard.prepare(t1, &keys(&["r"]), [1; 32]);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(matches!(
            shard.commit(t1),
            Err(CoordinatorError::StaleDecision { .. })
        ));
        assert_eq!(shard.active_locks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_does_not_block_new_prepare() {
        let shard = ShardParticipant::new(1, Duration::from_secs(10));
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        shard.prepare(t1, &keys(&["r"]), [1; 32]);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(shard.prepare(t2, &keys(&["r"]), [2; 32]), PrepareVote::Ok);
        assert_eq!(shard.lock_holder("r"), Some(t2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_prepares_never_both_succeed() {
        let shard = Arc::new(ShardParticipant::new(1, MAX_LOCK));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let shard = shard.clone();
            handles.push(tokio::spawn(async move {
                shard.prepare(Uuid::new_v4(), &keys(&["hot", "cold"]), [3; 32])
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() == PrepareVote::Ok {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(shard.active_locks(), 2);
    }

    #[tokio::test]
    async fn test_handle_rejects_misrouted_message() {
        let shard = ShardParticipant::new(1, MAX_LOCK);
        let msg = ShardMessage {
            transaction_id: Uuid::new_v4(),
            shard_id: 2,
            phase: MessagePhase::Prepare,
            resource_keys: keys(&["a"]),
            payload_hash: [0; 32],
        };
        assert!(shard.handle(msg).is_err());
    }
}
