//! Two-phase commit coordinator for cross-shard transactions

use super::decision_log::{DecisionLog, DecisionRecord, DeliveryStatus};
use super::transaction::{
    CrossShardTransaction, Decision, DecisionReason, PrepareResponse, TransactionOutcome,
    TransactionPhase,
};
use crate::anchor::{LedgerAnchor, TransactionOutcomeRecord};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{EventBus, ProtocolEvent};
use crate::registry::ShardRegistry;
use crate::shard::{MessagePhase, PrepareFailure, PrepareVote, ShardMessage, ShardReply, ShardTransport};
use crate::types::{keccak256, ShardId, TransactionId};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Cross-shard transaction coordinator
pub struct TransactionCoordinator {
    /// Shard registry for participant validation
    registry: Arc<ShardRegistry>,
    /// Message path to shard participants
    transport: Arc<dyn ShardTransport>,
    /// Durable decision storage
    decision_log: Arc<dyn DecisionLog>,
    /// Settlement surface for outcomes
    anchor: Arc<dyn LedgerAnchor>,
    events: EventBus,
    /// Transactions owned by this coordinator
    transactions: DashMap<TransactionId, Arc<Mutex<CrossShardTransaction>>>,
    /// Configuration
    config: CoordinatorConfig,
}

impl TransactionCoordinator {
    /// Create a new coordinator
    pub fn new(
        registry: Arc<ShardRegistry>,
        transport: Arc<dyn ShardTransport>,
        decision_log: Arc<dyn DecisionLog>,
        anchor: Arc<dyn LedgerAnchor>,
        events: EventBus,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            decision_log,
            anchor,
            events,
            transactions: DashMap::new(),
            config,
        }
    }

    /// Register a new transaction over `participants` (shard -> resource keys)
    pub fn begin(
        &self,
        participants: BTreeMap<ShardId, Vec<String>>,
        payload: &[u8],
    ) -> CoordinatorResult<TransactionId> {
        if participants.is_empty() {
            return Err(CoordinatorError::InvalidParticipants(
                "participant set is empty".to_string(),
            ));
        }

        for shard_id in participants.keys() {
            if !self.registry.is_active(*shard_id) {
                let why = match self.registry.get(*shard_id) {
                    Some(_) => "is inactive",
                    None => "is not registered",
                };
                return Err(CoordinatorError::InvalidParticipants(format!(
                    "shard {} {}",
                    shard_id, why
                )));
            }
        }

        let shards: BTreeMap<ShardId, Vec<String>> = participants
            .into_iter()
            .map(|(shard_id, mut keys)| {
                keys.sort();
                keys.dedup();
                (shard_id, keys)
            })
            .collect();

        let tx_id = Uuid::new_v4();
        let txn = CrossShardTransaction::new(tx_id, shards, keccak256(&[payload]));
        let shard_ids = txn.shard_ids();
        self.transactions.insert(tx_id, Arc::new(Mutex::new(txn)));

        info!("Transaction {} begun across shards {:?}", tx_id, shard_ids);
        crate::metrics::record_transaction_begun();
        self.events
            .publish(ProtocolEvent::TransactionBegun { tx_id, shard_ids });

        Ok(tx_id)
    }

    /// Begin and run a transaction in one call
    pub async fn execute(
        &self,
        participants: BTreeMap<ShardId, Vec<String>>,
        payload: &[u8],
    ) -> CoordinatorResult<TransactionOutcome> {
        let tx_id = self.begin(participants, payload)?;
        self.run(tx_id).await
    }

    /// Drive a transaction through prepare, decision and notification
    pub async fn run(&self, tx_id: TransactionId) -> CoordinatorResult<TransactionOutcome> {
        let handle = self.handle(&tx_id)?;

        let (shards, payload_hash) = {
            let mut txn = handle.lock().await;
            if txn.phase.is_terminal() {
                return Self::finished(&txn);
            }
            if txn.phase != TransactionPhase::Init {
                return Err(CoordinatorError::InvalidStateTransition {
                    from: txn.phase.as_str().to_string(),
                    to: TransactionPhase::Preparing.as_str().to_string(),
                });
            }
            txn.advance(TransactionPhase::Preparing)?;
            (txn.shards.clone(), txn.payload_hash)
        };

        // Phase one: prepare every shard in parallel under one deadline
        let started = Instant::now();
        let deadline = started + self.config.prepare_deadline();
        let mut votes: FuturesUnordered<_> = shards
            .iter()
            .map(|(shard_id, keys)| {
                let msg = ShardMessage {
                    transaction_id: tx_id,
                    shard_id: *shard_id,
                    phase: MessagePhase::Prepare,
                    resource_keys: keys.clone(),
                    payload_hash,
                };
                async move { (msg.shard_id, self.prepare_shard(msg, deadline).await) }
            })
            .collect();

        while let Some((shard_id, response)) = votes.next().await {
            debug!("Prepare vote from shard {} for {}: {:?}", shard_id, tx_id, response);
            handle.lock().await.votes.insert(shard_id, response);
        }
        crate::metrics::record_prepare_latency(started.elapsed().as_secs_f64());

        let (decision, reason) = handle.lock().await.decide();

        // The decision is durable before any participant hears about it
        let record = DecisionRecord::new(tx_id, decision, shards, payload_hash);
        self.decision_log.record_decision(&record).await?;

        {
            let mut txn = handle.lock().await;
            match decision {
                Decision::Commit => {
                    txn.advance(TransactionPhase::Prepared)?;
                    txn.advance(TransactionPhase::Committed)?;
                }
                Decision::Abort => txn.advance(TransactionPhase::Aborted)?,
            }
            txn.reason = Some(reason.clone());
        }

        info!(
            "Transaction {} decided {} ({:?})",
            tx_id,
            decision.as_str(),
            reason
        );
        crate::metrics::record_decision(decision);
        self.events
            .publish(ProtocolEvent::DecisionRecorded { tx_id, decision });

        // Phase two
        self.deliver(record).await
    }

    /// Cancel a transaction before any prepare vote has been recorded
    pub async fn cancel(&self, tx_id: TransactionId) -> CoordinatorResult<()> {
        let handle = self.handle(&tx_id)?;
        let mut txn = handle.lock().await;

        match txn.phase {
            TransactionPhase::Aborted => return Ok(()),
            TransactionPhase::Committed | TransactionPhase::Prepared => {
                return Err(CoordinatorError::CancellationRejected {
                    tx_id: tx_id.to_string(),
                })
            }
            TransactionPhase::Init | TransactionPhase::Preparing => {}
        }

        if !txn.votes.is_empty() {
            return Err(CoordinatorError::CancellationRejected {
                tx_id: tx_id.to_string(),
            });
        }

        txn.cancel_requested = true;

        if txn.phase == TransactionPhase::Preparing {
            // run() owns the protocol from here and will decide abort
            info!("Cancellation requested for {} while preparing", tx_id);
            return Ok(());
        }

        let record = DecisionRecord::new(
            tx_id,
            Decision::Abort,
            txn.shards.clone(),
            txn.payload_hash,
        );
        self.decision_log.record_decision(&record).await?;
        txn.advance(TransactionPhase::Aborted)?;
        txn.reason = Some(DecisionReason::Cancelled);
        drop(txn);

        info!("Transaction {} cancelled before prepare", tx_id);
        crate::metrics::record_decision(Decision::Abort);
        self.events.publish(ProtocolEvent::DecisionRecorded {
            tx_id,
            decision: Decision::Abort,
        });

        self.deliver(record).await.map(|_| ())
    }

    /// Re-drive decisions left undelivered or unanchored by a previous run
    pub async fn recover(&self) -> CoordinatorResult<usize> {
        let pending = self.decision_log.pending_decisions().await?;
        let mut redriven = 0;

        for record in pending {
            self.transactions
                .entry(record.transaction_id)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(CrossShardTransaction::restored(
                        record.transaction_id,
                        record.decision,
                        record.shards.clone(),
                        record.payload_hash,
                    )))
                });

            if record.status != DeliveryStatus::Pending {
                self.anchor_outcome(&record).await;
                continue;
            }

            info!(
                "Re-driving {} for {} to shards {:?}",
                record.decision.as_str(),
                record.transaction_id,
                record.undelivered()
            );
            redriven += 1;
            if let Err(e) = self.deliver(record).await {
                if e.should_alert() {
                    error!("Recovery left transaction partially applied: {}", e);
                } else {
                    return Err(e);
                }
            }
        }

        Ok(redriven)
    }

    /// Snapshot of a transaction
    pub async fn get(&self, tx_id: &TransactionId) -> Option<CrossShardTransaction> {
        let handle = self.transactions.get(tx_id).map(|h| h.clone())?;
        let txn = handle.lock().await;
        Some(txn.clone())
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Drop transactions older than `max_age_secs`
    ///
    /// Terminal transactions go once fully delivered. Undecided ones were
    /// abandoned (never run, or their decision could not be written); their
    /// participants fall back to lock expiry. Partially applied transactions
    /// stay until reconciled.
    pub async fn cleanup(&self, max_age_secs: i64) {
        let now = Utc::now();
        let handles: Vec<_> = self
            .transactions
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        for (tx_id, handle) in handles {
            let txn = handle.lock().await;
            let expired = (now - txn.created_at).num_seconds() > max_age_secs;
            if !expired || txn.partially_applied {
                continue;
            }
            if !txn.phase.is_terminal() {
                warn!(
                    "Dropping undecided transaction {} left in {}",
                    tx_id,
                    txn.phase.as_str()
                );
            }
            drop(txn);
            self.transactions.remove(&tx_id);
        }
    }

    fn handle(&self, tx_id: &TransactionId) -> CoordinatorResult<Arc<Mutex<CrossShardTransaction>>> {
        self.transactions
            .get(tx_id)
            .map(|h| h.clone())
            .ok_or_else(|| CoordinatorError::TransactionNotFound {
                tx_id: tx_id.to_string(),
            })
    }

    fn finished(txn: &CrossShardTransaction) -> CoordinatorResult<TransactionOutcome> {
        if txn.partially_applied {
            return Err(CoordinatorError::PartiallyApplied {
                tx_id: txn.id.to_string(),
                shards: txn.undelivered.iter().copied().collect(),
            });
        }
        let decision = txn.decision().ok_or_else(|| {
            CoordinatorError::Internal(format!("transaction {} has no decision", txn.id))
        })?;
        Ok(TransactionOutcome {
            transaction_id: txn.id,
            decision,
            reason: txn.reason.clone(),
        })
    }

    /// Collect one shard's vote, retrying lock conflicts until the deadline
    async fn prepare_shard(&self, msg: ShardMessage, deadline: Instant) -> PrepareResponse {
        let shard_id = msg.shard_id;
        match timeout_at(deadline, self.prepare_with_retry(msg)).await {
            Ok(response) => response,
            Err(_) => {
                warn!("Prepare timed out on shard {}", shard_id);
                PrepareResponse::Timeout
            }
        }
    }

    async fn prepare_with_retry(&self, msg: ShardMessage) -> PrepareResponse {
        let max_attempts = self.config.max_prepare_attempts.max(1);
        let mut delay = self.config.prepare_retry_delay();

        for attempt in 1..=max_attempts {
            let last = attempt == max_attempts;
            match self.transport.send(msg.clone()).await {
                Ok(ShardReply::Vote(PrepareVote::Ok)) => return PrepareResponse::PrepareOk,
                Ok(ShardReply::Vote(PrepareVote::Fail(PrepareFailure::LockConflict {
                    resource,
                    holder,
                }))) => {
                    let conflict = CoordinatorError::LockConflict {
                        shard_id: msg.shard_id,
                        resource,
                        holder: holder.to_string(),
                    };
                    if last {
                        return PrepareResponse::PrepareFail(conflict.to_string());
                    }
                    debug!("{} (attempt {}/{})", conflict, attempt, max_attempts);
                }
                Ok(ShardReply::Vote(PrepareVote::Fail(failure))) => {
                    return PrepareResponse::PrepareFail(format!("{:?}", failure));
                }
                Ok(ShardReply::Ack) => {
                    return PrepareResponse::PrepareFail("unexpected ack to prepare".to_string());
                }
                Err(e) if e.is_retryable() && !last => {
                    debug!(
                        "Retryable prepare error on shard {}: {} (attempt {}/{})",
                        msg.shard_id, e, attempt, max_attempts
                    );
                }
                Err(e) => return PrepareResponse::PrepareFail(e.to_string()),
            }

            sleep(delay).await;
            delay = delay.saturating_mul(2);
        }

        PrepareResponse::PrepareFail("prepare attempts exhausted".to_string())
    }

    /// Notify every undelivered shard of the decision, then anchor the outcome
    async fn deliver(&self, record: DecisionRecord) -> CoordinatorResult<TransactionOutcome> {
        let tx_id = record.transaction_id;
        let phase = match record.decision {
            Decision::Commit => MessagePhase::Commit,
            Decision::Abort => MessagePhase::Abort,
        };

        let results = join_all(record.undelivered().into_iter().map(|shard_id| {
            let msg = ShardMessage {
                transaction_id: tx_id,
                shard_id,
                phase,
                resource_keys: record.shards.get(&shard_id).cloned().unwrap_or_default(),
                payload_hash: record.payload_hash,
            };
            async move { (shard_id, self.notify_shard(msg).await) }
        }))
        .await;

        let mut undelivered = BTreeSet::new();
        for (shard_id, result) in results {
            match result {
                Ok(()) => self.decision_log.mark_delivered(tx_id, shard_id).await?,
                Err(e) => {
                    warn!(
                        "Could not deliver {} for {} to shard {}: {}",
                        record.decision.as_str(),
                        tx_id,
                        shard_id,
                        e
                    );
                    undelivered.insert(shard_id);
                }
            }
        }

        self.anchor_outcome(&record).await;

        let status = if undelivered.is_empty() {
            DeliveryStatus::Complete
        } else {
            DeliveryStatus::PartiallyApplied
        };
        self.decision_log.set_status(tx_id, status).await?;

        let reason = match self.transactions.get(&tx_id).map(|h| h.clone()) {
            Some(handle) => {
                let mut txn = handle.lock().await;
                txn.undelivered = undelivered.clone();
                txn.partially_applied = !undelivered.is_empty();
                txn.reason.clone()
            }
            None => None,
        };

        if !undelivered.is_empty() {
            let shards: Vec<ShardId> = undelivered.into_iter().collect();
            error!(
                "Transaction {} partially applied; shards {:?} need reconciliation",
                tx_id, shards
            );
            crate::metrics::record_partially_applied();
            self.events.publish(ProtocolEvent::PartiallyApplied {
                tx_id,
                undelivered: shards.clone(),
            });
            return Err(CoordinatorError::PartiallyApplied {
                tx_id: tx_id.to_string(),
                shards,
            });
        }

        info!("Transaction {} completed ({})", tx_id, record.decision.as_str());
        self.events.publish(ProtocolEvent::TransactionCompleted {
            tx_id,
            decision: record.decision,
        });

        Ok(TransactionOutcome {
            transaction_id: tx_id,
            decision: record.decision,
            reason,
        })
    }

    /// Deliver a decision to one shard with bounded exponential backoff
    async fn notify_shard(&self, msg: ShardMessage) -> CoordinatorResult<()> {
        let max_attempts = self.config.max_notify_retries.max(1);
        let mut delay = self.config.notify_retry_delay();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match timeout(self.config.prepare_deadline(), self.transport.send(msg.clone())).await {
                Ok(result) => result,
                Err(_) => Err(CoordinatorError::Timeout {
                    operation: format!("{:?} ack from shard {}", msg.phase, msg.shard_id),
                }),
            };

            let err = match result {
                Ok(ShardReply::Ack) => return Ok(()),
                Ok(ShardReply::Vote(_)) => {
                    CoordinatorError::Internal("vote received for a decision message".to_string())
                }
                // The shard already settled differently; retrying cannot help
                Err(e @ CoordinatorError::StaleDecision { .. })
                | Err(e @ CoordinatorError::InvalidStateTransition { .. }) => return Err(e),
                Err(e) => e,
            };

            if attempt >= max_attempts {
                return Err(err);
            }

            warn!(
                "Delivery to shard {} failed (attempt {}/{}): {}",
                msg.shard_id, attempt, max_attempts, err
            );
            sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }

    /// Write the outcome to the ledger anchor; failures are retried by `recover`
    async fn anchor_outcome(&self, record: &DecisionRecord) {
        if record.anchored {
            return;
        }

        let outcome = TransactionOutcomeRecord {
            transaction_id: record.transaction_id,
            decision: record.decision,
            shard_ids: record.shards.keys().copied().collect(),
        };

        match self.anchor.record_transaction_outcome(&outcome).await {
            Ok(()) | Err(CoordinatorError::AlreadyAnchored { .. }) => {
                if let Err(e) = self.decision_log.mark_anchored(record.transaction_id).await {
                    warn!("Failed to mark {} anchored: {}", record.transaction_id, e);
                }
            }
            Err(e) => warn!(
                "Failed to anchor outcome of {}: {} (will retry on recovery)",
                record.transaction_id, e
            ),
        }
    }
}
