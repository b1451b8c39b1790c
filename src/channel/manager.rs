//! Channel lifecycle and settlement
//!
//! ```text
//! Proposed -> Open -> Active -> Closing -> Closed
//!               |        |  ^     |  ^
//!               +--------+--|-> Disputed
//!                           +-- (settlement write failed, no dispute)
//! ```
//!
//! Each channel owns its ledger and, while disputed, its dispute record.
//! A failed settlement write on a disputed channel goes back to `Disputed`
//! with the record intact, so the next finalization settles the same winner.
//! Closed channels with a recorded settlement are moved to the archive.

use super::dispute::{ChallengeOutcome, DisputeRecord, DisputeResolver, DisputeSubmission, DisputeSummary};
use super::ledger::{verify_quorum, AppendOutcome, ChannelLedger};
use super::signature::SignatureScheme;
use super::update::ChannelUpdate;
use crate::anchor::{ChannelSettlementRecord, LedgerAnchor};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{EventBus, ProtocolEvent};
use crate::types::{channel_hex, ChannelId, Identity};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Proposed,
    Open,
    Active,
    Closing,
    Disputed,
    Closed,
}

impl ChannelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelStatus::Proposed => "proposed",
            ChannelStatus::Open => "open",
            ChannelStatus::Active => "active",
            ChannelStatus::Closing => "closing",
            ChannelStatus::Disputed => "disputed",
            ChannelStatus::Closed => "closed",
        }
    }

    pub fn can_transition_to(self, to: ChannelStatus) -> bool {
        use ChannelStatus::*;
        matches!(
            (self, to),
            (Proposed, Open)
                | (Open, Active)
                | (Open, Closing)
                | (Active, Closing)
                | (Open, Disputed)
                | (Active, Disputed)
                | (Disputed, Closing)
                | (Closing, Closed)
                | (Closing, Active)
                | (Closing, Disputed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettlementPath {
    Cooperative,
    Dispute,
}

impl SettlementPath {
    fn as_str(self) -> &'static str {
        match self {
            SettlementPath::Cooperative => "cooperative",
            SettlementPath::Dispute => "dispute",
        }
    }
}

/// Request to open a channel: participants and the deposit each must have confirmed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelOpenRequest {
    #[serde(with = "crate::types::hex_hash")]
    pub channel_id: ChannelId,
    pub participants: Vec<Identity>,
    pub deposit_confirmations: BTreeMap<Identity, u128>,
}

#[derive(Debug)]
struct Channel {
    id: ChannelId,
    participants: Vec<Identity>,
    deposits: BTreeMap<Identity, u128>,
    status: ChannelStatus,
    ledger: ChannelLedger,
    dispute: Option<DisputeRecord>,
    opened_at: DateTime<Utc>,
}

impl Channel {
    fn transition(&mut self, to: ChannelStatus) -> CoordinatorResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(CoordinatorError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        debug!(
            "Channel {} {} -> {}",
            channel_hex(&self.id),
            self.status.as_str(),
            to.as_str()
        );
        self.status = to;
        Ok(())
    }

    fn require_participant(&self, identity: &str, action: &str) -> CoordinatorResult<()> {
        if self.participants.iter().any(|p| p == identity) {
            Ok(())
        } else {
            Err(CoordinatorError::Unauthorized {
                identity: identity.to_string(),
                action: format!("{} on channel {}", action, channel_hex(&self.id)),
            })
        }
    }

    fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            channel_id: channel_hex(&self.id),
            participants: self.participants.clone(),
            deposits: self.deposits.clone(),
            status: self.status,
            sequence: self.ledger.last_sequence(),
            state_hash: self.ledger.current().map(|u| hex::encode(u.state_hash)),
            dispute: self.dispute.as_ref().map(|d| d.summary()),
            opened_at: self.opened_at,
            settlement: None,
        }
    }
}

/// Read-only view of a channel
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub channel_id: String,
    pub participants: Vec<Identity>,
    pub deposits: BTreeMap<Identity, u128>,
    pub status: ChannelStatus,
    pub sequence: Option<u64>,
    pub state_hash: Option<String>,
    pub dispute: Option<DisputeSummary>,
    pub opened_at: DateTime<Utc>,
    pub settlement: Option<ChannelSettlementRecord>,
}

/// Owns every live channel and drives settlement through the ledger anchor
pub struct ChannelManager {
    channels: DashMap<ChannelId, Arc<Mutex<Channel>>>,
    archive: DashMap<ChannelId, ChannelSnapshot>,
    anchor: Arc<dyn LedgerAnchor>,
    scheme: Arc<dyn SignatureScheme>,
    resolver: DisputeResolver,
    events: EventBus,
}

impl ChannelManager {
    pub fn new(
        anchor: Arc<dyn LedgerAnchor>,
        scheme: Arc<dyn SignatureScheme>,
        resolver: DisputeResolver,
        events: EventBus,
    ) -> Self {
        Self {
            channels: DashMap::new(),
            archive: DashMap::new(),
            anchor,
            scheme,
            resolver,
            events,
        }
    }

    /// Create a `Proposed` channel and try to confirm its deposits right away
    pub async fn open(&self, request: ChannelOpenRequest) -> CoordinatorResult<ChannelStatus> {
        let id = request.channel_id;
        let unique: BTreeSet<&Identity> = request.participants.iter().collect();
        if request.participants.len() < 2 || unique.len() != request.participants.len() {
            return Err(CoordinatorError::InvalidUpdate(
                "a channel needs at least two distinct participants".to_string(),
            ));
        }
        if let Some(p) = request
            .participants
            .iter()
            .find(|p| !request.deposit_confirmations.contains_key(*p))
        {
            return Err(CoordinatorError::InvalidUpdate(format!(
                "no deposit declared for {}",
                p
            )));
        }
        if self.archive.contains_key(&id) {
            return Err(CoordinatorError::ChannelExists {
                channel_id: channel_hex(&id),
            });
        }

        let channel = Channel {
            id,
            ledger: ChannelLedger::new(id, request.participants.clone()),
            participants: request.participants,
            deposits: request.deposit_confirmations,
            status: ChannelStatus::Proposed,
            dispute: None,
            opened_at: Utc::now(),
        };

        match self.channels.entry(id) {
            Entry::Occupied(_) => {
                return Err(CoordinatorError::ChannelExists {
                    channel_id: channel_hex(&id),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(channel)));
            }
        }
        info!("Channel {} proposed", channel_hex(&id));

        match self.confirm_deposits(&id).await {
            Ok(()) => Ok(ChannelStatus::Open),
            Err(CoordinatorError::DepositsUnconfirmed { missing, .. }) => {
                info!(
                    "Channel {} waiting on deposits from {:?}",
                    channel_hex(&id),
                    missing
                );
                Ok(ChannelStatus::Proposed)
            }
            Err(e) => Err(e),
        }
    }

    /// Move a `Proposed` channel to `Open` once every deposit is confirmed
    pub async fn confirm_deposits(&self, channel_id: &ChannelId) -> CoordinatorResult<()> {
        let handle = self.handle(channel_id)?;
        let mut channel = handle.lock().await;

        if channel.status != ChannelStatus::Proposed {
            return if channel.status == ChannelStatus::Open {
                Ok(())
            } else {
                Err(CoordinatorError::InvalidStateTransition {
                    from: channel.status.as_str().to_string(),
                    to: ChannelStatus::Open.as_str().to_string(),
                })
            };
        }

        let mut missing = Vec::new();
        for (participant, required) in &channel.deposits {
            let confirmed = self.anchor.confirmed_deposit(channel_id, participant).await?;
            if confirmed.map_or(true, |amount| amount < *required) {
                missing.push(participant.clone());
            }
        }
        if !missing.is_empty() {
            return Err(CoordinatorError::DepositsUnconfirmed {
                channel_id: channel_hex(channel_id),
                missing,
            });
        }

        channel.transition(ChannelStatus::Open)?;
        info!("Channel {} open", channel_hex(channel_id));
        self.events.publish(ProtocolEvent::ChannelOpened {
            channel_id: *channel_id,
        });
        Ok(())
    }

    /// Offer a signed update to the channel ledger
    ///
    /// Stale sequences are accepted as a no-op and reported as
    /// `AppendOutcome::Stale`, never as an error.
    pub async fn apply_update(&self, update: ChannelUpdate) -> CoordinatorResult<AppendOutcome> {
        let handle = self.handle(&update.channel_id)?;
        let mut channel = handle.lock().await;

        if !matches!(channel.status, ChannelStatus::Open | ChannelStatus::Active) {
            return Err(CoordinatorError::InvalidUpdate(format!(
                "channel {} is {}",
                channel_hex(&channel.id),
                channel.status.as_str()
            )));
        }

        let sequence = update.sequence;
        let outcome = match channel.ledger.append(update, self.scheme.as_ref()) {
            Ok(outcome) => outcome,
            Err(e) => {
                crate::metrics::record_channel_update("rejected");
                warn!("Rejected update on channel {}: {}", channel_hex(&channel.id), e);
                return Err(e);
            }
        };

        match outcome {
            AppendOutcome::Accepted => {
                if channel.status == ChannelStatus::Open {
                    channel.transition(ChannelStatus::Active)?;
                }
                crate::metrics::record_channel_update("accepted");
                self.events.publish(ProtocolEvent::UpdateAccepted {
                    channel_id: channel.id,
                    sequence,
                });
            }
            AppendOutcome::Stale => crate::metrics::record_channel_update("stale"),
        }
        Ok(outcome)
    }

    /// Cooperative close: a fully signed update at or above every known sequence
    pub async fn close(&self, update: ChannelUpdate) -> CoordinatorResult<ChannelSettlementRecord> {
        let handle = self.handle(&update.channel_id)?;
        let mut channel = handle.lock().await;

        if !matches!(
            channel.status,
            ChannelStatus::Open | ChannelStatus::Active | ChannelStatus::Disputed
        ) {
            return Err(CoordinatorError::InvalidStateTransition {
                from: channel.status.as_str().to_string(),
                to: ChannelStatus::Closing.as_str().to_string(),
            });
        }

        verify_quorum(&channel.participants, &update, self.scheme.as_ref())?;

        let known = channel
            .dispute
            .as_ref()
            .map(|d| d.candidate().clone())
            .or_else(|| channel.ledger.current().cloned());
        if let Some(known) = known {
            if update.sequence < known.sequence {
                return Err(CoordinatorError::SequenceStale {
                    last: known.sequence,
                    got: update.sequence,
                });
            }
            if update.sequence == known.sequence && update.state_hash != known.state_hash {
                return Err(CoordinatorError::InvalidUpdate(format!(
                    "sequence {} already holds a different state",
                    known.sequence
                )));
            }
        }

        channel.transition(ChannelStatus::Closing)?;
        self.settle(&mut channel, &update, SettlementPath::Cooperative).await
    }

    /// One participant closes alone; opens a dispute with its update as candidate
    pub async fn close_unilateral(
        &self,
        submitter: &str,
        update: ChannelUpdate,
    ) -> CoordinatorResult<DisputeSummary> {
        let handle = self.handle(&update.channel_id)?;
        let mut channel = handle.lock().await;
        channel.require_participant(submitter, "close")?;

        if !matches!(channel.status, ChannelStatus::Open | ChannelStatus::Active) {
            return Err(CoordinatorError::InvalidStateTransition {
                from: channel.status.as_str().to_string(),
                to: ChannelStatus::Disputed.as_str().to_string(),
            });
        }

        if let Some(current) = channel.ledger.current() {
            if update.sequence < current.sequence {
                debug!(
                    "Unilateral close on {} at {} below accepted {}",
                    channel_hex(&channel.id),
                    update.sequence,
                    current.sequence
                );
                return Err(CoordinatorError::SequenceStale {
                    last: current.sequence,
                    got: update.sequence,
                });
            }
            if update.sequence == current.sequence && update.state_hash != current.state_hash {
                return Err(CoordinatorError::InvalidUpdate(format!(
                    "sequence {} already holds a different state",
                    current.sequence
                )));
            }
        }

        let sequence = update.sequence;
        let record = self.resolver.open(
            &channel.participants,
            DisputeSubmission {
                submitted_by: submitter.to_string(),
                update,
            },
            self.scheme.as_ref(),
        )?;
        channel.transition(ChannelStatus::Disputed)?;
        let summary = record.summary();
        channel.dispute = Some(record);

        crate::metrics::record_dispute_opened();
        self.events.publish(ProtocolEvent::DisputeOpened {
            channel_id: channel.id,
            sequence,
        });
        Ok(summary)
    }

    /// Submit a higher-sequence update against a running dispute
    pub async fn challenge(
        &self,
        submitter: &str,
        update: ChannelUpdate,
    ) -> CoordinatorResult<ChallengeOutcome> {
        let channel_id = update.channel_id;
        let handle = match self.handle(&channel_id) {
            Ok(handle) => handle,
            Err(e) if self.archive.contains_key(&channel_id) => {
                debug!("Challenge on archived channel: {}", e);
                return Err(CoordinatorError::ChallengeWindowClosed {
                    channel_id: channel_hex(&channel_id),
                });
            }
            Err(e) => return Err(e),
        };
        let mut guard = handle.lock().await;
        let channel = &mut *guard;
        channel.require_participant(submitter, "challenge")?;

        let record = match channel.dispute.as_mut() {
            Some(record) => record,
            None if channel.status == ChannelStatus::Closed => {
                return Err(CoordinatorError::ChallengeWindowClosed {
                    channel_id: channel_hex(&channel_id),
                })
            }
            None => {
                return Err(CoordinatorError::InvalidStateTransition {
                    from: channel.status.as_str().to_string(),
                    to: ChannelStatus::Disputed.as_str().to_string(),
                })
            }
        };

        let outcome = self.resolver.submit(
            record,
            &channel.participants,
            DisputeSubmission {
                submitted_by: submitter.to_string(),
                update,
            },
            self.scheme.as_ref(),
        )?;

        info!(
            "Challenge on channel {} accepted at sequence {} (window restarted: {})",
            channel_hex(&channel_id),
            outcome.sequence,
            outcome.window_restarted
        );
        self.events.publish(ProtocolEvent::ChallengeAccepted {
            channel_id,
            sequence: outcome.sequence,
            window_restarted: outcome.window_restarted,
        });
        Ok(outcome)
    }

    /// Settle a dispute whose challenge window has elapsed
    pub async fn finalize_dispute(
        &self,
        channel_id: &ChannelId,
    ) -> CoordinatorResult<ChannelSettlementRecord> {
        let handle = self.handle(channel_id)?;
        let mut guard = handle.lock().await;
        let channel = &mut *guard;

        let winner = match channel.dispute.as_mut() {
            Some(record) => self.resolver.finalize(record)?,
            None => {
                return Err(CoordinatorError::InvalidStateTransition {
                    from: channel.status.as_str().to_string(),
                    to: ChannelStatus::Closing.as_str().to_string(),
                })
            }
        };

        channel.transition(ChannelStatus::Closing)?;
        self.settle(channel, &winner, SettlementPath::Dispute).await
    }

    /// Finalize every dispute whose window has elapsed; returns the settled channels
    pub async fn finalize_expired_disputes(&self) -> Vec<ChannelId> {
        let mut expired = Vec::new();
        for (id, handle) in self.handles() {
            let channel = handle.lock().await;
            if channel.dispute.as_ref().map_or(false, |d| d.is_expired()) {
                expired.push(id);
            }
        }

        let mut settled = Vec::new();
        for id in expired {
            match self.finalize_dispute(&id).await {
                Ok(_) => settled.push(id),
                Err(e) => warn!("Failed to finalize dispute on {}: {}", channel_hex(&id), e),
            }
        }
        settled
    }

    /// Snapshot of a live or archived channel
    pub async fn get(&self, channel_id: &ChannelId) -> CoordinatorResult<ChannelSnapshot> {
        if let Some(archived) = self.archive.get(channel_id) {
            return Ok(archived.clone());
        }
        let handle = self.handle(channel_id)?;
        let channel = handle.lock().await;
        Ok(channel.snapshot())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn archived_count(&self) -> usize {
        self.archive.len()
    }

    /// Write the settlement, then close and archive
    ///
    /// A failed write returns the channel to `Disputed` when a dispute record
    /// exists and to `Active` otherwise.
    async fn settle(
        &self,
        channel: &mut Channel,
        final_update: &ChannelUpdate,
        path: SettlementPath,
    ) -> CoordinatorResult<ChannelSettlementRecord> {
        let record = ChannelSettlementRecord {
            channel_id: channel.id,
            final_sequence: final_update.sequence,
            final_state_hash: final_update.state_hash,
            closed_at: Utc::now(),
        };

        match self.anchor.record_channel_settlement(&record).await {
            Ok(()) => {}
            Err(CoordinatorError::AlreadyAnchored { key }) => {
                debug!("Settlement for {} was already anchored", key);
            }
            Err(e) => {
                warn!(
                    "Settlement write for channel {} failed: {}",
                    channel_hex(&channel.id),
                    e
                );
                let fallback = if channel.dispute.is_some() {
                    ChannelStatus::Disputed
                } else {
                    ChannelStatus::Active
                };
                channel.transition(fallback)?;
                return Err(e);
            }
        }

        if path == SettlementPath::Cooperative {
            channel.dispute = None;
        }
        channel.transition(ChannelStatus::Closed)?;
        info!(
            "Channel {} closed at sequence {} ({})",
            channel_hex(&channel.id),
            record.final_sequence,
            path.as_str()
        );
        crate::metrics::record_channel_settled(path.as_str());
        self.events.publish(ProtocolEvent::ChannelClosed {
            channel_id: channel.id,
            final_sequence: record.final_sequence,
        });

        let mut snapshot = channel.snapshot();
        snapshot.settlement = Some(record.clone());
        self.archive.insert(channel.id, snapshot);
        self.channels.remove(&channel.id);

        Ok(record)
    }

    fn handle(&self, channel_id: &ChannelId) -> CoordinatorResult<Arc<Mutex<Channel>>> {
        self.channels
            .get(channel_id)
            .map(|h| h.clone())
            .ok_or_else(|| CoordinatorError::ChannelNotFound {
                channel_id: channel_hex(channel_id),
            })
    }

    fn handles(&self) -> Vec<(ChannelId, Arc<Mutex<Channel>>)> {
        self.channels
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::signature::{DigestKeyring, KeyringSigner, Signer};
    use crate::state::MemoryStore;
    use std::time::Duration;

    const CHANNEL: ChannelId = [0xc1; 32];

    struct Harness {
        store: Arc<MemoryStore>,
        manager: ChannelManager,
        alice: KeyringSigner,
        bob: KeyringSigner,
    }

    fn harness() -> Harness {
        let keyring = Arc::new(DigestKeyring::new());
        keyring.insert("alice", b"alice".to_vec());
        keyring.insert("bob", b"bob".to_vec());
        let store = Arc::new(MemoryStore::new());
        Harness {
            alice: keyring.signer("alice").unwrap(),
            bob: keyring.signer("bob").unwrap(),
            manager: ChannelManager::new(
                store.clone(),
                keyring,
                DisputeResolver::new(Duration::from_secs(60)),
                EventBus::default(),
            ),
            store,
        }
    }

    fn request() -> ChannelOpenRequest {
        ChannelOpenRequest {
            channel_id: CHANNEL,
            participants: vec!["alice".into(), "bob".into()],
            deposit_confirmations: [("alice".to_string(), 100), ("bob".to_string(), 50)]
                .into_iter()
                .collect(),
        }
    }

    impl Harness {
        fn update(&self, seq: u64) -> ChannelUpdate {
            ChannelUpdate::new(CHANNEL, seq, format!("balance-{}", seq).as_bytes())
                .signed_by(&[&self.alice as &dyn Signer, &self.bob])
        }

        async fn active_at(&self, last: u64) {
            self.store.record_deposit(&CHANNEL, "alice", 100);
            self.store.record_deposit(&CHANNEL, "bob", 50);
            assert_eq!(self.manager.open(request()).await.unwrap(), ChannelStatus::Open);
            for seq in 0..=last {
                self.manager.apply_update(self.update(seq)).await.unwrap();
            }
        }

        async fn status(&self) -> ChannelStatus {
            self.manager.get(&CHANNEL).await.unwrap().status
        }
    }

    #[tokio::test]
    async fn test_open_waits_for_deposits() {
        let h = harness();
        h.store.record_deposit(&CHANNEL, "alice", 100);
        h.store.record_deposit(&CHANNEL, "bob", 10);

        assert_eq!(h.manager.open(request()).await.unwrap(), ChannelStatus::Proposed);
        assert!(matches!(
            h.manager.confirm_deposits(&CHANNEL).await,
            Err(CoordinatorError::DepositsUnconfirmed { missing, .. }) if missing == vec!["bob".to_string()]
        ));
        assert!(matches!(
            h.manager.apply_update(h.update(0)).await,
            Err(CoordinatorError::InvalidUpdate(_))
        ));

        h.store.record_deposit(&CHANNEL, "bob", 50);
        h.manager.confirm_deposits(&CHANNEL).await.unwrap();
        assert_eq!(h.status().await, ChannelStatus::Open);

        assert!(matches!(
            h.manager.open(request()).await,
            Err(CoordinatorError::ChannelExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_first_update_activates() {
        let h = harness();
        h.active_at(0).await;
        assert_eq!(h.status().await, ChannelStatus::Active);

        assert_eq!(
            h.manager.apply_update(h.update(0)).await.unwrap(),
            AppendOutcome::Stale
        );
        assert!(matches!(
            h.manager.apply_update(h.update(5)).await,
            Err(CoordinatorError::SequenceGap { expected: 1, got: 5 })
        ));
    }

    #[tokio::test]
    async fn test_cooperative_close_settles_and_archives() {
        let h = harness();
        h.active_at(3).await;

        assert!(matches!(
            h.manager.close(h.update(2)).await,
            Err(CoordinatorError::SequenceStale { last: 3, got: 2 })
        ));

        let record = h.manager.close(h.update(4)).await.unwrap();
        assert_eq!(record.final_sequence, 4);
        assert_eq!(h.store.settlement(&CHANNEL), Some(record.clone()));

        let snapshot = h.manager.get(&CHANNEL).await.unwrap();
        assert_eq!(snapshot.status, ChannelStatus::Closed);
        assert_eq!(snapshot.settlement, Some(record));
        assert_eq!(h.manager.channel_count(), 0);
        assert_eq!(h.manager.archived_count(), 1);
    }

    #[tokio::test]
    async fn test_unilateral_close_requires_participant() {
        let h = harness();
        h.active_at(1).await;
        assert!(matches!(
            h.manager.close_unilateral("mallory", h.update(1)).await,
            Err(CoordinatorError::Unauthorized { .. })
        ));
        assert_eq!(h.status().await, ChannelStatus::Active);
    }

    #[tokio::test]
    async fn test_unilateral_close_below_accepted_is_stale() {
        let h = harness();
        h.active_at(5).await;

        let err = h
            .manager
            .close_unilateral("alice", h.update(3))
            .await
            .unwrap_err();
        assert!(err.is_silent());

        let snapshot = h.manager.get(&CHANNEL).await.unwrap();
        assert_eq!(snapshot.status, ChannelStatus::Active);
        assert_eq!(snapshot.sequence, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispute_finalizes_highest() {
        let h = harness();
        h.active_at(7).await;

        let summary = h.manager.close_unilateral("alice", h.update(7)).await.unwrap();
        assert_eq!(summary.candidate_sequence, 7);
        assert_eq!(h.status().await, ChannelStatus::Disputed);

        // updates go through challenges while disputed
        assert!(h.manager.apply_update(h.update(8)).await.is_err());
        let outcome = h.manager.challenge("bob", h.update(9)).await.unwrap();
        assert!(outcome.window_restarted);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(h.manager.finalize_expired_disputes().await.is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(h.manager.finalize_expired_disputes().await, vec![CHANNEL]);
        assert_eq!(h.store.settlement(&CHANNEL).map(|r| r.final_sequence), Some(9));

        assert!(matches!(
            h.manager.challenge("alice", h.update(11)).await,
            Err(CoordinatorError::ChallengeWindowClosed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooperative_close_ends_dispute() {
        let h = harness();
        h.active_at(2).await;
        h.manager.close_unilateral("bob", h.update(2)).await.unwrap();

        let record = h.manager.close(h.update(3)).await.unwrap();
        assert_eq!(record.final_sequence, 3);
        assert_eq!(h.status().await, ChannelStatus::Closed);
    }

    #[tokio::test]
    async fn test_already_anchored_settlement_closes() {
        let h = harness();
        h.active_at(1).await;

        h.store
            .record_channel_settlement(&ChannelSettlementRecord {
                channel_id: CHANNEL,
                final_sequence: 2,
                final_state_hash: h.update(2).state_hash,
                closed_at: Utc::now(),
            })
            .await
            .unwrap();

        let record = h.manager.close(h.update(2)).await.unwrap();
        assert_eq!(record.final_sequence, 2);
        assert_eq!(h.status().await, ChannelStatus::Closed);
    }

    /// Memory store whose settlement writes fail while `down` is set
    struct FlakyAnchor {
        store: Arc<MemoryStore>,
        down: std::sync::atomic::AtomicBool,
    }

    impl FlakyAnchor {
        fn set_down(&self, down: bool) {
            self.down.store(down, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl LedgerAnchor for FlakyAnchor {
        async fn record_transaction_outcome(
            &self,
            record: &crate::anchor::TransactionOutcomeRecord,
        ) -> CoordinatorResult<()> {
            self.store.record_transaction_outcome(record).await
        }

        async fn record_channel_settlement(
            &self,
            record: &ChannelSettlementRecord,
        ) -> CoordinatorResult<()> {
            if self.down.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(CoordinatorError::Internal("anchor unavailable".to_string()));
            }
            self.store.record_channel_settlement(record).await
        }

        async fn confirmed_deposit(
            &self,
            _channel_id: &ChannelId,
            _participant: &str,
        ) -> CoordinatorResult<Option<u128>> {
            Ok(Some(u128::MAX))
        }
    }

    fn flaky_harness() -> (Harness, Arc<FlakyAnchor>) {
        let keyring = Arc::new(DigestKeyring::new());
        keyring.insert("alice", b"alice".to_vec());
        keyring.insert("bob", b"bob".to_vec());
        let store = Arc::new(MemoryStore::new());
        let anchor = Arc::new(FlakyAnchor {
            store: store.clone(),
            down: std::sync::atomic::AtomicBool::new(true),
        });
        let harness = Harness {
            alice: keyring.signer("alice").unwrap(),
            bob: keyring.signer("bob").unwrap(),
            manager: ChannelManager::new(
                anchor.clone(),
                keyring,
                DisputeResolver::new(Duration::from_secs(60)),
                EventBus::default(),
            ),
            store,
        };
        (harness, anchor)
    }

    #[tokio::test]
    async fn test_failed_settlement_returns_to_active() {
        let (h, _anchor) = flaky_harness();
        h.active_at(0).await;

        assert!(h.manager.close(h.update(1)).await.is_err());
        let snapshot = h.manager.get(&CHANNEL).await.unwrap();
        assert_eq!(snapshot.status, ChannelStatus::Active);
        assert_eq!(snapshot.sequence, Some(0));
        assert_eq!(h.manager.archived_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dispute_settlement_keeps_winner() {
        let (h, anchor) = flaky_harness();
        h.active_at(7).await;
        h.manager.close_unilateral("alice", h.update(7)).await.unwrap();
        h.manager.challenge("bob", h.update(9)).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(h.manager.finalize_dispute(&CHANNEL).await.is_err());
        let snapshot = h.manager.get(&CHANNEL).await.unwrap();
        assert_eq!(snapshot.status, ChannelStatus::Disputed);
        let dispute = snapshot.dispute.unwrap();
        assert_eq!(dispute.candidate_sequence, 9);

        // the dispute cannot be reopened or extended
        assert!(matches!(
            h.manager.close_unilateral("alice", h.update(7)).await,
            Err(CoordinatorError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            h.manager.challenge("alice", h.update(10)).await,
            Err(CoordinatorError::ChallengeWindowClosed { .. })
        ));
        assert!(h.manager.finalize_expired_disputes().await.is_empty());

        anchor.set_down(false);
        assert_eq!(h.manager.finalize_expired_disputes().await, vec![CHANNEL]);
        assert_eq!(h.store.settlement(&CHANNEL).map(|r| r.final_sequence), Some(9));
        assert_eq!(h.status().await, ChannelStatus::Closed);
    }

    #[test]
    fn test_status_transitions() {
        use ChannelStatus::*;
        assert!(Proposed.can_transition_to(Open));
        assert!(!Proposed.can_transition_to(Active));
        assert!(Active.can_transition_to(Disputed));
        assert!(Closing.can_transition_to(Active));
        assert!(Closing.can_transition_to(Disputed));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Disputed.can_transition_to(Active));
    }
}
