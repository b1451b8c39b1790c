//! Dispute resolution for unilateral channel closes
//!
//! A unilateral close opens a challenge window. Any participant may submit
//! a fully signed update with a strictly higher sequence before the window
//! expires; the first such replacement restarts the window, later ones only
//! replace the candidate. Once the (possibly restarted) window has elapsed
//! the highest valid submission wins.

use super::ledger::verify_quorum;
use super::signature::SignatureScheme;
use super::update::ChannelUpdate;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::{channel_hex, ChannelId, Identity};

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// A competing final-state submission
#[derive(Debug, Clone)]
pub struct DisputeSubmission {
    pub submitted_by: Identity,
    pub update: ChannelUpdate,
}

#[derive(Debug, Clone)]
pub struct DisputeRecord {
    pub channel_id: ChannelId,
    /// Current highest submission
    pub candidate: DisputeSubmission,
    /// Earlier candidates replaced by higher sequences, in arrival order
    pub superseded: Vec<DisputeSubmission>,
    pub deadline: Instant,
    pub window_restarted: bool,
    /// Winning sequence once finalized
    pub resolution: Option<u64>,
}

impl DisputeRecord {
    pub fn candidate(&self) -> &ChannelUpdate {
        &self.candidate.update
    }

    pub fn submission_count(&self) -> usize {
        self.superseded.len() + 1
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn summary(&self) -> DisputeSummary {
        DisputeSummary {
            candidate_sequence: self.candidate().sequence,
            submissions: self.submission_count(),
            window_restarted: self.window_restarted,
            remaining_ms: self
                .deadline
                .saturating_duration_since(Instant::now())
                .as_millis() as u64,
            resolution: self.resolution,
        }
    }
}

/// Serializable view of a dispute
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisputeSummary {
    pub candidate_sequence: u64,
    pub submissions: usize,
    pub window_restarted: bool,
    pub remaining_ms: u64,
    pub resolution: Option<u64>,
}

/// Result of a challenge submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeOutcome {
    pub sequence: u64,
    pub window_restarted: bool,
}

pub struct DisputeResolver {
    window: Duration,
}

impl DisputeResolver {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Open a dispute with the unilateral close submission as first candidate
    pub fn open(
        &self,
        participants: &[Identity],
        submission: DisputeSubmission,
        scheme: &dyn SignatureScheme,
    ) -> CoordinatorResult<DisputeRecord> {
        verify_quorum(participants, &submission.update, scheme)?;

        info!(
            "Dispute opened on channel {} at sequence {} by {}",
            channel_hex(&submission.update.channel_id),
            submission.update.sequence,
            submission.submitted_by
        );

        Ok(DisputeRecord {
            channel_id: submission.update.channel_id,
            candidate: submission,
            superseded: Vec::new(),
            deadline: Instant::now() + self.window,
            window_restarted: false,
            resolution: None,
        })
    }

    /// Offer a competing submission while the window is open
    pub fn submit(
        &self,
        record: &mut DisputeRecord,
        participants: &[Identity],
        submission: DisputeSubmission,
        scheme: &dyn SignatureScheme,
    ) -> CoordinatorResult<ChallengeOutcome> {
        if record.resolution.is_some() || record.is_expired() {
            return Err(CoordinatorError::ChallengeWindowClosed {
                channel_id: channel_hex(&record.channel_id),
            });
        }
        if submission.update.channel_id != record.channel_id {
            return Err(CoordinatorError::InvalidUpdate(
                "submission for a different channel".to_string(),
            ));
        }

        let current = record.candidate().sequence;
        if submission.update.sequence <= current {
            return Err(CoordinatorError::SequenceStale {
                last: current,
                got: submission.update.sequence,
            });
        }

        verify_quorum(participants, &submission.update, scheme)?;

        let restart = !record.window_restarted;
        if restart {
            record.deadline = Instant::now() + self.window;
            record.window_restarted = true;
        }

        let sequence = submission.update.sequence;
        debug!(
            "Channel {} candidate {} -> {} (window restarted: {})",
            channel_hex(&record.channel_id),
            current,
            sequence,
            restart
        );
        let previous = std::mem::replace(&mut record.candidate, submission);
        record.superseded.push(previous);

        Ok(ChallengeOutcome {
            sequence,
            window_restarted: restart,
        })
    }

    /// Pick the winner once the window has elapsed
    pub fn finalize(&self, record: &mut DisputeRecord) -> CoordinatorResult<ChannelUpdate> {
        if !record.is_expired() {
            return Err(CoordinatorError::InvalidStateTransition {
                from: "disputed".to_string(),
                to: "closing (challenge window still open)".to_string(),
            });
        }

        let winner = select_highest(
            std::iter::once(&record.candidate).chain(record.superseded.iter()),
        )
        .cloned()
        .ok_or_else(|| CoordinatorError::Internal("dispute without submissions".to_string()))?;
        record.resolution = Some(winner.sequence);

        info!(
            "Dispute on channel {} resolved at sequence {}",
            channel_hex(&record.channel_id),
            winner.sequence
        );
        Ok(winner)
    }
}

/// Highest-sequence update among already validated submissions
pub fn select_highest<'a, I>(submissions: I) -> Option<&'a ChannelUpdate>
where
    I: IntoIterator<Item = &'a DisputeSubmission>,
{
    submissions
        .into_iter()
        .map(|s| &s.update)
        .max_by_key(|u| u.sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::signature::{DigestKeyring, Signer};

    fn setup() -> (DigestKeyring, Vec<Identity>) {
        let keyring = DigestKeyring::new();
        keyring.insert("alice", b"a".to_vec());
        keyring.insert("bob", b"b".to_vec());
        (keyring, vec!["alice".to_string(), "bob".to_string()])
    }

    fn submission(keyring: &DigestKeyring, who: &str, seq: u64) -> DisputeSubmission {
        let alice = keyring.signer("alice").unwrap();
        let bob = keyring.signer("bob").unwrap();
        DisputeSubmission {
            submitted_by: who.to_string(),
            update: ChannelUpdate::new([4; 32], seq, &seq.to_be_bytes())
                .signed_by(&[&alice as &dyn Signer, &bob]),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_restarts_exactly_once() {
        let (keyring, parts) = setup();
        let resolver = DisputeResolver::new(Duration::from_secs(60));
        let mut record = resolver
            .open(&parts, submission(&keyring, "alice", 7), &keyring)
            .unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        let first = resolver
            .submit(&mut record, &parts, submission(&keyring, "bob", 9), &keyring)
            .unwrap();
        assert!(first.window_restarted);

        // restarted window runs a full 60s from the replacement
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!record.is_expired());

        let second = resolver
            .submit(&mut record, &parts, submission(&keyring, "alice", 10), &keyring)
            .unwrap();
        assert!(!second.window_restarted);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(record.is_expired());
        assert!(matches!(
            resolver.submit(&mut record, &parts, submission(&keyring, "bob", 11), &keyring),
            Err(CoordinatorError::ChallengeWindowClosed { .. })
        ));
        assert_eq!(resolver.finalize(&mut record).unwrap().sequence, 10);
        assert_eq!(record.resolution, Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lower_or_unsigned_submissions_rejected() {
        let (keyring, parts) = setup();
        let resolver = DisputeResolver::new(Duration::from_secs(60));
        let mut record = resolver
            .open(&parts, submission(&keyring, "alice", 7), &keyring)
            .unwrap();

        assert!(matches!(
            resolver.submit(&mut record, &parts, submission(&keyring, "bob", 7), &keyring),
            Err(CoordinatorError::SequenceStale { last: 7, got: 7 })
        ));

        let mut unsigned = submission(&keyring, "bob", 8);
        unsigned.update.signatures.remove("alice");
        assert!(matches!(
            resolver.submit(&mut record, &parts, unsigned, &keyring),
            Err(CoordinatorError::QuorumNotMet { .. })
        ));

        // failed submissions do not consume the restart
        assert!(!record.window_restarted);
        assert!(matches!(
            resolver.finalize(&mut record),
            Err(CoordinatorError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_select_highest() {
        let (keyring, _) = setup();
        let subs = vec![
            submission(&keyring, "alice", 3),
            submission(&keyring, "bob", 8),
            submission(&keyring, "alice", 5),
        ];
        assert_eq!(select_highest(&subs).map(|u| u.sequence), Some(8));
        assert!(select_highest(&Vec::<DisputeSubmission>::new()).is_none());
    }
}
