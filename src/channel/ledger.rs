//! Append-only, strictly ordered log of accepted channel updates

use super::signature::SignatureScheme;
use super::update::ChannelUpdate;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::{channel_hex, ChannelId, Identity};

use tracing::debug;

/// Result of offering an update to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Accepted,
    /// Sequence at or below the last accepted one; ignored
    Stale,
}

/// Check that every channel participant signed `update` and nobody else did
pub fn verify_quorum(
    participants: &[Identity],
    update: &ChannelUpdate,
    scheme: &dyn SignatureScheme,
) -> CoordinatorResult<()> {
    let digest = update.signing_digest();

    for (signer, signature) in &update.signatures {
        if !participants.contains(signer) || !scheme.verify(signer, &digest, signature) {
            return Err(CoordinatorError::SignatureInvalid {
                signer: signer.clone(),
            });
        }
    }

    let missing: Vec<String> = participants
        .iter()
        .filter(|p| !update.signatures.contains_key(*p))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(CoordinatorError::QuorumNotMet { missing });
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct ChannelLedger {
    channel_id: ChannelId,
    participants: Vec<Identity>,
    updates: Vec<ChannelUpdate>,
}

impl ChannelLedger {
    pub fn new(channel_id: ChannelId, participants: Vec<Identity>) -> Self {
        Self {
            channel_id,
            participants,
            updates: Vec::new(),
        }
    }

    pub fn participants(&self) -> &[Identity] {
        &self.participants
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.updates.last().map(|u| u.sequence)
    }

    /// The authoritative state: the highest accepted update
    pub fn current(&self) -> Option<&ChannelUpdate> {
        self.updates.last()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Accept `update` iff it is exactly the next sequence and fully signed
    pub fn append(
        &mut self,
        update: ChannelUpdate,
        scheme: &dyn SignatureScheme,
    ) -> CoordinatorResult<AppendOutcome> {
        if update.channel_id != self.channel_id {
            return Err(CoordinatorError::InvalidUpdate(format!(
                "update for channel {} offered to channel {}",
                channel_hex(&update.channel_id),
                channel_hex(&self.channel_id)
            )));
        }

        let expected = self.last_sequence().map_or(0, |last| last + 1);
        if update.sequence < expected {
            debug!(
                "Ignoring stale update {} for channel {} (next is {})",
                update.sequence,
                channel_hex(&self.channel_id),
                expected
            );
            return Ok(AppendOutcome::Stale);
        }
        if update.sequence > expected {
            return Err(CoordinatorError::SequenceGap {
                expected,
                got: update.sequence,
            });
        }

        verify_quorum(&self.participants, &update, scheme)?;
        self.updates.push(update);
        Ok(AppendOutcome::Accepted)
    }
}
