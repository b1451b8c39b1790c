//! Signed channel state updates

use super::signature::Signer;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::{channel_hex, keccak256, parse_channel_id, ChannelId, Hash, Identity};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One state update of a channel. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdate {
    pub channel_id: ChannelId,
    pub sequence: u64,
    /// Hash of the opaque state snapshot
    pub state_hash: Hash,
    pub signatures: BTreeMap<Identity, Vec<u8>>,
}

impl ChannelUpdate {
    /// Unsigned update over a raw state snapshot
    pub fn new(channel_id: ChannelId, sequence: u64, state: &[u8]) -> Self {
        Self {
            channel_id,
            sequence,
            state_hash: keccak256(&[state]),
            signatures: BTreeMap::new(),
        }
    }

    /// Digest every participant signs: (channel id, sequence, state hash)
    pub fn signing_digest(&self) -> Hash {
        keccak256(&[
            &self.channel_id,
            &self.sequence.to_be_bytes(),
            &self.state_hash,
        ])
    }

    pub fn sign(&mut self, signer: &dyn Signer) {
        let signature = signer.sign(&self.signing_digest());
        self.signatures
            .insert(signer.identity().to_string(), signature);
    }

    /// Builder form of `sign`
    pub fn signed_by(mut self, signers: &[&dyn Signer]) -> Self {
        for signer in signers {
            self.sign(*signer);
        }
        self
    }

    pub fn to_message(&self) -> ChannelUpdateMessage {
        ChannelUpdateMessage {
            channel_id: channel_hex(&self.channel_id),
            sequence: self.sequence,
            state_hash: hex::encode(self.state_hash),
            signatures: self
                .signatures
                .iter()
                .map(|(who, sig)| (who.clone(), hex::encode(sig)))
                .collect(),
        }
    }
}

/// Wire form of a channel update, hex-encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelUpdateMessage {
    pub channel_id: String,
    pub sequence: u64,
    pub state_hash: String,
    pub signatures: BTreeMap<Identity, String>,
}

impl TryFrom<ChannelUpdateMessage> for ChannelUpdate {
    type Error = CoordinatorError;

    fn try_from(msg: ChannelUpdateMessage) -> CoordinatorResult<Self> {
        let channel_id = parse_channel_id(&msg.channel_id)
            .ok_or_else(|| CoordinatorError::InvalidUpdate("malformed channel id".to_string()))?;
        let state_hash = hex::decode(&msg.state_hash)
            .ok()
            .and_then(|b| <Hash>::try_from(b).ok())
            .ok_or_else(|| CoordinatorError::InvalidUpdate("malformed state hash".to_string()))?;

        let mut signatures = BTreeMap::new();
        for (who, sig) in msg.signatures {
            let bytes = hex::decode(&sig)
                .map_err(|_| CoordinatorError::SignatureInvalid { signer: who.clone() })?;
            signatures.insert(who, bytes);
        }

        Ok(Self {
            channel_id,
            sequence: msg.sequence,
            state_hash,
            signatures,
        })
    }
}
