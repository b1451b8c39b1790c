//! Prepare/Commit/Abort wire messages between coordinator and shards

use crate::types::{Hash, ShardId, TransactionId};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePhase {
    Prepare,
    Commit,
    Abort,
}

/// Message sent from the coordinator to one shard participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMessage {
    pub transaction_id: TransactionId,
    pub shard_id: ShardId,
    pub phase: MessagePhase,
    pub resource_keys: Vec<String>,
    #[serde(with = "crate::types::hex_hash")]
    pub payload_hash: Hash,
}

/// Why a participant refused to prepare
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrepareFailure {
    /// Resource held by a different transaction
    LockConflict {
        resource: String,
        holder: TransactionId,
    },
    /// The transaction was already aborted (or expired) on this shard
    AlreadyAborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrepareVote {
    Ok,
    Fail(PrepareFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardReply {
    Vote(PrepareVote),
    Ack,
}
