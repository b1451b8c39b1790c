//! Error types for the Tesseract Coordinator

use thiserror::Error;

/// Main error type for the coordinator and channel components
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("Shard {shard_id} not found")]
    ShardNotFound { shard_id: u64 },

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: String },

    #[error("Channel {channel_id} not found")]
    ChannelNotFound { channel_id: String },

    #[error("Channel {channel_id} already exists")]
    ChannelExists { channel_id: String },

    #[error("Resource {resource} on shard {shard_id} is locked by {holder}")]
    LockConflict {
        shard_id: u64,
        resource: String,
        holder: String,
    },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Stale decision for tx {tx_id} on shard {shard_id}")]
    StaleDecision { shard_id: u64, tx_id: String },

    #[error("Invalid signature from {signer}")]
    SignatureInvalid { signer: String },

    #[error("Stale sequence {got}, last accepted is {last}")]
    SequenceStale { last: u64, got: u64 },

    #[error("Sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("Quorum not met, missing signatures from {missing:?}")]
    QuorumNotMet { missing: Vec<String> },

    #[error("Challenge window closed for channel {channel_id}")]
    ChallengeWindowClosed { channel_id: String },

    #[error("Transaction {tx_id} partially applied, undelivered shards {shards:?}")]
    PartiallyApplied { tx_id: String, shards: Vec<u64> },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Cancellation rejected for tx {tx_id}: prepare votes already recorded")]
    CancellationRejected { tx_id: String },

    #[error("Deposits unconfirmed for channel {channel_id}: {missing:?}")]
    DepositsUnconfirmed {
        channel_id: String,
        missing: Vec<String>,
    },

    #[error("Record {key} already anchored")]
    AlreadyAnchored { key: String },

    #[error("{identity} is not authorized to {action}")]
    Unauthorized { identity: String, action: String },

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::LockConflict { .. }
                | CoordinatorError::Timeout { .. }
                | CoordinatorError::Database(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(self, CoordinatorError::PartiallyApplied { .. })
    }

    /// Stale sequences are expected under reordering and never reported to the counterparty
    pub fn is_silent(&self) -> bool {
        matches!(self, CoordinatorError::SequenceStale { .. })
    }
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let conflict = CoordinatorError::LockConflict {
            shard_id: 1,
            resource: "acct:7".to_string(),
            holder: "t1".to_string(),
        };
        assert!(conflict.is_retryable());
        assert!(!conflict.should_alert());

        let partial = CoordinatorError::PartiallyApplied {
            tx_id: "t1".to_string(),
            shards: vec![2],
        };
        assert!(partial.should_alert());
        assert!(!partial.is_retryable());

        assert!(CoordinatorError::SequenceStale { last: 5, got: 3 }.is_silent());
        assert!(!CoordinatorError::QuorumNotMet { missing: vec![] }.is_silent());
    }

    #[test]
    fn test_display_includes_context() {
        let err = CoordinatorError::SequenceStale { last: 5, got: 3 };
        assert_eq!(err.to_string(), "Stale sequence 3, last accepted is 5");
    }
}
