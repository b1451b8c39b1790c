//! Cross-shard transaction coordination
//!
//! The coordinator:
//! 1. Validates the participant set against the shard registry
//! 2. Sends Prepare to every shard in parallel under one deadline
//! 3. Writes the Commit/Abort decision durably
//! 4. Delivers the decision with retry and anchors the outcome

pub mod decision_log;
pub mod engine;
pub mod transaction;

pub use decision_log::{DecisionLog, DecisionRecord, DeliveryStatus};
pub use engine::TransactionCoordinator;
pub use transaction::{
    CrossShardTransaction, Decision, DecisionReason, PrepareResponse, TransactionOutcome,
    TransactionPhase,
};
