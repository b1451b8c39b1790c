//! Shard participants
//!
//! Each participant owns the lock table for its shard and votes in the
//! two-phase commit driven by the coordinator:
//! 1. `prepare` locks every resource key or none of them
//! 2. `commit` applies the staged effect and releases locks
//! 3. `abort` discards the staged effect and releases locks
//!
//! Locks held past the shard's max duration are released unilaterally and
//! a late commit is then rejected as a stale decision.

pub mod message;
pub mod participant;
pub mod transport;

pub use message::{MessagePhase, PrepareFailure, PrepareVote, ShardMessage, ShardReply};
pub use participant::{LocalPhase, ResourceLock, ResourceVersion, ShardParticipant};
pub use transport::{LocalTransport, ShardTransport};
