//! Tesseract Coordinator
//!
//! Cross-shard two-phase commit and state channel settlement. The
//! coordinator drives Prepare/Commit/Abort against shard participants and
//! anchors outcomes; the channel manager accepts signed updates in strict
//! sequence order and settles channels cooperatively or through a bounded
//! dispute.

pub mod anchor;
pub mod api;
pub mod channel;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod metrics;
pub mod registry;
pub mod shard;
pub mod state;
pub mod types;

pub use error::{CoordinatorError, CoordinatorResult};
