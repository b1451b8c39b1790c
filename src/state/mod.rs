//! State management
//!
//! Handles:
//! - Durable coordinator decisions and per-shard delivery tracking
//! - Write-once ledger anchor records (outcomes, settlements)
//! - Confirmed channel deposits

mod manager;
mod memory;

pub use manager::{DecisionStats, StateManager};
pub use memory::MemoryStore;
