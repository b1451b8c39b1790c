//! State channels
//!
//! Participants exchange signed updates directly. The manager:
//! 1. Opens a channel once the ledger anchor confirms every deposit
//! 2. Accepts updates strictly in sequence through the channel ledger
//! 3. Settles cooperatively, or through a bounded dispute on unilateral close

pub mod dispute;
pub mod ledger;
pub mod manager;
pub mod signature;
pub mod update;

pub use dispute::{ChallengeOutcome, DisputeRecord, DisputeResolver, DisputeSubmission, DisputeSummary};
pub use ledger::{verify_quorum, AppendOutcome, ChannelLedger};
pub use manager::{ChannelManager, ChannelOpenRequest, ChannelSnapshot, ChannelStatus};
pub use signature::{DigestKeyring, KeyringSigner, SignatureScheme, Signer};
pub use update::{ChannelUpdate, ChannelUpdateMessage};
