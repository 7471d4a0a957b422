//! Cross-shard transaction routing.
//!
//! A routing node holds one [`TransactionRouter`] per client session
//! (checked out through the [`session::SessionCatalog`]); the router frames
//! statements, tracks participants, and drives commit and abort across the
//! shards the transaction touched. [`admission`] gates statements on tenant
//! migration blockers before they reach the shards.

pub mod admission;
pub mod commit;
pub mod metrics;
pub mod participant;
pub mod recovery_token;
pub mod router;
pub mod session;

#[cfg(test)]
mod test_helpers;

pub use commit::CommitType;
pub use metrics::RouterMetrics;
pub use participant::{
    Participant,
    ReadOnly,
};
pub use recovery_token::RecoveryToken;
pub use router::{
    TransactionAction,
    TransactionRouter,
};
pub use session::{
    CheckedOutRouter,
    SessionCatalog,
};
