//! Shared building blocks for the routing tier: identifier newtypes, logical
//! time, wire document helpers, and the remote command executor seam.

pub mod document;
pub mod knobs;
pub mod remote;
pub mod types;

pub use document::{
    CommandResponse,
    Document,
};
pub use types::{
    ClusterTime,
    LogicalClock,
    OpTime,
    ReadConcern,
    ReadConcernLevel,
    SessionId,
    ShardId,
    StmtId,
    TenantId,
    TxnNumber,
    WriteConcern,
};
