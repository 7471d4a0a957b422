//! Per-shard transaction participant state.

use common::types::{
    ClusterTime,
    ReadConcern,
    StmtId,
};

/// Read-only classification reported by the participant itself on its
/// statement responses. Transitions are monotone:
/// `Unset → ReadOnly → NotReadOnly`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOnly {
    Unset,
    ReadOnly,
    NotReadOnly,
}

/// Transaction options every participant of one attempt shares, captured
/// when the participant is created.
#[derive(Clone, Debug, PartialEq)]
pub struct SharedOptions {
    pub read_concern: ReadConcern,
    pub at_cluster_time: Option<ClusterTime>,
}

/// A shard that has received at least one statement of the transaction.
#[derive(Clone, Debug)]
pub struct Participant {
    /// Exactly one participant per attempt is the coordinator: the first one
    /// created.
    pub is_coordinator: bool,
    pub read_only: ReadOnly,
    /// Statement index at which this shard was first contacted. Participants
    /// created by the current statement are "pending" and are evicted on
    /// routing-stale retries.
    pub stmt_id_created_at: StmtId,
    pub shared_options: SharedOptions,
}

impl Participant {
    pub fn new(is_coordinator: bool, stmt_id_created_at: StmtId, shared_options: SharedOptions) -> Self {
        Self {
            is_coordinator,
            read_only: ReadOnly::Unset,
            stmt_id_created_at,
            shared_options,
        }
    }
}
