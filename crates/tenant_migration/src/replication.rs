//! Seam to the replication subsystem: the blocker only needs to know when an
//! op-time has been majority-committed.

use async_trait::async_trait;
use common::types::OpTime;
use tokio_util::sync::CancellationToken;

/// Resolves once an op-time is majority-committed on this replica set.
///
/// Errors are treated as transient; the blocker retries with exponential
/// backoff until success or shutdown. Implementations must return promptly
/// (with any error) when `cancel` fires.
#[async_trait]
pub trait MajorityCommitWaiter: Send + Sync + 'static {
    async fn await_majority(
        &self,
        op_time: OpTime,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}
