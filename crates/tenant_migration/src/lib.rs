//! Tenant migration support for the donor side of a live tenant hand-off.
//!
//! A per-tenant [`TenantMigrationAccessBlocker`] quiesces tenant traffic
//! while the recipient copies data, then either redirects clients (commit)
//! or lets traffic resume (abort). The free functions here are the gates
//! request execution calls on its way into a tenant database.

use std::time::Duration;

use common::{
    knobs::MIGRATION_BLOCKER_MAX_TIMEOUT,
    types::{
        ClusterTime,
        ReadConcernLevel,
    },
};
use errors::ErrorMetadata;
use futures::FutureExt;
use runtime::{
    when_any,
    Runtime,
};

pub mod access_blocker;
pub mod donor_document;
mod error_info;
mod metrics;
pub mod registry;
pub mod replication;

pub use access_blocker::{
    BlockerState,
    MigrationOutcome,
    ReadGate,
    TenantMigrationAccessBlocker,
};
pub use donor_document::{
    parse_donor_state_document,
    recover_access_blockers,
    DonorState,
    DonorStateDocument,
};
pub use error_info::{
    TenantMigrationCommittedInfo,
    TenantMigrationConflictInfo,
};
pub use registry::AccessBlockerRegistry;
pub use replication::MajorityCommitWaiter;

/// Synchronous write gate for a database. Errors with the transient conflict
/// signal in blocking states and the committed redirect in `Reject`.
pub fn check_can_write<RT: Runtime>(
    registry: &AccessBlockerRegistry<RT>,
    db_name: &str,
) -> anyhow::Result<()> {
    match registry.for_db_name(db_name) {
        Some(blocker) => blocker.check_can_write(),
        None => Ok(()),
    }
}

/// Read gate for a database: admits immediately when possible, otherwise
/// suspends until the blocker exits its read-blocking state or `timeout`
/// elapses. Timing out surfaces `ExceededTimeLimit` without touching
/// blocker state.
pub async fn check_can_read_or_block<RT: Runtime>(
    rt: &RT,
    registry: &AccessBlockerRegistry<RT>,
    db_name: &str,
    read_timestamp: Option<ClusterTime>,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let Some(blocker) = registry.for_db_name(db_name) else {
        return Ok(());
    };
    let future = match blocker.can_read_or_wait(read_timestamp) {
        ReadGate::Ready(result) => return result,
        ReadGate::Wait(future) => future,
    };
    match timeout.filter(|t| *t < *MIGRATION_BLOCKER_MAX_TIMEOUT) {
        None => future.await,
        Some(timeout) => {
            let deadline = rt.wait(timeout);
            let (_index, first) = when_any(vec![
                future.map(Some).boxed(),
                deadline.map(|()| None).boxed(),
            ])
            .await;
            match first {
                Some(result) => result,
                None => Err(anyhow::anyhow!(ErrorMetadata::exceeded_time_limit(
                    "Read timed out waiting for tenant migration blocker",
                ))),
            }
        },
    }
}

/// Linearizable reads have no snapshot yet; they are only turned away once
/// the migration has committed.
pub fn check_linearizable_read<RT: Runtime>(
    registry: &AccessBlockerRegistry<RT>,
    db_name: &str,
    level: Option<ReadConcernLevel>,
) -> anyhow::Result<()> {
    if level != Some(ReadConcernLevel::Linearizable) {
        return Ok(());
    }
    match registry.for_db_name(db_name) {
        Some(blocker) => blocker.check_linearizable_read(),
        None => Ok(()),
    }
}

/// Central translation of the transient `TenantMigrationConflict` signal:
/// wait for the migration to finish, then either return `Ok` (aborted; the
/// caller retries the operation on this shard) or the committed redirect
/// error. Errors that are not migration conflicts pass through unchanged.
pub async fn handle_migration_conflict<RT: Runtime>(
    registry: &AccessBlockerRegistry<RT>,
    err: anyhow::Error,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let Some(info) = err.downcast_ref::<TenantMigrationConflictInfo>().cloned() else {
        return Err(err);
    };
    let Some(blocker) = registry.for_tenant(&info.tenant_id) else {
        // The migration was garbage collected between the conflict and this
        // wait; its blocker can no longer be blocking anything.
        return Ok(());
    };
    blocker.wait_until_committed_or_aborted(timeout).await
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use async_trait::async_trait;
    use common::types::{
        ClusterTime,
        OpTime,
        ReadConcernLevel,
        TenantId,
    };
    use errors::{
        ErrorCode,
        ErrorMetadataAnyhowExt,
    };
    use runtime::testing::TestRuntime;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    use crate::{
        check_can_read_or_block,
        check_can_write,
        check_linearizable_read,
        handle_migration_conflict,
        registry::AccessBlockerRegistry,
        replication::MajorityCommitWaiter,
        TenantMigrationAccessBlocker,
    };

    struct ReleasableWaiter {
        release: Notify,
    }

    #[async_trait]
    impl MajorityCommitWaiter for ReleasableWaiter {
        async fn await_majority(
            &self,
            _op_time: OpTime,
            cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            tokio::select! {
                () = self.release.notified() => Ok(()),
                () = cancel.cancelled() => anyhow::bail!("canceled"),
            }
        }
    }

    fn setup(
        rt: &TestRuntime,
    ) -> (
        Arc<AccessBlockerRegistry<TestRuntime>>,
        Arc<TenantMigrationAccessBlocker<TestRuntime>>,
        Arc<ReleasableWaiter>,
    ) {
        let waiter = Arc::new(ReleasableWaiter {
            release: Notify::new(),
        });
        let registry = AccessBlockerRegistry::new();
        let blocker = TenantMigrationAccessBlocker::new(
            rt.clone(),
            TenantId::from("acme"),
            "recipient-rs0/host1:27017".to_owned(),
            waiter.clone(),
        );
        registry.add(blocker.clone()).unwrap();
        (registry, blocker, waiter)
    }

    #[tokio::test(start_paused = true)]
    async fn test_gates_ignore_unmanaged_databases() {
        let rt = TestRuntime::new();
        let (registry, blocker, _waiter) = setup(&rt);
        blocker.start_blocking_writes();

        check_can_write(&registry, "payments").unwrap();
        check_can_read_or_block(&rt, &registry, "payments", None, None)
            .await
            .unwrap();
        check_can_write(&registry, "acme_orders").unwrap_err();
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_write_waits_then_retries_after_abort() {
        let rt = TestRuntime::new();
        let (registry, blocker, waiter) = setup(&rt);
        blocker.start_blocking_writes();

        let err = check_can_write(&registry, "acme_orders").unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::TenantMigrationConflict));

        blocker.abort(OpTime::new(ClusterTime::new(120, 0), 1));
        waiter.release.notify_one();
        // Abort resolves the conflict with success; the caller retries the
        // write against this shard.
        handle_migration_conflict(&registry, err, None).await.unwrap();
        check_can_write(&registry, "acme_orders").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_write_redirects_after_commit() {
        let rt = TestRuntime::new();
        let (registry, blocker, waiter) = setup(&rt);
        blocker.start_blocking_writes();
        let err = check_can_write(&registry, "acme_orders").unwrap_err();

        blocker.start_blocking_reads_after(ClusterTime::new(100, 0));
        blocker.commit(OpTime::new(ClusterTime::new(120, 0), 1));
        waiter.release.notify_one();

        let err = handle_migration_conflict(&registry, err, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::TenantMigrationCommitted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_gate_times_out() {
        let rt = TestRuntime::new();
        let (registry, blocker, _waiter) = setup(&rt);
        blocker.start_blocking_writes();
        blocker.start_blocking_reads_after(ClusterTime::new(100, 0));

        let err = check_can_read_or_block(
            &rt,
            &registry,
            "acme_orders",
            Some(ClusterTime::new(150, 0)),
            Some(Duration::from_secs(10)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::ExceededTimeLimit));
    }

    #[tokio::test(start_paused = true)]
    async fn test_linearizable_reads_bypass_blocking() {
        let rt = TestRuntime::new();
        let (registry, blocker, waiter) = setup(&rt);
        blocker.start_blocking_writes();
        blocker.start_blocking_reads_after(ClusterTime::new(100, 0));

        check_linearizable_read(
            &registry,
            "acme_orders",
            Some(ReadConcernLevel::Linearizable),
        )
        .unwrap();

        blocker.commit(OpTime::new(ClusterTime::new(120, 0), 1));
        waiter.release.notify_one();
        blocker.on_completion().await;

        let err = check_linearizable_read(
            &registry,
            "acme_orders",
            Some(ReadConcernLevel::Linearizable),
        )
        .unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::TenantMigrationCommitted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_for_collected_migration_retries() {
        let rt = TestRuntime::new();
        let (registry, blocker, _waiter) = setup(&rt);
        blocker.start_blocking_writes();
        let err = check_can_write(&registry, "acme_orders").unwrap_err();

        registry.remove(&TenantId::from("acme"));
        handle_migration_conflict(&registry, err, None).await.unwrap();
    }
}
