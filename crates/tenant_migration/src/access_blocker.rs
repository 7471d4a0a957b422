//! Per-tenant gate installed on a donor while a tenant is being handed off.
//!
//! The blocker walks `Allow → BlockWrites → BlockWritesAndReads` and then
//! either `Reject` (migration committed; traffic is redirected) or `Aborted`
//! (traffic resumes), with rollbacks back to `Allow` permitted until a
//! commit/abort op-time has been recorded. Request execution observes the
//! blocker through futures so blocked operations never occupy a worker
//! thread.

use std::{
    sync::{
        Arc,
        Weak,
    },
    time::Duration,
};

use common::{
    knobs::{
        MAJORITY_WAIT_INITIAL_BACKOFF,
        MAJORITY_WAIT_MAX_BACKOFF,
        MIGRATION_BLOCKER_MAX_TIMEOUT,
    },
    types::{
        ClusterTime,
        OpTime,
        TenantId,
    },
    Document,
};
use errors::ErrorMetadata;
use futures::{
    future::BoxFuture,
    FutureExt,
};
use parking_lot::Mutex;
use runtime::{
    when_any,
    Backoff,
    Runtime,
    SpawnHandle,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    error_info::{
        committed_error,
        conflict_error,
        TenantMigrationCommittedInfo,
    },
    metrics,
    replication::MajorityCommitWaiter,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockerState {
    Allow,
    BlockWrites,
    BlockWritesAndReads,
    Reject,
    Aborted,
}

impl BlockerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::BlockWrites => "blockWrites",
            Self::BlockWritesAndReads => "blockWritesAndReads",
            Self::Reject => "reject",
            Self::Aborted => "aborted",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Reject | Self::Aborted)
    }
}

/// How a migration ended, as observed through the completion promise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The migration aborted; tenant traffic resumes on this donor.
    Aborted,
    /// The migration committed; tenant traffic must redirect.
    Committed(TenantMigrationCommittedInfo),
    /// The blocker was shut down before reaching a terminal state.
    ShutDown,
}

/// The result of asking whether a read may proceed.
pub enum ReadGate {
    Ready(anyhow::Result<()>),
    /// The read straddles the block timestamp; the future completes when the
    /// blocker exits `BlockWritesAndReads`.
    Wait(BoxFuture<'static, anyhow::Result<()>>),
}

impl ReadGate {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub async fn resolve(self) -> anyhow::Result<()> {
        match self {
            Self::Ready(result) => result,
            Self::Wait(future) => future.await,
        }
    }
}

struct Inner {
    state: BlockerState,
    block_timestamp: Option<ClusterTime>,
    commit_op_time: Option<OpTime>,
    abort_op_time: Option<OpTime>,
    /// Set exactly once, together with the completion watch payload.
    completion_set: bool,
    majority_task: Option<Box<dyn SpawnHandle>>,
}

pub struct TenantMigrationAccessBlocker<RT: Runtime> {
    rt: RT,
    tenant_id: TenantId,
    recipient_conn_string: String,
    waiter: Arc<dyn MajorityCommitWaiter>,
    inner: Mutex<Inner>,
    /// Epoch bumped on every state change; read waiters re-check their
    /// predicate after each bump.
    transition_tx: watch::Sender<u64>,
    completion_tx: watch::Sender<Option<MigrationOutcome>>,
    shutdown: CancellationToken,
}

enum TerminalKind {
    Commit,
    Abort,
}

impl<RT: Runtime> TenantMigrationAccessBlocker<RT> {
    pub fn new(
        rt: RT,
        tenant_id: TenantId,
        recipient_conn_string: String,
        waiter: Arc<dyn MajorityCommitWaiter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rt,
            tenant_id,
            recipient_conn_string,
            waiter,
            inner: Mutex::new(Inner {
                state: BlockerState::Allow,
                block_timestamp: None,
                commit_op_time: None,
                abort_op_time: None,
                completion_set: false,
                majority_task: None,
            }),
            transition_tx: watch::channel(0).0,
            completion_tx: watch::channel(None).0,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn recipient_conn_string(&self) -> &str {
        &self.recipient_conn_string
    }

    pub fn state(&self) -> BlockerState {
        self.inner.lock().state
    }

    fn committed_info(&self) -> TenantMigrationCommittedInfo {
        TenantMigrationCommittedInfo {
            tenant_id: self.tenant_id.clone(),
            recipient_conn_string: self.recipient_conn_string.clone(),
        }
    }

    /// Synchronous write gate. Blocking states surface the transient
    /// conflict signal; callers wait via
    /// [`Self::wait_until_committed_or_aborted`] and retry on the same
    /// shard.
    pub fn check_can_write(&self) -> anyhow::Result<()> {
        let state = self.inner.lock().state;
        match state {
            BlockerState::Allow | BlockerState::Aborted => Ok(()),
            BlockerState::BlockWrites | BlockerState::BlockWritesAndReads => {
                metrics::log_blocked_write();
                Err(conflict_error(self.tenant_id.clone()))
            },
            BlockerState::Reject => {
                metrics::log_redirected_op();
                Err(committed_error(self.committed_info()))
            },
        }
    }

    /// Read gate. Reads below the block timestamp (or with no timestamp at
    /// all) are always admitted; reads at or after it wait for the blocker
    /// to leave `BlockWritesAndReads`.
    pub fn can_read_or_wait(
        self: &Arc<Self>,
        read_timestamp: Option<ClusterTime>,
    ) -> ReadGate {
        let inner = self.inner.lock();
        let can_read = match (inner.state, read_timestamp) {
            (BlockerState::Allow | BlockerState::Aborted | BlockerState::BlockWrites, _) => true,
            (_, None) => true,
            (_, Some(ts)) => {
                let block_ts = inner
                    .block_timestamp
                    .expect("blocking state without a block timestamp");
                ts < block_ts
            },
        };
        if can_read {
            return ReadGate::Ready(Ok(()));
        }
        if inner.state == BlockerState::Reject {
            metrics::log_redirected_op();
            return ReadGate::Ready(Err(committed_error(self.committed_info())));
        }
        drop(inner);

        metrics::log_blocked_read();
        let blocker = self.clone();
        let mut transitions = self.transition_tx.subscribe();
        ReadGate::Wait(
            async move {
                loop {
                    {
                        let inner = blocker.inner.lock();
                        match inner.state {
                            BlockerState::Allow
                            | BlockerState::BlockWrites
                            | BlockerState::Aborted => return Ok(()),
                            BlockerState::Reject => {
                                return Err(committed_error(blocker.committed_info()))
                            },
                            BlockerState::BlockWritesAndReads => {},
                        }
                    }
                    if blocker.shutdown.is_cancelled() || transitions.changed().await.is_err() {
                        anyhow::bail!(ErrorMetadata::shutdown_in_progress(
                            "Tenant migration blocker shutting down",
                        ));
                    }
                }
            }
            .boxed(),
        )
    }

    /// Linearizable reads have not chosen a snapshot yet, so they bypass
    /// `BlockWritesAndReads`; only `Reject` turns them away.
    pub fn check_linearizable_read(&self) -> anyhow::Result<()> {
        if self.inner.lock().state == BlockerState::Reject {
            metrics::log_redirected_op();
            return Err(committed_error(self.committed_info()));
        }
        Ok(())
    }

    pub fn start_blocking_writes(&self) {
        let mut inner = self.inner.lock();
        assert_eq!(inner.state, BlockerState::Allow);
        assert!(inner.block_timestamp.is_none());
        assert!(inner.commit_op_time.is_none());
        assert!(inner.abort_op_time.is_none());
        inner.state = BlockerState::BlockWrites;
        drop(inner);

        metrics::log_migration_blocking();
        tracing::info!(tenant = %self.tenant_id, "Tenant migration starting to block writes");
        self.notify_transition();
    }

    pub fn start_blocking_reads_after(&self, block_timestamp: ClusterTime) {
        let mut inner = self.inner.lock();
        assert_eq!(inner.state, BlockerState::BlockWrites);
        assert!(inner.block_timestamp.is_none());
        assert!(inner.commit_op_time.is_none());
        assert!(inner.abort_op_time.is_none());
        inner.state = BlockerState::BlockWritesAndReads;
        inner.block_timestamp = Some(block_timestamp);
        drop(inner);

        tracing::info!(
            tenant = %self.tenant_id,
            %block_timestamp,
            "Tenant migration starting to block reads after blockTimestamp"
        );
        self.notify_transition();
    }

    /// Rollback of a not-yet-decided migration; wakes pending readers and
    /// writers.
    pub fn roll_back_start_blocking(&self) {
        let mut inner = self.inner.lock();
        assert!(matches!(
            inner.state,
            BlockerState::BlockWrites | BlockerState::BlockWritesAndReads
        ));
        assert!(inner.commit_op_time.is_none());
        assert!(inner.abort_op_time.is_none());
        inner.state = BlockerState::Allow;
        inner.block_timestamp = None;
        drop(inner);

        tracing::info!(tenant = %self.tenant_id, "Tenant migration rolled back blocking state");
        self.notify_transition();
    }

    /// Record the commit op-time and transition to `Reject` once it is
    /// majority-committed.
    pub fn commit(self: &Arc<Self>, op_time: OpTime) {
        {
            let mut inner = self.inner.lock();
            assert_eq!(inner.state, BlockerState::BlockWritesAndReads);
            assert!(inner.commit_op_time.is_none());
            assert!(inner.abort_op_time.is_none());
            inner.commit_op_time = Some(op_time);
        }
        tracing::info!(
            tenant = %self.tenant_id,
            %op_time,
            "Tenant migration waiting for commit OpTime to be majority-committed"
        );
        self.spawn_majority_wait(op_time, TerminalKind::Commit);
    }

    /// Record the abort op-time and transition to `Aborted` once it is
    /// majority-committed. Permitted from any non-terminal state: a
    /// migration may abort before it ever started blocking.
    pub fn abort(self: &Arc<Self>, op_time: OpTime) {
        {
            let mut inner = self.inner.lock();
            assert!(!inner.state.is_terminal());
            assert!(inner.commit_op_time.is_none());
            assert!(inner.abort_op_time.is_none());
            inner.abort_op_time = Some(op_time);
        }
        tracing::info!(
            tenant = %self.tenant_id,
            %op_time,
            "Tenant migration waiting for abort OpTime to be majority-committed"
        );
        self.spawn_majority_wait(op_time, TerminalKind::Abort);
    }

    fn spawn_majority_wait(self: &Arc<Self>, op_time: OpTime, kind: TerminalKind) {
        let weak = Arc::downgrade(self);
        let waiter = self.waiter.clone();
        let cancel = self.shutdown.child_token();
        let rt = self.rt.clone();
        let task = self.rt.spawn("tenant_migration_majority_wait", async move {
            let timer = ::metrics::StatusTimer::new(&metrics::MIGRATION_MAJORITY_WAIT_SECONDS);
            let mut backoff =
                Backoff::new(*MAJORITY_WAIT_INITIAL_BACKOFF, *MAJORITY_WAIT_MAX_BACKOFF);
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                match waiter.await_majority(op_time, &cancel).await {
                    Ok(()) => break,
                    Err(e) => {
                        let delay = backoff.fail();
                        tracing::debug!(
                            %op_time,
                            error = %e,
                            ?delay,
                            "Majority wait failed; backing off"
                        );
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = rt.wait(delay) => {},
                        }
                    },
                }
            }
            timer.finish();
            // Holding only a weak reference here keeps the blocker's
            // lifetime acyclic: the registry owns the blocker, the blocker
            // owns this task's handle.
            let Some(blocker) = weak.upgrade() else {
                return;
            };
            match kind {
                TerminalKind::Commit => blocker.on_majority_committed(),
                TerminalKind::Abort => blocker.on_majority_aborted(),
            }
        });
        self.inner.lock().majority_task = Some(task);
    }

    fn on_majority_committed(&self) {
        let mut inner = self.inner.lock();
        if inner.completion_set {
            return;
        }
        assert_eq!(inner.state, BlockerState::BlockWritesAndReads);
        assert!(inner.block_timestamp.is_some());
        assert!(inner.commit_op_time.is_some());
        assert!(inner.abort_op_time.is_none());
        inner.state = BlockerState::Reject;
        inner.completion_set = true;
        drop(inner);

        metrics::log_migration_committed();
        // send_replace stores the outcome even when nothing has subscribed
        // yet; later subscribers read it off the watch.
        self.completion_tx
            .send_replace(Some(MigrationOutcome::Committed(self.committed_info())));
        self.notify_transition();
        tracing::info!(
            tenant = %self.tenant_id,
            "Tenant migration commit OpTime is majority-committed; rejecting tenant traffic"
        );
    }

    fn on_majority_aborted(&self) {
        let mut inner = self.inner.lock();
        if inner.completion_set {
            return;
        }
        assert!(inner.commit_op_time.is_none());
        assert!(inner.abort_op_time.is_some());
        inner.state = BlockerState::Aborted;
        inner.completion_set = true;
        drop(inner);

        metrics::log_migration_aborted();
        self.completion_tx
            .send_replace(Some(MigrationOutcome::Aborted));
        self.notify_transition();
        tracing::info!(
            tenant = %self.tenant_id,
            "Tenant migration abort OpTime is majority-committed; tenant traffic resumes"
        );
    }

    /// One-shot completion promise: resolves at the terminal transition, or
    /// with `ShutDown` if the blocker is torn down first.
    pub fn on_completion(&self) -> BoxFuture<'static, MigrationOutcome> {
        let mut rx = self.completion_tx.subscribe();
        async move {
            loop {
                if let Some(outcome) = rx.borrow_and_update().clone() {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return MigrationOutcome::ShutDown;
                }
            }
        }
        .boxed()
    }

    /// Block until the migration commits or aborts, up to `timeout`.
    /// Timing out never disturbs blocker state.
    pub async fn wait_until_committed_or_aborted(
        &self,
        timeout: Option<Duration>,
    ) -> anyhow::Result<()> {
        let completion = self.on_completion();
        let outcome = match timeout.filter(|t| *t < *MIGRATION_BLOCKER_MAX_TIMEOUT) {
            None => Some(completion.await),
            Some(timeout) => {
                let deadline = self.rt.wait(timeout);
                let (_index, first) = when_any(vec![
                    completion.map(Some).boxed(),
                    deadline.map(|()| None).boxed(),
                ])
                .await;
                first
            },
        };
        match outcome {
            Some(MigrationOutcome::Aborted) => Ok(()),
            Some(MigrationOutcome::Committed(info)) => Err(committed_error(info)),
            Some(MigrationOutcome::ShutDown) => Err(anyhow::anyhow!(
                ErrorMetadata::shutdown_in_progress("Tenant migration blocker shutting down")
            )),
            None => Err(anyhow::anyhow!(ErrorMetadata::exceeded_time_limit(
                "Operation timed out waiting for tenant migration blocker",
            ))),
        }
    }

    /// Cancel internal waits and break the completion promise if no terminal
    /// state was reached. External waiters observe `ShutDown`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let task = {
            let mut inner = self.inner.lock();
            let set_shutdown_outcome = !inner.completion_set;
            if set_shutdown_outcome {
                inner.completion_set = true;
            }
            let task = inner.majority_task.take();
            drop(inner);
            if set_shutdown_outcome {
                self.completion_tx
                    .send_replace(Some(MigrationOutcome::ShutDown));
            }
            task
        };
        self.notify_transition();
        // Dropping the handle aborts the majority-wait task.
        drop(task);
    }

    pub fn server_status(&self) -> Document {
        let inner = self.inner.lock();
        assert!(inner.commit_op_time.is_none() || inner.abort_op_time.is_none());
        let mut doc = Document::new();
        doc.insert(
            "state".to_owned(),
            serde_json::Value::from(inner.state.as_str()),
        );
        if let Some(ts) = inner.block_timestamp {
            doc.insert("blockTimestamp".to_owned(), ts.to_json());
        }
        if let Some(op_time) = inner.commit_op_time {
            doc.insert("commitOpTime".to_owned(), op_time.to_json());
        }
        if let Some(op_time) = inner.abort_op_time {
            doc.insert("abortOpTime".to_owned(), op_time.to_json());
        }
        doc
    }

    fn notify_transition(&self) {
        self.transition_tx.send_modify(|epoch| *epoch += 1);
    }
}
