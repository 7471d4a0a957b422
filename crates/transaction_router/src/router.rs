//! The per-session transaction router.
//!
//! A router turns a client's multi-statement transaction into a coordinated
//! protocol across shards: it picks the snapshot timestamp, frames outbound
//! statements, classifies participants as they respond, retries on snapshot
//! and routing-stale errors while that is still safe, and drives one of five
//! commit paths (plus recovery) when the client commits.
//!
//! Routers are checked out per session (see [`crate::session`]) so no
//! internal locking is needed: the checkout is the lock.

use std::{
    collections::HashMap,
    sync::{
        atomic::Ordering,
        Arc,
    },
};

use common::{
    knobs::SLOW_TRANSACTION_THRESHOLD,
    remote::{
        run_idempotent,
        RemoteCommandExecutor,
        ADMIN_DB,
    },
    types::{
        LogicalClock,
        ReadConcern,
        SessionId,
        ShardId,
        StmtId,
        TxnNumber,
        WriteConcern,
    },
    CommandResponse,
    Document,
};
use errors::{
    ErrorCode,
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use futures::future::join_all;
use runtime::Runtime;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    commit::{
        decide_commit_type,
        CommitType,
    },
    metrics::RouterMetrics,
    participant::{
        Participant,
        ReadOnly,
        SharedOptions,
    },
    recovery_token::RecoveryToken,
};

/// What the client asked this statement to do to the transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionAction {
    Start,
    Continue,
    Commit,
}

/// Commands that write. Statement-level retry on routing-stale errors is
/// only safe for these on the first statement.
const WRITE_COMMANDS: &[&str] = &["insert", "update", "delete", "findAndModify"];

fn is_write_command(command_name: &str) -> bool {
    WRITE_COMMANDS.contains(&command_name)
}

/// The snapshot timestamp, remembering which statement selected it. It may
/// move forward while that statement is still the current one (e.g. across a
/// snapshot-error retry); once a later statement runs it is frozen.
#[derive(Clone, Copy, Debug)]
struct AtClusterTime {
    time: common::types::ClusterTime,
    chosen_at: StmtId,
}

impl AtClusterTime {
    fn can_change(&self, current_stmt_id: StmtId) -> bool {
        self.chosen_at == current_stmt_id
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TerminationCause {
    Committed,
    Aborted,
}

impl TerminationCause {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }
}

struct TimingStats {
    start: tokio::time::Instant,
    commit_start: Option<tokio::time::Instant>,
    /// Wall-clock moment commit began, for the slow-transaction line.
    commit_start_wall: Option<std::time::SystemTime>,
    end: Option<tokio::time::Instant>,
    slow_logged: bool,
}

enum CommitOutcome {
    Committed,
    Failed,
    /// The commit may or may not have applied; the client retries commit.
    Unknown,
}

pub struct TransactionRouter<RT: Runtime> {
    rt: RT,
    session_id: SessionId,
    executor: Arc<dyn RemoteCommandExecutor>,
    clock: Arc<LogicalClock>,
    metrics: Arc<RouterMetrics>,
    cancel: CancellationToken,

    txn_number: Option<TxnNumber>,
    /// Whether the active transaction was started on this router (as
    /// opposed to materialized by a commit statement for recovery).
    started_here: bool,
    latest_stmt_id: StmtId,
    participants: HashMap<ShardId, Participant>,
    coordinator_id: Option<ShardId>,
    recovery_shard_id: Option<ShardId>,
    read_concern: ReadConcern,
    at_cluster_time: Option<AtClusterTime>,
    write_concern: Option<WriteConcern>,
    commit_type: Option<CommitType>,
    termination_initiated: bool,
    participants_credited_at_commit: bool,
    timing: Option<TimingStats>,
}

impl<RT: Runtime> TransactionRouter<RT> {
    pub fn new(
        rt: RT,
        session_id: SessionId,
        executor: Arc<dyn RemoteCommandExecutor>,
        clock: Arc<LogicalClock>,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            rt,
            session_id,
            executor,
            clock,
            metrics,
            cancel: CancellationToken::new(),
            txn_number: None,
            started_here: false,
            latest_stmt_id: StmtId::FIRST,
            participants: HashMap::new(),
            coordinator_id: None,
            recovery_shard_id: None,
            read_concern: ReadConcern::default(),
            at_cluster_time: None,
            write_concern: None,
            commit_type: None,
            termination_initiated: false,
            participants_credited_at_commit: false,
            timing: None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn txn_number(&self) -> Option<TxnNumber> {
        self.txn_number
    }

    pub fn latest_stmt_id(&self) -> StmtId {
        self.latest_stmt_id
    }

    pub fn participant(&self, shard_id: &ShardId) -> Option<&Participant> {
        self.participants.get(shard_id)
    }

    pub fn coordinator_id(&self) -> Option<&ShardId> {
        self.coordinator_id.as_ref()
    }

    pub fn recovery_shard_id(&self) -> Option<&ShardId> {
        self.recovery_shard_id.as_ref()
    }

    pub fn commit_type(&self) -> Option<CommitType> {
        self.commit_type
    }

    pub fn at_cluster_time(&self) -> Option<common::types::ClusterTime> {
        self.at_cluster_time.map(|at| at.time)
    }

    /// Write concern the client attached to its commit/abort request;
    /// forwarded onto the remote commit and abort bodies.
    pub fn set_write_concern(&mut self, write_concern: Option<WriteConcern>) {
        self.write_concern = write_concern;
    }

    /// Cancellation source for this session's remote work; a client
    /// interrupt cancels it.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn begin_or_continue(
        &mut self,
        txn_number: TxnNumber,
        action: TransactionAction,
        read_concern: Option<ReadConcern>,
    ) -> anyhow::Result<()> {
        match action {
            TransactionAction::Start => {
                if let Some(current) = self.txn_number {
                    anyhow::ensure!(
                        txn_number != current,
                        ErrorMetadata::bad_request(
                            "TransactionAlreadyStarted",
                            format!(
                                "txnNumber {txn_number} for session {} was already started",
                                self.session_id,
                            ),
                        )
                    );
                    anyhow::ensure!(
                        txn_number > current,
                        ErrorMetadata::bad_request(
                            "TransactionTooOld",
                            format!(
                                "txnNumber {txn_number} is less than last txnNumber {current} \
                                 seen in session {}",
                                self.session_id,
                            ),
                        )
                    );
                }
                let read_concern = read_concern.unwrap_or_default();
                if let Some(level) = read_concern.level {
                    anyhow::ensure!(
                        level.supported_in_transaction(),
                        ErrorMetadata::bad_request(
                            "InvalidOptions",
                            format!(
                                "read concern level {} is not supported in transactions",
                                level.as_str(),
                            ),
                        )
                    );
                }
                self.reset_transaction_state(txn_number, read_concern, true);
            },
            TransactionAction::Continue => {
                match self.txn_number {
                    Some(current) if txn_number == current => {},
                    Some(current) if txn_number < current => {
                        anyhow::bail!(ErrorMetadata::bad_request(
                            "TransactionTooOld",
                            format!(
                                "txnNumber {txn_number} is less than last txnNumber {current} \
                                 seen in session {}",
                                self.session_id,
                            ),
                        ));
                    },
                    _ => {
                        anyhow::bail!(ErrorMetadata::no_such_transaction(format!(
                            "cannot continue txnNumber {txn_number} in session {}: transaction \
                             was not started",
                            self.session_id,
                        )));
                    },
                }
                if let Some(supplied) = read_concern {
                    anyhow::ensure!(
                        supplied == self.read_concern,
                        ErrorMetadata::bad_request(
                            "InvalidOptions",
                            "only the first command in a transaction may specify a readConcern",
                        )
                    );
                }
                self.latest_stmt_id = self.latest_stmt_id.next();
            },
            TransactionAction::Commit => match self.txn_number {
                Some(current) if txn_number == current => {},
                Some(current) if txn_number < current => {
                    anyhow::bail!(ErrorMetadata::bad_request(
                        "TransactionTooOld",
                        format!(
                            "txnNumber {txn_number} is less than last txnNumber {current} seen \
                             in session {}",
                            self.session_id,
                        ),
                    ));
                },
                // Commit of a transaction this router has never seen: set up
                // empty state and expect a recovery token.
                _ => self.reset_transaction_state(txn_number, ReadConcern::default(), false),
            },
        }
        Ok(())
    }

    fn reset_transaction_state(
        &mut self,
        txn_number: TxnNumber,
        read_concern: ReadConcern,
        started_here: bool,
    ) {
        self.txn_number = Some(txn_number);
        self.started_here = started_here;
        self.latest_stmt_id = StmtId::FIRST;
        self.participants.clear();
        self.coordinator_id = None;
        self.recovery_shard_id = None;
        self.read_concern = read_concern;
        self.at_cluster_time = None;
        self.write_concern = None;
        self.commit_type = None;
        self.termination_initiated = false;
        self.participants_credited_at_commit = false;
        self.timing = Some(TimingStats {
            start: self.rt.monotonic_now(),
            commit_start: None,
            commit_start_wall: None,
            end: None,
            slow_logged: false,
        });
        self.metrics.total_started.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            session = %self.session_id,
            txn = %txn_number,
            started_here,
            "New transaction on session"
        );
    }

    /// For snapshot transactions, select (or, while the selecting statement
    /// is still current, re-select) the snapshot timestamp from the cluster
    /// clock. No-op at other read concern levels and once a later statement
    /// has run.
    pub fn set_default_at_cluster_time(&mut self) {
        if !self.read_concern.is_snapshot() {
            return;
        }
        let mut candidate = self.clock.now();
        if let Some(after) = self.read_concern.after_cluster_time {
            candidate = candidate.max(after);
        }
        match &mut self.at_cluster_time {
            None => {
                self.at_cluster_time = Some(AtClusterTime {
                    time: candidate,
                    chosen_at: self.latest_stmt_id,
                });
            },
            Some(at) if at.can_change(self.latest_stmt_id) => {
                at.time = candidate;
            },
            Some(_) => {},
        }
    }

    /// Frame an outbound statement for `shard_id`, creating the participant
    /// on first contact.
    ///
    /// Panics on protocol violations: a `txnNumber` already on the body that
    /// disagrees with the active transaction, or a `readConcern` already on
    /// the body whose level disagrees with the transaction's.
    pub fn attach_txn_fields_if_needed(
        &mut self,
        shard_id: &ShardId,
        cmd: &Document,
    ) -> Document {
        let txn_number = self
            .txn_number
            .expect("attaching transaction fields outside an active transaction");
        self.metrics
            .total_requests_targeted
            .fetch_add(1, Ordering::Relaxed);

        let is_first_contact = !self.participants.contains_key(shard_id);
        if is_first_contact {
            let is_coordinator = self.participants.is_empty();
            if is_coordinator {
                self.coordinator_id = Some(shard_id.clone());
            }
            let shared_options = SharedOptions {
                read_concern: self.read_concern.clone(),
                at_cluster_time: self.at_cluster_time.map(|at| at.time),
            };
            self.participants.insert(
                shard_id.clone(),
                Participant::new(is_coordinator, self.latest_stmt_id, shared_options),
            );
            self.metrics
                .total_contacted_participants
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                session = %self.session_id,
                txn = %txn_number,
                shard = %shard_id,
                is_coordinator,
                "Adding participant to transaction"
            );
        }
        let participant = &self.participants[shard_id];

        let mut augmented = cmd.clone();
        if is_first_contact {
            if let Some(existing) = augmented.get("readConcern") {
                let existing = existing
                    .as_object()
                    .expect("readConcern on a command must be an object");
                let supplied = ReadConcern::from_document(existing)
                    .expect("malformed readConcern on a transaction statement");
                assert_eq!(
                    supplied.level, participant.shared_options.read_concern.level,
                    "statement readConcern level disagrees with the transaction's",
                );
            }
            if let Some(read_concern) = participant
                .shared_options
                .read_concern
                .to_document(participant.shared_options.at_cluster_time)
            {
                augmented.insert("readConcern".to_owned(), Value::Object(read_concern));
            }
            augmented.insert("startTransaction".to_owned(), Value::Bool(true));
        }
        if participant.is_coordinator {
            augmented.insert("coordinator".to_owned(), Value::Bool(true));
        }
        augmented.insert("autocommit".to_owned(), Value::Bool(false));
        match augmented.get("txnNumber") {
            Some(existing) => {
                assert_eq!(
                    existing.as_u64(),
                    Some(txn_number.0),
                    "statement txnNumber disagrees with the active transaction",
                );
            },
            None => {
                augmented.insert("txnNumber".to_owned(), Value::from(txn_number.0));
            },
        }
        augmented
    }

    /// Fold a participant's statement response into its classification.
    ///
    /// Skipped once commit or abort began. Non-ok responses leave the
    /// classification untouched. A read-only regression
    /// (`readOnly: true` after a write) is a participant protocol violation
    /// and panics; an ok response with no `readOnly` field is an error.
    pub fn process_participant_response(
        &mut self,
        shard_id: &ShardId,
        response: &CommandResponse,
    ) -> anyhow::Result<()> {
        if self.termination_initiated {
            return Ok(());
        }
        let participant = self
            .participants
            .get_mut(shard_id)
            .unwrap_or_else(|| panic!("response from unknown participant {shard_id}"));
        if !response.is_ok() {
            return Ok(());
        }
        let Some(read_only) = response.read_only() else {
            anyhow::bail!(
                "participant {shard_id} returned an ok response without a readOnly field",
            );
        };
        if read_only {
            match participant.read_only {
                ReadOnly::Unset => {
                    participant.read_only = ReadOnly::ReadOnly;
                    tracing::debug!(
                        session = %self.session_id,
                        shard = %shard_id,
                        "Marking participant as read-only"
                    );
                },
                ReadOnly::ReadOnly => {},
                ReadOnly::NotReadOnly => {
                    panic!("participant {shard_id} claimed to be read-only after a write")
                },
            }
        } else {
            if participant.read_only != ReadOnly::NotReadOnly {
                participant.read_only = ReadOnly::NotReadOnly;
                tracing::debug!(
                    session = %self.session_id,
                    shard = %shard_id,
                    "Marking participant as having done a write"
                );
            }
            if self.recovery_shard_id.is_none() {
                self.recovery_shard_id = Some(shard_id.clone());
            }
        }
        Ok(())
    }

    /// Snapshot errors may only be retried while the whole transaction is
    /// still its first statement.
    pub fn can_continue_on_snapshot_error(&self) -> bool {
        self.latest_stmt_id == StmtId::FIRST
    }

    /// Routing-stale errors may be retried for any command on the first
    /// statement, and for non-write commands afterwards.
    pub fn can_continue_on_stale_shard_or_db_error(&self, command_name: &str) -> bool {
        self.latest_stmt_id == StmtId::FIRST || !is_write_command(command_name)
    }

    /// Restart the attempt after a snapshot error: abort and drop every
    /// participant so a later snapshot timestamp may be selected.
    pub async fn on_snapshot_error(&mut self, status: &anyhow::Error) {
        assert!(
            self.can_continue_on_snapshot_error(),
            "snapshot error past the first statement is not retryable",
        );
        tracing::debug!(
            session = %self.session_id,
            error = %status,
            "Clearing transaction state after snapshot error"
        );
        let shards = self.sorted_shard_ids(|_| true);
        self.abort_participants_for_retry(&shards).await;
        self.participants.clear();
        self.coordinator_id = None;
        self.recovery_shard_id = None;
    }

    /// Evict participants created by the current statement after a
    /// routing-stale error so the retry can re-target them.
    pub async fn on_stale_shard_or_db_error(
        &mut self,
        command_name: &str,
        status: &anyhow::Error,
    ) {
        assert!(
            self.can_continue_on_stale_shard_or_db_error(command_name),
            "stale routing error on a write past the first statement is not retryable",
        );
        tracing::debug!(
            session = %self.session_id,
            command = command_name,
            error = %status,
            "Clearing pending participants after stale version error"
        );
        self.clear_pending_participants().await;
    }

    /// A view resolution error re-plans the statement; evict what it
    /// targeted so far. Always allowed.
    pub async fn on_view_resolution_error(&mut self, namespace: &str) {
        tracing::debug!(
            session = %self.session_id,
            namespace,
            "Clearing pending participants after view resolution error"
        );
        self.clear_pending_participants().await;
    }

    async fn clear_pending_participants(&mut self) {
        let latest_stmt_id = self.latest_stmt_id;
        let pending = self.sorted_shard_ids(|p| p.stmt_id_created_at == latest_stmt_id);
        self.abort_participants_for_retry(&pending).await;
        for shard_id in &pending {
            self.participants.remove(shard_id);
        }
        if let Some(recovery_shard_id) = &self.recovery_shard_id {
            if pending.contains(recovery_shard_id) {
                self.recovery_shard_id = None;
            }
        }
        // The coordinator is always the first participant, so it can only
        // have been evicted if nothing remains.
        if self.participants.is_empty() {
            self.coordinator_id = None;
        }
    }

    /// Best-effort abort used between retry attempts: idempotent transport
    /// retry, and a NoSuchTransaction reply counts as success.
    async fn abort_participants_for_retry(&self, shard_ids: &[ShardId]) {
        if shard_ids.is_empty() {
            return;
        }
        let body = self.abort_body(false);
        let aborts = shard_ids.iter().map(|shard_id| {
            let body = body.clone();
            let executor = self.executor.clone();
            let cancel = self.cancel.clone();
            async move {
                match run_idempotent(executor.as_ref(), shard_id, ADMIN_DB, body, &cancel).await {
                    Ok(response)
                        if response.is_ok()
                            || response.error_code() == Some(ErrorCode::NoSuchTransaction) => {},
                    Ok(response) => {
                        tracing::debug!(
                            shard = %shard_id,
                            code = ?response.error_code(),
                            "Ignoring abort failure between transaction retries"
                        );
                    },
                    Err(e) => {
                        tracing::debug!(
                            shard = %shard_id,
                            error = %e,
                            "Ignoring abort transport failure between transaction retries"
                        );
                    },
                }
            }
        });
        self.metrics
            .total_requests_targeted
            .fetch_add(shard_ids.len() as u64, Ordering::Relaxed);
        join_all(aborts).await;
    }

    /// Explicit client abort. Requires at least one participant.
    pub async fn abort_transaction(&mut self) -> anyhow::Result<CommandResponse> {
        anyhow::ensure!(
            self.txn_number.is_some() && !self.participants.is_empty(),
            ErrorMetadata::no_such_transaction("no known command has been sent by this session"),
        );
        self.termination_initiated = true;

        let shard_ids = self.sorted_shard_ids(|_| true);
        let body = self.abort_body(true);
        let aborts = shard_ids.iter().map(|shard_id| {
            let body = body.clone();
            let executor = self.executor.clone();
            let cancel = self.cancel.clone();
            async move { run_idempotent(executor.as_ref(), shard_id, ADMIN_DB, body, &cancel).await }
        });
        self.metrics
            .total_requests_targeted
            .fetch_add(shard_ids.len() as u64, Ordering::Relaxed);
        let results = join_all(aborts).await;

        self.metrics.total_aborted.fetch_add(1, Ordering::Relaxed);
        self.finish_transaction(TerminationCause::Aborted);
        aggregate_abort_results(results)
    }

    /// Best-effort abort on failure paths; never errors.
    pub async fn implicitly_abort_transaction(&mut self, status: &anyhow::Error) {
        if self.txn_number.is_none() || self.termination_initiated {
            return;
        }
        self.termination_initiated = true;
        tracing::debug!(
            session = %self.session_id,
            error = %status,
            "Implicitly aborting transaction"
        );

        let shard_ids = self.sorted_shard_ids(|_| true);
        if !shard_ids.is_empty() {
            let body = self.abort_body(true);
            let aborts = shard_ids.iter().map(|shard_id| {
                let body = body.clone();
                let executor = self.executor.clone();
                let cancel = self.cancel.clone();
                async move {
                    if let Err(e) =
                        run_idempotent(executor.as_ref(), shard_id, ADMIN_DB, body, &cancel).await
                    {
                        tracing::debug!(
                            shard = %shard_id,
                            error = %e,
                            "Ignoring implicit abort failure"
                        );
                    }
                }
            });
            self.metrics
                .total_requests_targeted
                .fetch_add(shard_ids.len() as u64, Ordering::Relaxed);
            join_all(aborts).await;
        }
        self.metrics.total_aborted.fetch_add(1, Ordering::Relaxed);
        self.finish_transaction(TerminationCause::Aborted);
    }

    /// Commit the transaction, choosing the commit path from the observed
    /// participant classifications (or re-running the recorded path on a
    /// retry after an unknown result).
    pub async fn commit_transaction(
        &mut self,
        recovery_token: Option<&RecoveryToken>,
    ) -> anyhow::Result<CommandResponse> {
        anyhow::ensure!(
            self.txn_number.is_some(),
            ErrorMetadata::no_such_transaction("no transaction to commit on this session"),
        );

        let commit_type = match self.commit_type {
            Some(existing) => existing,
            None => self.decide_commit_path(recovery_token)?,
        };
        self.commit_type = Some(commit_type);
        self.termination_initiated = true;
        let timing = self.timing.as_mut().expect("transaction without timing stats");
        if timing.commit_start.is_none() {
            timing.commit_start = Some(self.rt.monotonic_now());
            timing.commit_start_wall = Some(self.rt.system_time());
        }
        if !self.participants_credited_at_commit && commit_type != CommitType::RecoverWithToken {
            // Credited once, even if this commit ends up retried.
            self.metrics
                .total_participants_at_commit
                .fetch_add(self.participants.len() as u64, Ordering::Relaxed);
            self.participants_credited_at_commit = true;
        }
        self.metrics.note_commit_initiated(commit_type);
        tracing::debug!(
            session = %self.session_id,
            txn = %self.txn_number.expect("checked above"),
            commit_type = commit_type.as_str(),
            participants = self.participants.len(),
            "Committing transaction"
        );

        let result = self.run_commit(commit_type, recovery_token).await;
        self.observe_commit_result(commit_type, &result);
        result
    }

    fn decide_commit_path(
        &self,
        recovery_token: Option<&RecoveryToken>,
    ) -> anyhow::Result<CommitType> {
        if self.participants.is_empty() {
            if self.started_here {
                return Ok(CommitType::NoShards);
            }
            anyhow::ensure!(
                recovery_token.is_some(),
                ErrorMetadata::no_such_transaction(
                    "cannot commit: no participants and no recovery token",
                ),
            );
            return Ok(CommitType::RecoverWithToken);
        }
        for (shard_id, participant) in &self.participants {
            anyhow::ensure!(
                participant.read_only != ReadOnly::Unset,
                ErrorMetadata::no_such_transaction(format!(
                    "failed to commit: a previous statement on participant {shard_id} was \
                     unsuccessful",
                )),
            );
        }
        Ok(decide_commit_type(self.participants.values()))
    }

    async fn run_commit(
        &self,
        commit_type: CommitType,
        recovery_token: Option<&RecoveryToken>,
    ) -> anyhow::Result<CommandResponse> {
        match commit_type {
            CommitType::NoShards => Ok(CommandResponse::ok()),
            CommitType::SingleShard => {
                let shard_id = self
                    .sorted_shard_ids(|_| true)
                    .pop()
                    .expect("single-shard commit without a participant");
                self.send_commit(&shard_id).await
            },
            CommitType::ReadOnly => {
                let shard_ids = self.sorted_shard_ids(|_| true);
                self.send_commits_in_parallel(&shard_ids).await
            },
            CommitType::SingleWriteShard => {
                let read_only_shards = self.sorted_shard_ids(|p| p.read_only == ReadOnly::ReadOnly);
                let write_shard = self
                    .sorted_shard_ids(|p| p.read_only == ReadOnly::NotReadOnly)
                    .pop()
                    .expect("single-write-shard commit without a write participant");
                // Readers first: only once every read-only shard has
                // committed is the write shard's outcome the transaction's.
                let readers_response = self.send_commits_in_parallel(&read_only_shards).await?;
                if !readers_response.is_ok() {
                    return Ok(readers_response);
                }
                self.send_commit(&write_shard).await
            },
            CommitType::TwoPhaseCommit => {
                let coordinator = self
                    .coordinator_id
                    .clone()
                    .expect("two-phase commit without a coordinator");
                let participants = self.sorted_shard_ids(|_| true);
                self.send_coordinate_commit(&coordinator, &participants).await
            },
            CommitType::RecoverWithToken => {
                let Some(token) = recovery_token else {
                    anyhow::bail!(ErrorMetadata::no_such_transaction(
                        "recovery commit retried without a recovery token",
                    ));
                };
                let shard_id = token.recovery_shard_id.clone().ok_or_else(|| {
                    anyhow::anyhow!(ErrorMetadata::no_such_transaction(
                        "recovery token does not name a recovery shard",
                    ))
                })?;
                self.send_coordinate_commit(&shard_id, &[]).await
            },
        }
    }

    async fn send_commit(&self, shard_id: &ShardId) -> anyhow::Result<CommandResponse> {
        self.metrics
            .total_requests_targeted
            .fetch_add(1, Ordering::Relaxed);
        run_idempotent(
            self.executor.as_ref(),
            shard_id,
            ADMIN_DB,
            self.commit_body(shard_id),
            &self.cancel,
        )
        .await
    }

    /// Commit several read-only participants concurrently. The first
    /// transport error or failed response wins; otherwise the first
    /// response (in shard order) is returned.
    async fn send_commits_in_parallel(
        &self,
        shard_ids: &[ShardId],
    ) -> anyhow::Result<CommandResponse> {
        let commits = shard_ids.iter().map(|shard_id| {
            let body = self.commit_body(shard_id);
            let executor = self.executor.clone();
            let cancel = self.cancel.clone();
            async move { run_idempotent(executor.as_ref(), shard_id, ADMIN_DB, body, &cancel).await }
        });
        self.metrics
            .total_requests_targeted
            .fetch_add(shard_ids.len() as u64, Ordering::Relaxed);
        let results = join_all(commits).await;

        let mut first_ok = None;
        for result in results {
            let response = result?;
            if !response.is_ok() {
                return Ok(response);
            }
            if first_ok.is_none() {
                first_ok = Some(response);
            }
        }
        Ok(first_ok.unwrap_or_else(CommandResponse::ok))
    }

    async fn send_coordinate_commit(
        &self,
        shard_id: &ShardId,
        participants: &[ShardId],
    ) -> anyhow::Result<CommandResponse> {
        let mut body = Document::new();
        body.insert("coordinateCommitTransaction".to_owned(), Value::from(1));
        body.insert(
            "participants".to_owned(),
            Value::Array(
                participants
                    .iter()
                    .map(|shard_id| {
                        serde_json::json!({ "shardId": shard_id.as_str() })
                    })
                    .collect(),
            ),
        );
        self.attach_session_fields(&mut body, true);
        self.metrics
            .total_requests_targeted
            .fetch_add(1, Ordering::Relaxed);
        run_idempotent(self.executor.as_ref(), shard_id, ADMIN_DB, body, &self.cancel).await
    }

    fn observe_commit_result(
        &mut self,
        commit_type: CommitType,
        result: &anyhow::Result<CommandResponse>,
    ) {
        let outcome = match result {
            Ok(response) if response.is_ok() => {
                if response.write_concern_error().is_some() {
                    CommitOutcome::Unknown
                } else {
                    CommitOutcome::Committed
                }
            },
            Ok(response) => match response.error_code() {
                Some(code) if code.is_unknown_commit_result() => CommitOutcome::Unknown,
                _ => CommitOutcome::Failed,
            },
            Err(e) => {
                if e.is_unknown_commit_result() {
                    CommitOutcome::Unknown
                } else {
                    CommitOutcome::Failed
                }
            },
        };
        match outcome {
            CommitOutcome::Committed => {
                let now = self.rt.monotonic_now();
                let timing = self.timing.as_ref().expect("transaction without timing stats");
                let commit_duration =
                    now - timing.commit_start.expect("commit success without commit start");
                self.metrics
                    .note_commit_successful(commit_type, commit_duration);
                self.finish_transaction(TerminationCause::Committed);
            },
            CommitOutcome::Failed => {
                self.metrics.total_aborted.fetch_add(1, Ordering::Relaxed);
                self.finish_transaction(TerminationCause::Aborted);
            },
            // The client may retry the commit; keep the transaction's
            // timing open and defer metrics and the slow log to the attempt
            // that resolves the outcome.
            CommitOutcome::Unknown => {},
        }
    }

    /// The recovery token to hand back to the client on a successful
    /// commit.
    pub fn recovery_token(&self) -> RecoveryToken {
        RecoveryToken::new(self.recovery_shard_id.clone())
    }

    #[cfg(test)]
    pub(crate) fn slow_log_emitted(&self) -> bool {
        self.timing.as_ref().is_some_and(|timing| timing.slow_logged)
    }

    fn finish_transaction(&mut self, cause: TerminationCause) {
        let now = self.rt.monotonic_now();
        let Some(timing) = self.timing.as_mut() else {
            return;
        };
        if timing.end.is_none() {
            timing.end = Some(now);
        }
        let duration = timing.end.expect("just set") - timing.start;
        if timing.slow_logged || duration < *SLOW_TRANSACTION_THRESHOLD {
            return;
        }
        timing.slow_logged = true;
        let commit_duration_micros = timing
            .commit_start
            .map(|commit_start| (timing.end.expect("just set") - commit_start).as_micros() as u64);
        tracing::info!(
            session = %self.session_id,
            txn = self.txn_number.map(|t| t.0),
            duration_ms = duration.as_millis() as u64,
            commit_type = self.commit_type.as_ref().map(CommitType::as_str),
            commit_started_at = ?timing.commit_start_wall,
            commit_duration_micros,
            participants = self.participants.len(),
            read_concern = self.read_concern.level.map(|l| l.as_str()).unwrap_or("none"),
            termination_cause = cause.as_str(),
            "Slow transaction"
        );
    }

    fn sorted_shard_ids(&self, mut filter: impl FnMut(&Participant) -> bool) -> Vec<ShardId> {
        let mut shard_ids = self
            .participants
            .iter()
            .filter(|(_, participant)| filter(participant))
            .map(|(shard_id, _)| shard_id.clone())
            .collect::<Vec<_>>();
        shard_ids.sort();
        shard_ids
    }

    fn commit_body(&self, shard_id: &ShardId) -> Document {
        let mut body = Document::new();
        body.insert("commitTransaction".to_owned(), Value::from(1));
        let is_coordinator = self
            .participants
            .get(shard_id)
            .is_some_and(|p| p.is_coordinator);
        self.attach_session_fields(&mut body, is_coordinator);
        body
    }

    fn abort_body(&self, with_write_concern: bool) -> Document {
        let mut body = Document::new();
        body.insert("abortTransaction".to_owned(), Value::from(1));
        let txn_number = self
            .txn_number
            .expect("aborting outside an active transaction");
        body.insert("txnNumber".to_owned(), Value::from(txn_number.0));
        body.insert("autocommit".to_owned(), Value::Bool(false));
        if with_write_concern {
            if let Some(write_concern) = &self.write_concern {
                body.insert(
                    "writeConcern".to_owned(),
                    Value::Object(write_concern.to_document()),
                );
            }
        }
        body
    }

    fn attach_session_fields(&self, body: &mut Document, coordinator: bool) {
        let txn_number = self
            .txn_number
            .expect("framing a command outside an active transaction");
        if coordinator {
            body.insert("coordinator".to_owned(), Value::Bool(true));
        }
        body.insert("autocommit".to_owned(), Value::Bool(false));
        body.insert("txnNumber".to_owned(), Value::from(txn_number.0));
        if let Some(write_concern) = &self.write_concern {
            body.insert(
                "writeConcern".to_owned(),
                Value::Object(write_concern.to_document()),
            );
        }
    }
}

/// Abort response aggregation: a transport error is surfaced unchanged; if
/// every command-level response is ok, the first is returned; otherwise the
/// first non-NoSuchTransaction failure wins, falling back to the
/// NoSuchTransaction reply.
fn aggregate_abort_results(
    results: Vec<anyhow::Result<CommandResponse>>,
) -> anyhow::Result<CommandResponse> {
    let mut responses = Vec::with_capacity(results.len());
    for result in results {
        responses.push(result?);
    }
    let mut first_no_such_transaction = None;
    for response in &responses {
        if response.is_ok() {
            continue;
        }
        if response.error_code() == Some(ErrorCode::NoSuchTransaction) {
            if first_no_such_transaction.is_none() {
                first_no_such_transaction = Some(response.clone());
            }
        } else {
            return Ok(response.clone());
        }
    }
    if let Some(response) = first_no_such_transaction {
        return Ok(response);
    }
    Ok(responses
        .into_iter()
        .next()
        .unwrap_or_else(CommandResponse::ok))
}
