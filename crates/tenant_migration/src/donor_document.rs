//! The donor state document is the small persisted record the migration
//! state machine writes as it advances; on startup the donor replays these
//! records to rebuild its access blockers.

use std::sync::Arc;

use anyhow::Context;
use common::types::{
    ClusterTime,
    OpTime,
    TenantId,
};
use runtime::Runtime;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    access_blocker::TenantMigrationAccessBlocker,
    registry::AccessBlockerRegistry,
    replication::MajorityCommitWaiter,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DonorState {
    DataSync,
    Blocking,
    Committed,
    Aborted,
}

impl DonorState {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonorStateDocument {
    pub tenant_id: TenantId,
    pub state: DonorState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_timestamp: Option<ClusterTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_or_abort_op_time: Option<OpTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    /// Epoch millis after which the record may be garbage collected. Only
    /// terminal-state records carry this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<u64>,
    pub recipient_connection_string: String,
}

/// Deserialize and enforce the well-formedness invariants of a donor state
/// document.
pub fn parse_donor_state_document(value: serde_json::Value) -> anyhow::Result<DonorStateDocument> {
    let doc: DonorStateDocument =
        serde_json::from_value(value).context("malformed donor state document")?;

    if doc.expire_at.is_some() {
        anyhow::ensure!(
            doc.state.is_terminal(),
            "donor state doc for {} contains expireAt but the migration has not committed or \
             aborted",
            doc.tenant_id,
        );
    }
    let well_formed = match doc.state {
        DonorState::DataSync => {
            doc.block_timestamp.is_none()
                && doc.commit_or_abort_op_time.is_none()
                && doc.abort_reason.is_none()
        },
        DonorState::Blocking => {
            doc.block_timestamp.is_some()
                && doc.commit_or_abort_op_time.is_none()
                && doc.abort_reason.is_none()
        },
        DonorState::Committed => {
            doc.block_timestamp.is_some()
                && doc.commit_or_abort_op_time.is_some()
                && doc.abort_reason.is_none()
        },
        DonorState::Aborted => doc.abort_reason.is_some(),
    };
    anyhow::ensure!(
        well_formed,
        "invalid donor state doc for tenant {} in state {:?}",
        doc.tenant_id,
        doc.state,
    );
    Ok(doc)
}

/// Rebuild the registry's blockers from persisted donor state documents.
///
/// Existing blockers are shut down first. Aborted migrations already marked
/// for garbage collection are skipped.
pub fn recover_access_blockers<RT: Runtime>(
    rt: &RT,
    registry: &AccessBlockerRegistry<RT>,
    waiter: Arc<dyn MajorityCommitWaiter>,
    docs: impl IntoIterator<Item = DonorStateDocument>,
) -> anyhow::Result<()> {
    registry.shutdown();

    for doc in docs {
        if doc.expire_at.is_some() && doc.state == DonorState::Aborted {
            continue;
        }
        let blocker = TenantMigrationAccessBlocker::new(
            rt.clone(),
            doc.tenant_id.clone(),
            doc.recipient_connection_string.clone(),
            waiter.clone(),
        );
        registry.add(blocker.clone())?;

        match doc.state {
            DonorState::DataSync => {},
            DonorState::Blocking => {
                let block_timestamp = doc
                    .block_timestamp
                    .context("blocking donor state doc missing blockTimestamp")?;
                blocker.start_blocking_writes();
                blocker.start_blocking_reads_after(block_timestamp);
            },
            DonorState::Committed => {
                let block_timestamp = doc
                    .block_timestamp
                    .context("committed donor state doc missing blockTimestamp")?;
                let op_time = doc
                    .commit_or_abort_op_time
                    .context("committed donor state doc missing commitOrAbortOpTime")?;
                blocker.start_blocking_writes();
                blocker.start_blocking_reads_after(block_timestamp);
                blocker.commit(op_time);
            },
            DonorState::Aborted => {
                let op_time = doc
                    .commit_or_abort_op_time
                    .context("aborted donor state doc missing commitOrAbortOpTime")?;
                if let Some(block_timestamp) = doc.block_timestamp {
                    blocker.start_blocking_writes();
                    blocker.start_blocking_reads_after(block_timestamp);
                }
                blocker.abort(op_time);
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use common::types::{
        ClusterTime,
        OpTime,
        TenantId,
    };
    use runtime::testing::TestRuntime;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::{
        parse_donor_state_document,
        recover_access_blockers,
        DonorState,
        DonorStateDocument,
    };
    use crate::{
        access_blocker::{
            BlockerState,
            MigrationOutcome,
        },
        registry::AccessBlockerRegistry,
        replication::MajorityCommitWaiter,
    };

    struct ImmediateWaiter;

    #[async_trait]
    impl MajorityCommitWaiter for ImmediateWaiter {
        async fn await_majority(
            &self,
            _op_time: OpTime,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn doc(state: DonorState) -> DonorStateDocument {
        let terminal = matches!(state, DonorState::Committed | DonorState::Aborted);
        DonorStateDocument {
            tenant_id: TenantId::from("acme"),
            state,
            block_timestamp: (!matches!(state, DonorState::DataSync))
                .then_some(ClusterTime::new(100, 0)),
            commit_or_abort_op_time: terminal.then_some(OpTime::new(ClusterTime::new(120, 0), 1)),
            abort_reason: matches!(state, DonorState::Aborted)
                .then(|| "caller aborted".to_owned()),
            expire_at: None,
            recipient_connection_string: "recipient-rs0/host1:27017".to_owned(),
        }
    }

    #[test]
    fn test_parse_rejects_expire_at_before_terminal_state() {
        let value = json!({
            "tenantId": "acme",
            "state": "blocking",
            "blockTimestamp": ClusterTime::new(100, 0).as_u64(),
            "expireAt": 1_700_000_000_000u64,
            "recipientConnectionString": "recipient-rs0/host1:27017",
        });
        assert!(parse_donor_state_document(value).is_err());
    }

    #[test]
    fn test_parse_enforces_per_state_fields() {
        // dataSync must not carry a block timestamp.
        let value = json!({
            "tenantId": "acme",
            "state": "dataSync",
            "blockTimestamp": ClusterTime::new(100, 0).as_u64(),
            "recipientConnectionString": "recipient-rs0/host1:27017",
        });
        assert!(parse_donor_state_document(value).is_err());

        // committed requires both the block timestamp and the op-time.
        let value = json!({
            "tenantId": "acme",
            "state": "committed",
            "blockTimestamp": ClusterTime::new(100, 0).as_u64(),
            "recipientConnectionString": "recipient-rs0/host1:27017",
        });
        assert!(parse_donor_state_document(value).is_err());

        // aborted requires an abort reason.
        let value = json!({
            "tenantId": "acme",
            "state": "aborted",
            "recipientConnectionString": "recipient-rs0/host1:27017",
        });
        assert!(parse_donor_state_document(value).is_err());

        let value = json!({
            "tenantId": "acme",
            "state": "blocking",
            "blockTimestamp": ClusterTime::new(100, 0).as_u64(),
            "recipientConnectionString": "recipient-rs0/host1:27017",
        });
        let parsed = parse_donor_state_document(value).unwrap();
        assert_eq!(parsed.state, DonorState::Blocking);
        assert_eq!(parsed.block_timestamp, Some(ClusterTime::new(100, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_replays_blocking_state() {
        let rt = TestRuntime::new();
        let registry = AccessBlockerRegistry::new();
        recover_access_blockers(&rt, &registry, Arc::new(ImmediateWaiter), [
            doc(DonorState::Blocking),
        ])
        .unwrap();

        let blocker = registry.for_db_name("acme_orders").unwrap();
        assert_eq!(blocker.state(), BlockerState::BlockWritesAndReads);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_replays_committed_migration() {
        let rt = TestRuntime::new();
        let registry = AccessBlockerRegistry::new();
        recover_access_blockers(&rt, &registry, Arc::new(ImmediateWaiter), [
            doc(DonorState::Committed),
        ])
        .unwrap();

        let blocker = registry.for_db_name("acme").unwrap();
        must_let::must_let!(let MigrationOutcome::Committed(info) = blocker.on_completion().await);
        assert_eq!(info.recipient_conn_string, "recipient-rs0/host1:27017");
        assert_eq!(blocker.state(), BlockerState::Reject);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_skips_garbage_collected_aborts() {
        let rt = TestRuntime::new();
        let registry = AccessBlockerRegistry::new();
        let mut aborted = doc(DonorState::Aborted);
        aborted.expire_at = Some(1_700_000_000_000);
        recover_access_blockers(&rt, &registry, Arc::new(ImmediateWaiter), [aborted]).unwrap();
        assert!(registry.for_db_name("acme").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_replays_aborted_migration() {
        let rt = TestRuntime::new();
        let registry = AccessBlockerRegistry::new();
        recover_access_blockers(&rt, &registry, Arc::new(ImmediateWaiter), [
            doc(DonorState::Aborted),
        ])
        .unwrap();

        let blocker = registry.for_db_name("acme").unwrap();
        assert_eq!(blocker.on_completion().await, MigrationOutcome::Aborted);
    }

    #[test]
    fn test_document_roundtrips_through_wire_form() {
        let document = doc(DonorState::Committed);
        let value = serde_json::to_value(&document).unwrap();
        assert_eq!(parse_donor_state_document(value).unwrap(), document);
    }
}
