//! Tenant-migration admission for transaction statements.
//!
//! Before the router frames a statement for a tenant database, the
//! statement passes the tenant's access blocker. Writes that hit the
//! blocking window wait for the migration to finish and are then retried
//! here (abort) or rejected with the redirect (commit); reads gate on the
//! block timestamp.

use std::time::Duration;

use common::types::{
    ClusterTime,
    ReadConcernLevel,
};
use errors::{
    ErrorCode,
    ErrorMetadataAnyhowExt,
};
use runtime::Runtime;
use tenant_migration::{
    check_can_read_or_block,
    check_can_write,
    check_linearizable_read,
    handle_migration_conflict,
    AccessBlockerRegistry,
};

#[derive(Clone, Copy, Debug)]
pub enum StatementKind {
    Read {
        /// The snapshot or after-cluster-time the read will use, when one
        /// has been chosen.
        read_timestamp: Option<ClusterTime>,
    },
    Write,
}

/// Gate one transaction statement on the tenant migration state of its
/// database. Returns once the statement may be dispatched; errors are
/// client-visible (`TenantMigrationCommitted` redirects,
/// `ExceededTimeLimit` on deadline).
pub async fn admit_statement<RT: Runtime>(
    rt: &RT,
    registry: &AccessBlockerRegistry<RT>,
    db_name: &str,
    kind: StatementKind,
    read_concern_level: Option<ReadConcernLevel>,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    check_linearizable_read(registry, db_name, read_concern_level)?;
    match kind {
        StatementKind::Read { read_timestamp } => {
            check_can_read_or_block(rt, registry, db_name, read_timestamp, timeout).await
        },
        StatementKind::Write => loop {
            match check_can_write(registry, db_name) {
                Ok(()) => return Ok(()),
                Err(err) if err.error_code() == Some(ErrorCode::TenantMigrationConflict) => {
                    // Wait out the migration; an abort admits the retry,
                    // a commit surfaces the redirect error here.
                    handle_migration_conflict(registry, err, timeout).await?;
                },
                Err(err) => return Err(err),
            }
        },
    }
}
