//! Typed payloads attached to migration errors alongside their
//! `ErrorMetadata`, so callers can recover the redirect target or the
//! conflicting tenant from an `anyhow` chain.

use common::types::TenantId;
use errors::ErrorMetadata;

/// Attached to `TenantMigrationCommitted` errors; carries everything a
/// client needs to redirect to the new owner of the tenant.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("tenant {tenant_id} has been migrated to {recipient_conn_string}")]
pub struct TenantMigrationCommittedInfo {
    pub tenant_id: TenantId,
    pub recipient_conn_string: String,
}

impl TenantMigrationCommittedInfo {
    pub fn to_document(&self) -> common::Document {
        let mut doc = common::Document::new();
        doc.insert(
            "tenantId".to_owned(),
            serde_json::Value::from(self.tenant_id.as_str()),
        );
        doc.insert(
            "recipientConnString".to_owned(),
            serde_json::Value::from(self.recipient_conn_string.clone()),
        );
        doc
    }
}

/// Attached to the transient `TenantMigrationConflict` signal; the central
/// conflict handler uses the tenant id to find the blocker in the registry
/// and wait on it.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("operation conflicts with an in-progress migration of tenant {tenant_id}")]
pub struct TenantMigrationConflictInfo {
    pub tenant_id: TenantId,
}

pub(crate) fn committed_error(info: TenantMigrationCommittedInfo) -> anyhow::Error {
    anyhow::Error::new(info).context(ErrorMetadata::tenant_migration_committed(
        "Write or read must be re-routed to the new owner of this tenant",
    ))
}

pub(crate) fn conflict_error(tenant_id: TenantId) -> anyhow::Error {
    anyhow::Error::new(TenantMigrationConflictInfo { tenant_id }).context(
        ErrorMetadata::tenant_migration_conflict(
            "Write must block until this tenant migration commits or aborts",
        ),
    )
}
