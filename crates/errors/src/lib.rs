//! Error classification for the routing tier.
//!
//! Errors travel as `anyhow::Error` chains; an [`ErrorMetadata`] object is
//! attached via `.context(..)` wherever an error needs to be classified.
//! Downstream code recovers the classification with
//! [`ErrorMetadataAnyhowExt`] without caring how deep in the chain the
//! metadata sits.

use std::borrow::Cow;

mod metrics;

/// ErrorMetadata can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It tags an error with the code used for
/// routing-level decisions (retry, redirect, abort) and for the wire form of
/// command responses.
///
/// The `msg` is the developer-facing description. The `short_msg` is a
/// ScreamingCamelCase tag that is stable across copy edits, usable in tests
/// and metrics.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// Short ScreamingCamelCase tag, e.g. `NoSuchTransaction`.
    pub short_msg: Cow<'static, str>,
    /// Human readable, developer facing description.
    pub msg: Cow<'static, str>,
}

/// Stable error codes with their wire integers. The integers appear in
/// command response bodies as `{"ok": 0, "code": <i32>}`.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    BadRequest = 2,
    HostUnreachable = 6,
    ExceededTimeLimit = 50,
    StaleShardVersion = 63,
    WriteConcernFailed = 64,
    ShardNotFound = 70,
    ShutdownInProgress = 91,
    UnsatisfiableWriteConcern = 100,
    SnapshotTooOld = 239,
    SnapshotUnavailable = 246,
    StaleDbVersion = 249,
    NoSuchTransaction = 251,
    TenantMigrationConflict = 313,
    TenantMigrationCommitted = 314,
    TenantMigrationAborted = 325,
    InterruptedDueToReplStateChange = 11602,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        let code = match code {
            2 => Self::BadRequest,
            6 => Self::HostUnreachable,
            50 => Self::ExceededTimeLimit,
            63 => Self::StaleShardVersion,
            64 => Self::WriteConcernFailed,
            70 => Self::ShardNotFound,
            91 => Self::ShutdownInProgress,
            100 => Self::UnsatisfiableWriteConcern,
            239 => Self::SnapshotTooOld,
            246 => Self::SnapshotUnavailable,
            249 => Self::StaleDbVersion,
            251 => Self::NoSuchTransaction,
            313 => Self::TenantMigrationConflict,
            314 => Self::TenantMigrationCommitted,
            325 => Self::TenantMigrationAborted,
            11602 => Self::InterruptedDueToReplStateChange,
            _ => return None,
        };
        Some(code)
    }

    /// Snapshot errors: the chosen read timestamp cannot be served. The
    /// router may retry the transaction at a later timestamp while still on
    /// its first statement.
    pub fn is_snapshot_error(self) -> bool {
        matches!(self, Self::SnapshotTooOld | Self::SnapshotUnavailable)
    }

    /// Routing-stale errors: the router targeted a shard based on stale
    /// placement information.
    pub fn is_stale_routing(self) -> bool {
        matches!(self, Self::StaleShardVersion | Self::StaleDbVersion)
    }

    /// Errors a remote command may return transiently; idempotent operations
    /// are retried on these.
    pub fn is_retryable_remote(self) -> bool {
        matches!(
            self,
            Self::HostUnreachable | Self::ShutdownInProgress | Self::InterruptedDueToReplStateChange
        )
    }

    /// Codes that leave a commit's outcome unknown: the commit may have
    /// applied even though the response was an error, so the client is told
    /// to retry commit rather than the whole transaction.
    pub fn is_unknown_commit_result(self) -> bool {
        self.is_retryable_remote()
            || matches!(
                self,
                Self::WriteConcernFailed | Self::ExceededTimeLimit | Self::UnsatisfiableWriteConcern
            )
    }
}

impl ErrorMetadata {
    pub fn new(
        code: ErrorCode,
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Malformed or unsupported request options.
    ///
    /// The short_msg should be a ScreamingCamelCase tag describing the error
    /// (eg `UnsupportedReadConcern`); the msg targets the developer.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(ErrorCode::BadRequest, short_msg, msg)
    }

    /// Continuation or commit of a transaction this router does not know.
    pub fn no_such_transaction(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::NoSuchTransaction, "NoSuchTransaction", msg)
    }

    pub fn shard_not_found(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ShardNotFound, "ShardNotFound", msg)
    }

    /// Transport-level failure reaching a shard. Retryable for idempotent
    /// operations.
    pub fn host_unreachable(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::HostUnreachable, "HostUnreachable", msg)
    }

    pub fn exceeded_time_limit(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ExceededTimeLimit, "ExceededTimeLimit", msg)
    }

    pub fn shutdown_in_progress(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ShutdownInProgress, "ShutdownInProgress", msg)
    }

    pub fn snapshot_too_old(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::SnapshotTooOld, "SnapshotTooOld", msg)
    }

    pub fn stale_shard_version(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::StaleShardVersion, "StaleShardVersion", msg)
    }

    pub fn stale_db_version(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::StaleDbVersion, "StaleDbVersion", msg)
    }

    /// Transient signal that an operation ran into an active tenant
    /// migration; callers wait on the blocker and retry or redirect.
    pub fn tenant_migration_conflict(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(
            ErrorCode::TenantMigrationConflict,
            "TenantMigrationConflict",
            msg,
        )
    }

    pub fn tenant_migration_committed(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(
            ErrorCode::TenantMigrationCommitted,
            "TenantMigrationCommitted",
            msg,
        )
    }

    pub fn tenant_migration_aborted(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(
            ErrorCode::TenantMigrationAborted,
            "TenantMigrationAborted",
            msg,
        )
    }

    pub fn is_snapshot_error(&self) -> bool {
        self.code.is_snapshot_error()
    }

    pub fn is_stale_routing(&self) -> bool {
        self.code.is_stale_routing()
    }

    pub fn is_retryable_remote(&self) -> bool {
        self.code.is_retryable_remote()
    }

    pub fn record(&self) {
        crate::metrics::log_error(self.code);
    }
}

pub const INTERNAL_SERVER_ERROR: &str = "InternalServerError";
pub const INTERNAL_SERVER_ERROR_MSG: &str = "The request couldn't be completed. Try again later.";

pub trait ErrorMetadataAnyhowExt {
    fn error_code(&self) -> Option<ErrorCode>;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn is_snapshot_error(&self) -> bool;
    fn is_stale_routing(&self) -> bool;
    fn is_retryable_remote(&self) -> bool;
    fn is_unknown_commit_result(&self) -> bool;
    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    /// Returns the attached code, if any metadata was attached.
    fn error_code(&self) -> Option<ErrorCode> {
        self.downcast_ref::<ErrorMetadata>().map(|e| e.code)
    }

    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_SERVER_ERROR
    }

    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        INTERNAL_SERVER_ERROR_MSG
    }

    fn is_snapshot_error(&self) -> bool {
        self.error_code().is_some_and(ErrorCode::is_snapshot_error)
    }

    fn is_stale_routing(&self) -> bool {
        self.error_code().is_some_and(ErrorCode::is_stale_routing)
    }

    fn is_retryable_remote(&self) -> bool {
        self.error_code().is_some_and(ErrorCode::is_retryable_remote)
    }

    /// True when a commit attempt that produced this error may nonetheless
    /// have committed. Untagged errors are not in this set: they are bugs,
    /// not transport ambiguity.
    fn is_unknown_commit_result(&self) -> bool {
        self.error_code()
            .is_some_and(ErrorCode::is_unknown_commit_result)
    }

    fn map_error_metadata<F>(self, f: F) -> Self
    where
        F: FnOnce(ErrorMetadata) -> ErrorMetadata,
    {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>().cloned() {
            return self.context(f(e));
        }
        self
    }
}

#[cfg(any(test, feature = "testing"))]
mod proptest_impls {
    use proptest::prelude::*;

    use super::{
        ErrorCode,
        ErrorMetadata,
    };

    impl Arbitrary for ErrorMetadata {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<ErrorCode>()
                .prop_map(|code| ErrorMetadata::new(code, "Test", "test error"))
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::{
        ErrorCode,
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    };

    proptest! {
        #![proptest_config(
            ProptestConfig { failure_persistence: None, ..ProptestConfig::default() }
        )]

        #[test]
        fn test_wire_code_roundtrip(code in any::<ErrorCode>()) {
            assert_eq!(ErrorCode::from_i32(code.as_i32()), Some(code));
        }

        #[test]
        fn test_unknown_commit_result_includes_retryable(code in any::<ErrorCode>()) {
            if code.is_retryable_remote() {
                assert!(code.is_unknown_commit_result());
            }
        }
    }

    #[test]
    fn test_metadata_survives_context_chain() {
        let err = anyhow::anyhow!("socket closed")
            .context(ErrorMetadata::host_unreachable("shard1 unreachable"))
            .context("while committing");
        assert_eq!(err.error_code(), Some(ErrorCode::HostUnreachable));
        assert_eq!(err.short_msg(), "HostUnreachable");
        assert!(err.is_retryable_remote());
        assert!(err.is_unknown_commit_result());
    }

    #[test]
    fn test_untagged_error_has_no_classification() {
        let err = anyhow::anyhow!("bug");
        assert_eq!(err.error_code(), None);
        assert!(!err.is_unknown_commit_result());
        assert_eq!(err.short_msg(), crate::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_snapshot_and_stale_families_are_disjoint() {
        for code in [
            ErrorCode::SnapshotTooOld,
            ErrorCode::SnapshotUnavailable,
            ErrorCode::StaleShardVersion,
            ErrorCode::StaleDbVersion,
        ] {
            assert_ne!(code.is_snapshot_error(), code.is_stale_routing());
        }
    }
}
