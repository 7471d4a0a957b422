//! Common types representing cluster identifiers and request options.

use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};
use uuid::Uuid;

mod cluster_time;
mod op_time;
mod read_concern;
mod write_concern;

pub use cluster_time::{
    ClusterTime,
    LogicalClock,
};
pub use op_time::OpTime;
pub use read_concern::{
    ReadConcern,
    ReadConcernLevel,
};
pub use write_concern::{
    WriteConcern,
    WriteConcernW,
};

/// Opaque identifier of a shard (a replica set participating in the
/// cluster).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tenant is a database-name prefix: databases named `{tenant}` or
/// `{tenant}_{suffix}` belong to it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `db_name` is governed by this tenant.
    pub fn owns_db(&self, db_name: &str) -> bool {
        match db_name.strip_prefix(self.0.as_str()) {
            Some("") => true,
            Some(rest) => rest.starts_with('_'),
            None => false,
        }
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical session identifier carried by every in-transaction request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Client-chosen transaction number, monotone per session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnNumber(pub u64);

impl fmt::Display for TxnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// 0-based index of a client statement within a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StmtId(pub i32);

impl StmtId {
    pub const FIRST: StmtId = StmtId(0);

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for StmtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::TenantId;

    #[test]
    fn test_tenant_owns_db_requires_separator() {
        let tenant = TenantId::from("acme");
        assert!(tenant.owns_db("acme"));
        assert!(tenant.owns_db("acme_orders"));
        assert!(!tenant.owns_db("acmeorders"));
        assert!(!tenant.owns_db("other"));
        assert!(!tenant.owns_db("ac"));
    }
}
