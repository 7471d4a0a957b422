//! Process-wide map from tenant to its access blocker.
//!
//! Lookups happen on every statement touching a tenant database; inserts and
//! removals only on migration start and garbage collection.

use std::{
    collections::HashMap,
    sync::Arc,
};

use common::{
    types::TenantId,
    Document,
};
use parking_lot::RwLock;
use runtime::Runtime;

use crate::access_blocker::TenantMigrationAccessBlocker;

pub struct AccessBlockerRegistry<RT: Runtime> {
    blockers: RwLock<HashMap<TenantId, Arc<TenantMigrationAccessBlocker<RT>>>>,
}

impl<RT: Runtime> AccessBlockerRegistry<RT> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            blockers: RwLock::new(HashMap::new()),
        })
    }

    pub fn add(&self, blocker: Arc<TenantMigrationAccessBlocker<RT>>) -> anyhow::Result<()> {
        let tenant_id = blocker.tenant_id().clone();
        let mut blockers = self.blockers.write();
        anyhow::ensure!(
            !blockers.contains_key(&tenant_id),
            "tenant {tenant_id} already has an active migration blocker",
        );
        blockers.insert(tenant_id, blocker);
        Ok(())
    }

    /// Remove a blocker on migration garbage collection.
    pub fn remove(&self, tenant_id: &TenantId) -> Option<Arc<TenantMigrationAccessBlocker<RT>>> {
        self.blockers.write().remove(tenant_id)
    }

    pub fn for_tenant(&self, tenant_id: &TenantId) -> Option<Arc<TenantMigrationAccessBlocker<RT>>> {
        self.blockers.read().get(tenant_id).cloned()
    }

    /// The blocker governing `db_name`, if any: tenants own the database
    /// named exactly after them and every `{tenant}_{suffix}` database.
    pub fn for_db_name(&self, db_name: &str) -> Option<Arc<TenantMigrationAccessBlocker<RT>>> {
        let blockers = self.blockers.read();
        blockers
            .iter()
            .find(|(tenant_id, _)| tenant_id.owns_db(db_name))
            .map(|(_, blocker)| blocker.clone())
    }

    /// Shut down every blocker and clear the map.
    pub fn shutdown(&self) {
        let blockers = {
            let mut map = self.blockers.write();
            map.drain().collect::<Vec<_>>()
        };
        for (_, blocker) in blockers {
            blocker.shutdown();
        }
    }

    pub fn server_status(&self) -> Document {
        let blockers = self.blockers.read();
        let mut doc = Document::new();
        for (tenant_id, blocker) in blockers.iter() {
            doc.insert(
                tenant_id.as_str().to_owned(),
                serde_json::Value::Object(blocker.server_status()),
            );
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use common::types::{
        OpTime,
        TenantId,
    };
    use runtime::testing::TestRuntime;
    use tokio_util::sync::CancellationToken;

    use super::AccessBlockerRegistry;
    use crate::{
        access_blocker::{
            MigrationOutcome,
            TenantMigrationAccessBlocker,
        },
        replication::MajorityCommitWaiter,
    };

    struct NeverWaiter;

    #[async_trait]
    impl MajorityCommitWaiter for NeverWaiter {
        async fn await_majority(
            &self,
            _op_time: OpTime,
            cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            cancel.cancelled().await;
            anyhow::bail!("canceled")
        }
    }

    fn blocker(rt: &TestRuntime, tenant: &str) -> Arc<TenantMigrationAccessBlocker<TestRuntime>> {
        TenantMigrationAccessBlocker::new(
            rt.clone(),
            TenantId::from(tenant),
            "recipient-rs0/host1:27017".to_owned(),
            Arc::new(NeverWaiter),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_by_db_name_prefix() {
        let rt = TestRuntime::new();
        let registry = AccessBlockerRegistry::new();
        registry.add(blocker(&rt, "acme")).unwrap();

        assert!(registry.for_db_name("acme").is_some());
        assert!(registry.for_db_name("acme_orders").is_some());
        assert!(registry.for_db_name("acmeorders").is_none());
        assert!(registry.for_db_name("other").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_tenant_rejected() {
        let rt = TestRuntime::new();
        let registry = AccessBlockerRegistry::new();
        registry.add(blocker(&rt, "acme")).unwrap();
        assert!(registry.add(blocker(&rt, "acme")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_clears_lookup() {
        let rt = TestRuntime::new();
        let registry = AccessBlockerRegistry::new();
        registry.add(blocker(&rt, "acme")).unwrap();
        assert!(registry.remove(&TenantId::from("acme")).is_some());
        assert!(registry.for_db_name("acme").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_breaks_every_blocker() {
        let rt = TestRuntime::new();
        let registry = AccessBlockerRegistry::new();
        let acme = blocker(&rt, "acme");
        let globex = blocker(&rt, "globex");
        registry.add(acme.clone()).unwrap();
        registry.add(globex.clone()).unwrap();

        registry.shutdown();
        assert_eq!(acme.on_completion().await, MigrationOutcome::ShutDown);
        assert_eq!(globex.on_completion().await, MigrationOutcome::ShutDown);
        assert!(registry.for_db_name("acme").is_none());
    }
}
