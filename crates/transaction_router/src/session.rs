//! Session-scoped router checkout.
//!
//! A `TransactionRouter` is accessed by at most one operation at a time; the
//! catalog hands out owned guards, so holding the checkout *is* the lock and
//! the router itself needs none.

use std::{
    collections::HashMap,
    sync::Arc,
};

use common::{
    remote::RemoteCommandExecutor,
    types::{
        LogicalClock,
        SessionId,
    },
};
use parking_lot::Mutex;
use runtime::Runtime;

use crate::{
    metrics::RouterMetrics,
    router::TransactionRouter,
};

pub type CheckedOutRouter<RT> = tokio::sync::OwnedMutexGuard<TransactionRouter<RT>>;

pub struct SessionCatalog<RT: Runtime> {
    rt: RT,
    executor: Arc<dyn RemoteCommandExecutor>,
    clock: Arc<LogicalClock>,
    metrics: Arc<RouterMetrics>,
    sessions: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<TransactionRouter<RT>>>>>,
}

impl<RT: Runtime> SessionCatalog<RT> {
    pub fn new(
        rt: RT,
        executor: Arc<dyn RemoteCommandExecutor>,
        clock: Arc<LogicalClock>,
        metrics: Arc<RouterMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rt,
            executor,
            clock,
            metrics,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Check out the session's router, creating it lazily on first use.
    /// Suspends while another operation on the same session holds it.
    pub async fn checkout(&self, session_id: SessionId) -> CheckedOutRouter<RT> {
        let router = {
            let mut sessions = self.sessions.lock();
            sessions
                .entry(session_id)
                .or_insert_with(|| {
                    Arc::new(tokio::sync::Mutex::new(TransactionRouter::new(
                        self.rt.clone(),
                        session_id,
                        self.executor.clone(),
                        self.clock.clone(),
                        self.metrics.clone(),
                    )))
                })
                .clone()
        };
        router.lock_owned().await
    }

    /// Drop the session's router; its transaction state dies with it.
    pub fn destroy_session(&self, session_id: &SessionId) {
        self.sessions.lock().remove(session_id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::types::{
        ClusterTime,
        LogicalClock,
        SessionId,
        TxnNumber,
    };
    use runtime::testing::TestRuntime;

    use super::SessionCatalog;
    use crate::{
        metrics::RouterMetrics,
        router::TransactionAction,
        test_helpers::TestExecutor,
    };

    #[tokio::test(start_paused = true)]
    async fn test_checkout_serializes_access_per_session() {
        let rt = TestRuntime::new();
        let catalog = SessionCatalog::new(
            rt.clone(),
            Arc::new(TestExecutor::new()),
            Arc::new(LogicalClock::new(ClusterTime::new(3, 1))),
            RouterMetrics::new(),
        );
        let session_id = SessionId::new();

        let mut checked_out = catalog.checkout(session_id).await;
        checked_out
            .begin_or_continue(TxnNumber(1), TransactionAction::Start, None)
            .unwrap();

        // A second checkout of the same session must wait for the first.
        let second = catalog.checkout(session_id);
        tokio::pin!(second);
        assert!(futures::poll!(second.as_mut()).is_pending());

        drop(checked_out);
        let second = second.await;
        assert_eq!(second.txn_number(), Some(TxnNumber(1)));
        assert_eq!(catalog.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_session_forgets_state() {
        let rt = TestRuntime::new();
        let catalog = SessionCatalog::new(
            rt.clone(),
            Arc::new(TestExecutor::new()),
            Arc::new(LogicalClock::new(ClusterTime::new(3, 1))),
            RouterMetrics::new(),
        );
        let session_id = SessionId::new();
        {
            let mut router = catalog.checkout(session_id).await;
            router
                .begin_or_continue(TxnNumber(5), TransactionAction::Start, None)
                .unwrap();
        }
        catalog.destroy_session(&session_id);
        let router = catalog.checkout(session_id).await;
        assert_eq!(router.txn_number(), None);
    }
}
