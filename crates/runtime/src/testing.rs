//! Test implementation of the Runtime trait.
//!
//! `TestRuntime` rides on the ambient tokio test runtime, so tests written
//! with `#[tokio::test(start_paused = true)]` get a deterministic clock:
//! sleeps resolve instantly once every task is idle, and
//! `tokio::time::advance` moves time explicitly.

use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use futures::{
    future::FusedFuture,
    FutureExt,
};
use tokio::runtime::Handle as TokioRuntimeHandle;

use crate::{
    prod::FutureHandle,
    Runtime,
    SpawnHandle,
};

/// Fixed origin for `system_time` so wall-clock readings in tests are a pure
/// function of how far the paused clock has advanced.
const TEST_EPOCH_SECS: u64 = 1_620_000_000;

#[derive(Clone)]
pub struct TestRuntime {
    rt: TokioRuntimeHandle,
    created: tokio::time::Instant,
}

impl TestRuntime {
    /// Must be called from within a tokio test runtime.
    pub fn new() -> Self {
        Self {
            rt: TokioRuntimeHandle::current(),
            created: tokio::time::Instant::now(),
        }
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for TestRuntime {
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        let handle = self.rt.spawn(f);
        Box::new(FutureHandle::new(handle))
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(TEST_EPOCH_SECS) + self.created.elapsed()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        testing::TestRuntime,
        Runtime,
    };

    #[tokio::test(start_paused = true)]
    async fn test_wait_tracks_paused_clock() {
        let rt = TestRuntime::new();
        let before = rt.monotonic_now();
        rt.wait(Duration::from_secs(30)).await;
        assert_eq!(rt.monotonic_now() - before, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_time_advances_with_clock() {
        let rt = TestRuntime::new();
        let before = rt.system_time();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(
            rt.system_time().duration_since(before).unwrap(),
            Duration::from_secs(5)
        );
    }
}
