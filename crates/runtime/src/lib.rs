//! Runtime trait abstracting OS-esque features (timers, task spawning,
//! clocks) so production code runs on tokio and tests run on a paused clock.

use std::{
    cmp,
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
    },
};

use futures::future::{
    BoxFuture,
    FusedFuture,
};
use thiserror::Error;

pub mod prod;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("Future canceled")]
    Canceled,
    #[error("Future panicked: {0:?}")]
    Panicked(anyhow::Error),
}

impl From<tokio::task::JoinError> for JoinError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            JoinError::Canceled
        } else {
            JoinError::Panicked(anyhow::anyhow!("{e:?}"))
        }
    }
}

#[must_use = "Tasks are canceled when their `SpawnHandle` is dropped."]
pub trait SpawnHandle: Send + Sync {
    /// Stops the spawned task "soon". This happens asynchronously.
    fn shutdown(&mut self);
    /// Wait for the spawned task to finish. Returns an error if the task was
    /// canceled (via `shutdown`) or panicked.
    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>>;
}

/// Shutdown the associated task, preempting it at its next yield point, and
/// join on its result. Cancellation itself is not an error here.
pub async fn shutdown_and_join(mut handle: Box<dyn SpawnHandle>) -> anyhow::Result<()> {
    handle.shutdown();
    if let Err(e) = handle.join().await {
        if !matches!(e, JoinError::Canceled) {
            return Err(e.into());
        }
    }
    Ok(())
}

pub trait Runtime: Clone + Send + Sync + 'static {
    /// Sleep for the given duration. Resolves on the runtime's clock, which
    /// tests may pause and advance.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>>;

    /// Spawn `f` onto the shared executor pool. The name shows up in task
    /// dumps and tracing events.
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle>;

    fn system_time(&self) -> SystemTime;

    fn monotonic_now(&self) -> tokio::time::Instant;
}

/// Resolve a set of futures to the index and output of the first to settle;
/// the rest are dropped. Every wait-with-deadline in this codebase takes this
/// shape: the operation and its deadline sleep race, and the loser is
/// canceled by drop.
///
/// Panics when `futures` is empty.
pub async fn when_any<T>(futures: Vec<BoxFuture<'_, T>>) -> (usize, T) {
    assert!(!futures.is_empty(), "when_any requires at least one future");
    let (output, index, _unresolved) = futures::future::select_all(futures).await;
    (index, output)
}

/// Exponential backoff with deterministic doubling.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    num_failures: u32,
}

impl Backoff {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            num_failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.num_failures = 0;
    }

    pub fn fail(&mut self) -> Duration {
        let p = 2u32.checked_pow(self.num_failures).unwrap_or(u32::MAX);
        self.num_failures += 1;
        let backoff = self
            .initial_backoff
            .checked_mul(p)
            .unwrap_or(self.max_backoff);
        cmp::min(backoff, self.max_backoff)
    }

    pub fn failures(&self) -> u32 {
        self.num_failures
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::FutureExt;

    use crate::{
        when_any,
        Backoff,
    };

    #[test]
    fn test_backoff_doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        assert_eq!(backoff.fail(), Duration::from_secs(1));
        assert_eq!(backoff.fail(), Duration::from_secs(2));
        assert_eq!(backoff.fail(), Duration::from_secs(4));
        assert_eq!(backoff.fail(), Duration::from_secs(8));
        assert_eq!(backoff.fail(), Duration::from_secs(8));
        backoff.reset();
        assert_eq!(backoff.fail(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_when_any_returns_first_settled_index() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            "slow"
        }
        .boxed();
        let fast = async { "fast" }.boxed();
        let (index, output) = when_any(vec![slow, fast]).await;
        assert_eq!(index, 1);
        assert_eq!(output, "fast");
    }
}
