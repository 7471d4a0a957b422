//! Production implementation of the Runtime trait.

use std::{
    future::Future,
    pin::Pin,
    time::SystemTime,
};

use futures::{
    future::{
        BoxFuture,
        FusedFuture,
    },
    FutureExt,
};
use tokio::{
    runtime::{
        Builder,
        Handle as TokioRuntimeHandle,
        Runtime as TokioRuntime,
    },
    time::{
        sleep,
        Duration,
    },
};

use crate::{
    JoinError,
    Runtime,
    SpawnHandle,
};

pub struct FutureHandle {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl FutureHandle {
    pub fn new(handle: tokio::task::JoinHandle<()>) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

impl SpawnHandle for FutureHandle {
    fn shutdown(&mut self) {
        if let Some(ref handle) = self.handle {
            handle.abort();
        }
    }

    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        let handle = self.handle.take();
        async move {
            if let Some(handle) = handle {
                handle.await?;
            }
            Ok(())
        }
        .boxed()
    }
}

impl Drop for FutureHandle {
    fn drop(&mut self) {
        if let Some(ref handle) = self.handle {
            handle.abort();
        }
    }
}

/// Runtime for running in production that sleeps for wallclock time and
/// doesn't mock out any functionality.
#[derive(Clone)]
pub struct ProdRuntime {
    rt: TokioRuntimeHandle,
}

impl ProdRuntime {
    pub fn init_tokio() -> anyhow::Result<TokioRuntime> {
        anyhow::ensure!(
            TokioRuntimeHandle::try_current().is_err(),
            "Tried to create a `ProdRuntime` from within a tokio context. Are you using \
             `#[tokio::main]` or `#[tokio::test]`?"
        );
        let tokio_rt = Builder::new_multi_thread().enable_all().build()?;
        Ok(tokio_rt)
    }

    /// The `tokio_rt` should live for the duration of `main`; at the end of
    /// `main` its `Drop` joins all spawned futures. Using a `ProdRuntime`
    /// after the associated `TokioRuntime` has been dropped panics.
    pub fn new(tokio_rt: &TokioRuntime) -> Self {
        Self {
            rt: tokio_rt.handle().clone(),
        }
    }

    pub fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.rt.block_on(f)
    }
}

impl Runtime for ProdRuntime {
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        let handle = self.rt.spawn(f);
        Box::new(FutureHandle {
            handle: Some(handle),
        })
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }
}
