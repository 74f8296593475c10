//! Worker invocation contract.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::context::WorkerContext;

/// What a worker is asked to do.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    /// Task the invocation belongs to.
    pub task_id: String,
    /// Name of the worker being invoked.
    pub worker_name: String,
    /// Task description, passed through untouched.
    pub description: String,
}

/// Runs a task against a worker and returns its textual output.
///
/// Implementations should poll [`WorkerContext::checkpoint`] to honour soft
/// cancellation; returning [`WorkerError::Cancelled`](crate::error::WorkerError)
/// records the task as cancelled. Hard cancellation drops the future, so it
/// must not rely on code after an `.await` to release resources.
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    async fn run(&self, request: WorkerRequest, ctx: WorkerContext) -> anyhow::Result<String>;
}

/// Adapts an async closure into a [`WorkerRunner`].
pub struct FnRunner<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnRunner<F, Fut>
where
    F: Fn(WorkerRequest, WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> WorkerRunner for FnRunner<F, Fut>
where
    F: Fn(WorkerRequest, WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    async fn run(&self, request: WorkerRequest, ctx: WorkerContext) -> anyhow::Result<String> {
        (self.f)(request, ctx).await
    }
}
