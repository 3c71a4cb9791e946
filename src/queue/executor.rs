use crate::codec::DecodedCommand;
use crate::core::AppContext;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Runs a decoded command on behalf of the queue consumer.
///
/// This is the seam to the dispatch layer. An `Err` is recorded as the
/// job's error text; returning [`QueueError::Cancelled`](crate::QueueError::Cancelled)
/// instead leaves the job pending so it runs again after a restart.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: DecodedCommand, context: AppContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<E: CommandExecutor + ?Sized> CommandExecutor for Arc<E> {
    async fn execute(&self, command: DecodedCommand, context: AppContext) -> anyhow::Result<()> {
        (**self).execute(command, context).await
    }
}

/// Executor backed by an async closure; see [`executor_fn`].
pub struct FnExecutor<F> {
    f: F,
}

/// Adapts `|command, context| async { ... }` into a [`CommandExecutor`].
pub fn executor_fn<F, Fut>(f: F) -> FnExecutor<F>
where
    F: Fn(DecodedCommand, AppContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnExecutor { f }
}

#[async_trait]
impl<F, Fut> CommandExecutor for FnExecutor<F>
where
    F: Fn(DecodedCommand, AppContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn execute(&self, command: DecodedCommand, context: AppContext) -> anyhow::Result<()> {
        (self.f)(command, context).await
    }
}
