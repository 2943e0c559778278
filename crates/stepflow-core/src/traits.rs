use std::future::Future;

use futures::future::BoxFuture;

use crate::error::{Result, StepflowError};
use crate::types::{ContextDelta, ExecutionContext, ExecutionPath, RunId};

/// Node handler: the unit of work a node wraps.
///
/// Receives a snapshot of the context accumulated so far and returns only
/// its own contribution. Called once per attempt.
pub trait NodeHandler: Send + Sync + 'static {
    fn handle(&self, ctx: ExecutionContext) -> BoxFuture<'_, Result<ContextDelta>>;
}

/// Failure handler: turns a node failure into a successful result.
///
/// Receives the final error and the context as it was before the node ran.
pub trait FailureHandler: Send + Sync + 'static {
    fn recover(
        &self,
        error: StepflowError,
        ctx: ExecutionContext,
    ) -> BoxFuture<'_, Result<ContextDelta>>;
}

/// Run observer: synchronous lifecycle callbacks.
///
/// Called inline on the run's own task, in registration order. Every
/// method defaults to a no-op so observers implement only what they need.
pub trait RunObserver: Send + Sync + 'static {
    fn on_run_started(&self, run_id: &RunId, context: &ExecutionContext) {
        let _ = (run_id, context);
    }

    fn on_node_started(&self, run_id: &RunId, node_id: &str, context: &ExecutionContext) {
        let _ = (run_id, node_id, context);
    }

    fn on_node_completed(&self, run_id: &RunId, node_id: &str, delta: &ContextDelta) {
        let _ = (run_id, node_id, delta);
    }

    fn on_node_failed(&self, run_id: &RunId, node_id: &str, error: &StepflowError) {
        let _ = (run_id, node_id, error);
    }

    fn on_run_completed(&self, run_id: &RunId, context: &ExecutionContext, path: &ExecutionPath) {
        let _ = (run_id, context, path);
    }
}

/// Adapter turning an async closure into a [`NodeHandler`].
pub struct FnHandler<F>(F);

/// Wrap `f` as a node handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ContextDelta>> + Send + 'static,
{
    FnHandler(f)
}

impl<F, Fut> NodeHandler for FnHandler<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ContextDelta>> + Send + 'static,
{
    fn handle(&self, ctx: ExecutionContext) -> BoxFuture<'_, Result<ContextDelta>> {
        Box::pin((self.0)(ctx))
    }
}

/// Adapter turning an async closure into a [`FailureHandler`].
pub struct FnFallback<F>(F);

/// Wrap `f` as a failure handler.
pub fn fallback_fn<F, Fut>(f: F) -> FnFallback<F>
where
    F: Fn(StepflowError, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ContextDelta>> + Send + 'static,
{
    FnFallback(f)
}

impl<F, Fut> FailureHandler for FnFallback<F>
where
    F: Fn(StepflowError, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ContextDelta>> + Send + 'static,
{
    fn recover(
        &self,
        error: StepflowError,
        ctx: ExecutionContext,
    ) -> BoxFuture<'_, Result<ContextDelta>> {
        Box::pin((self.0)(error, ctx))
    }
}
