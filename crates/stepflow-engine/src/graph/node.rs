use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::{fallback_fn, handler_fn, FailureHandler, NodeHandler};
use stepflow_core::types::{ContextDelta, ExecutionContext};

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Pause after each failed attempt except the last.
    #[serde(with = "duration_ms", rename = "delay_ms", default)]
    pub delay: Duration,
}

impl RetryPolicy {
    /// A `max_attempts` of zero is treated as one.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// A node in the execution graph.
///
/// Wraps a handler plus its optional resilience policies. Nodes are cheap to
/// clone (the handlers are shared), and every `with_*` method returns a
/// modified copy, so attaching a policy never changes a node that is already
/// registered somewhere else.
#[derive(Clone)]
pub struct Node {
    id: String,
    handler: Arc<dyn NodeHandler>,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
    fallback: Option<Arc<dyn FailureHandler>>,
}

impl Node {
    /// Create a new node with no policies attached.
    pub fn new(id: impl Into<String>, handler: impl NodeHandler) -> Self {
        Self {
            id: id.into(),
            handler: Arc::new(handler),
            retry: None,
            timeout: None,
            fallback: None,
        }
    }

    /// Create a node from an async closure.
    pub fn from_fn<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ContextDelta>> + Send + 'static,
    {
        Self::new(id, handler_fn(f))
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Set the timeout covering all attempts of this node.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the failure handler.
    pub fn with_fallback(mut self, fallback: impl FailureHandler) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Set the failure handler from an async closure.
    pub fn with_fallback_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(StepflowError, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ContextDelta>> + Send + 'static,
    {
        self.with_fallback(fallback_fn(f))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handler(&self) -> &dyn NodeHandler {
        self.handler.as_ref()
    }

    pub fn retry(&self) -> Option<RetryPolicy> {
        self.retry
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn fallback(&self) -> Option<&dyn FailureHandler> {
        self.fallback.as_deref()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}
