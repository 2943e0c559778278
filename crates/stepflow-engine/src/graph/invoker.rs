use tracing::{debug, warn};

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::types::{ContextDelta, ExecutionContext};

use super::node::Node;

/// Run one node step under its resilience policies.
///
/// Order of application:
/// 1. the retry loop (or a single attempt without a policy),
/// 2. the timeout, which covers the whole retry loop and drops the
///    in-flight attempt when it fires,
/// 3. the failure handler, which may turn any error from 1–2 into a
///    successful result.
///
/// `ctx` is the context as it was before this node; it is what every
/// attempt and the failure handler see.
pub async fn invoke_node(node: &Node, ctx: &ExecutionContext) -> Result<ContextDelta> {
    let outcome = match node.timeout() {
        Some(limit) => match tokio::time::timeout(limit, attempt_with_retry(node, ctx)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(node_id = %node.id(), timeout_ms = limit.as_millis() as u64, "Node timed out");
                Err(StepflowError::Timeout {
                    node: node.id().to_string(),
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        },
        None => attempt_with_retry(node, ctx).await,
    };

    match (outcome, node.fallback()) {
        (Err(e), Some(fallback)) => {
            warn!(node_id = %node.id(), error = %e, "Node failed, running failure handler");
            fallback.recover(e, ctx.clone()).await
        }
        (outcome, _) => outcome,
    }
}

async fn attempt_with_retry(node: &Node, ctx: &ExecutionContext) -> Result<ContextDelta> {
    let Some(policy) = node.retry() else {
        return node.handler().handle(ctx.clone()).await;
    };

    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match node.handler().handle(ctx.clone()).await {
            Ok(delta) => {
                if attempt > 1 {
                    debug!(node_id = %node.id(), attempt, "Node succeeded after retry");
                }
                return Ok(delta);
            }
            Err(e) if attempt < max_attempts => {
                warn!(
                    node_id = %node.id(),
                    attempt,
                    max_attempts,
                    delay_ms = policy.delay.as_millis() as u64,
                    error = %e,
                    "Retrying node"
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(node_id = %node.id(), attempts = attempt, error = %e, "Node retries exhausted");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use serde_json::json;
    use stepflow_test_utils::{ScriptedHandler, SlowHandler};

    use crate::graph::node::RetryPolicy;

    fn ok_delta() -> ContextDelta {
        ContextDelta::new().with("result", json!("ok"))
    }

    #[tokio::test]
    async fn test_single_attempt_without_policy() {
        let handler = ScriptedHandler::new(1, ok_delta());
        let log = handler.log();
        let node = Node::new("a", handler);

        let err = invoke_node(&node, &ExecutionContext::new()).await.unwrap_err();
        assert!(matches!(err, StepflowError::Handler(_)));
        assert_eq!(log.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let delay = Duration::from_millis(200);
        let handler = ScriptedHandler::new(2, ok_delta());
        let log = handler.log();
        let node = Node::new("a", handler).with_retry(RetryPolicy::new(3, delay));

        let delta = invoke_node(&node, &ExecutionContext::new()).await.unwrap();
        assert_eq!(delta, ok_delta());
        assert_eq!(log.count(), 3);

        let gaps = log.gaps();
        assert_eq!(gaps.len(), 2);
        for gap in gaps {
            assert!(gap >= delay && gap < delay * 2, "unexpected gap {gap:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_returns_last_error() {
        let handler = ScriptedHandler::always_failing();
        let log = handler.log();
        let node = Node::new("a", handler)
            .with_retry(RetryPolicy::new(3, Duration::from_millis(50)));

        let start = tokio::time::Instant::now();
        let err = invoke_node(&node, &ExecutionContext::new()).await.unwrap_err();
        let elapsed = start.elapsed();

        assert_eq!(err.to_string(), "Handler failed: attempt 3 failed");
        assert_eq!(log.count(), 3);
        // Two delays, none after the last attempt
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_fallback_absorbs_failure() {
        let handler = ScriptedHandler::always_failing();
        let log = handler.log();
        let node = Node::new("a", handler)
            .with_retry(RetryPolicy::new(2, Duration::ZERO))
            .with_fallback_fn(|err, ctx: ExecutionContext| async move {
                Ok(ContextDelta::new()
                    .with("recovered", json!(err.to_string()))
                    .with("saw_input", json!(ctx.input().is_some())))
            });

        let mut ctx = ExecutionContext::seeded(json!("q"));
        ctx.set("other", json!(1));
        let delta = invoke_node(&node, &ctx).await.unwrap();

        assert_eq!(log.count(), 2);
        assert_eq!(
            delta.get("recovered"),
            Some(&json!("Handler failed: attempt 2 failed"))
        );
        assert_eq!(delta.get("saw_input"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_fallback_not_called_on_success() {
        let node = Node::new("a", ScriptedHandler::new(0, ok_delta())).with_fallback_fn(
            |_err, _ctx| async { Err(StepflowError::handler("fallback should not run")) },
        );

        let delta = invoke_node(&node, &ExecutionContext::new()).await.unwrap();
        assert_eq!(delta, ok_delta());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_handler() {
        let handler = SlowHandler::new(Duration::from_secs(10));
        let cancelled = handler.cancelled_flag();
        let node = Node::new("slow", handler).with_timeout(Duration::from_millis(100));

        let err = invoke_node(&node, &ExecutionContext::new()).await.unwrap_err();
        match err {
            StepflowError::Timeout { node, timeout_ms } => {
                assert_eq!(node, "slow");
                assert_eq!(timeout_ms, 100);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_covers_retry_loop() {
        // Each attempt fails instantly, but the delays alone exceed the limit
        let handler = ScriptedHandler::always_failing();
        let log = handler.log();
        let node = Node::new("a", handler)
            .with_retry(RetryPolicy::new(10, Duration::from_millis(100)))
            .with_timeout(Duration::from_millis(250));

        let err = invoke_node(&node, &ExecutionContext::new()).await.unwrap_err();
        assert!(matches!(err, StepflowError::Timeout { .. }));
        assert_eq!(log.count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_absorbed_by_fallback() {
        let node = Node::new("slow", SlowHandler::new(Duration::from_secs(5)))
            .with_timeout(Duration::from_millis(10))
            .with_fallback_fn(|err, _ctx| async move {
                let timed_out = matches!(err, StepflowError::Timeout { .. });
                Ok(ContextDelta::new().with("timed_out", json!(timed_out)))
            });

        let delta = invoke_node(&node, &ExecutionContext::new()).await.unwrap();
        assert_eq!(delta.get("timed_out"), Some(&json!(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_handler_within_timeout() {
        let handler = SlowHandler::new(Duration::from_millis(10));
        let cancelled = handler.cancelled_flag();
        let node = Node::new("quick", handler).with_timeout(Duration::from_secs(1));

        let delta = invoke_node(&node, &ExecutionContext::new()).await.unwrap();
        assert_eq!(delta.get("slow"), Some(&json!("done")));
        assert!(!cancelled.load(Ordering::SeqCst));
    }
}
