use std::sync::Arc;

use tracing::{debug, info, warn};

use stepflow_core::error::StepflowError;
use stepflow_core::event::EventBus;
use stepflow_core::traits::RunObserver;
use stepflow_core::types::{ContextDelta, ExecutionContext, ExecutionPath, RunEvent, RunId};

/// Mirrors run notifications into `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn on_run_started(&self, run_id: &RunId, context: &ExecutionContext) {
        info!(run_id = %run_id, keys = context.len(), "run started");
    }

    fn on_node_started(&self, run_id: &RunId, node_id: &str, _context: &ExecutionContext) {
        debug!(run_id = %run_id, node_id, "node started");
    }

    fn on_node_completed(&self, run_id: &RunId, node_id: &str, delta: &ContextDelta) {
        let keys: Vec<&str> = delta.keys().collect();
        debug!(run_id = %run_id, node_id, ?keys, "node completed");
    }

    fn on_node_failed(&self, run_id: &RunId, node_id: &str, error: &StepflowError) {
        warn!(run_id = %run_id, node_id, error = %error, "node failed");
    }

    fn on_run_completed(&self, run_id: &RunId, _context: &ExecutionContext, path: &ExecutionPath) {
        info!(run_id = %run_id, path = %path, steps = path.len(), "run completed");
    }
}

/// Republishes run notifications as [`RunEvent`]s on an [`EventBus`], so
/// async consumers such as the [`crate::RunLogger`] can follow runs without
/// sitting on the run's own execution path.
pub struct EventBusObserver {
    bus: Arc<EventBus>,
}

impl EventBusObserver {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl RunObserver for EventBusObserver {
    fn on_run_started(&self, run_id: &RunId, context: &ExecutionContext) {
        self.bus.publish(RunEvent::RunStarted {
            run_id: run_id.clone(),
            context: context.to_json(),
        });
    }

    fn on_node_started(&self, run_id: &RunId, node_id: &str, _context: &ExecutionContext) {
        self.bus.publish(RunEvent::NodeStarted {
            run_id: run_id.clone(),
            node_id: node_id.to_string(),
        });
    }

    fn on_node_completed(&self, run_id: &RunId, node_id: &str, delta: &ContextDelta) {
        self.bus.publish(RunEvent::NodeCompleted {
            run_id: run_id.clone(),
            node_id: node_id.to_string(),
            delta: delta.to_json(),
        });
    }

    fn on_node_failed(&self, run_id: &RunId, node_id: &str, error: &StepflowError) {
        self.bus.publish(RunEvent::NodeFailed {
            run_id: run_id.clone(),
            node_id: node_id.to_string(),
            error: error.to_string(),
        });
    }

    fn on_run_completed(&self, run_id: &RunId, context: &ExecutionContext, path: &ExecutionPath) {
        self.bus.publish(RunEvent::RunCompleted {
            run_id: run_id.clone(),
            context: context.to_json(),
            path: path.as_slice().to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::graph::{Edge, GraphBuilder, Node, WorkflowEngine};

    #[tokio::test]
    async fn test_events_published_in_order() {
        let bus = Arc::new(EventBus::new(32));
        let mut rx = bus.subscribe();

        let graph = GraphBuilder::new("a")
            .output_key("answer")
            .node(Node::from_fn("a", |_ctx| async { Ok(ContextDelta::new()) }))
            .node(Node::from_fn("b", |_ctx| async {
                Ok(ContextDelta::new().with("answer", json!(42)))
            }))
            .edge(Edge::always("a", "b"))
            .build();
        let engine = WorkflowEngine::new(graph);
        engine.add_observer(Arc::new(EventBusObserver::new(bus.clone())));
        engine.add_observer(Arc::new(TracingObserver));

        let report = engine.execute(json!("go")).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.run_id(), &report.run_id);
            kinds.push(event.kind());
            if let RunEvent::RunCompleted { path, context, .. } = &event {
                assert_eq!(path, &vec!["a".to_string(), "b".to_string()]);
                assert_eq!(context["answer"], json!(42));
            }
        }
        assert_eq!(
            kinds,
            vec![
                "run_started",
                "node_started",
                "node_completed",
                "node_started",
                "node_completed",
                "run_completed"
            ]
        );
    }
}
