use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, info, info_span, warn, Instrument};

use stepflow_core::config::EngineConfig;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::RunObserver;
use stepflow_core::types::{ExecutionContext, ExecutionPath, RunId};

use super::definition::GraphDefinition;
use super::invoker::invoke_node;
use super::observer::{ObserverHub, ObserverId};
use super::router::next_node;

/// Default cycle-guard limit: a node may run at most this many times per run.
pub const DEFAULT_MAX_VISITS: usize = 3;

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    /// Value found under the graph's output key.
    pub output: Value,
    /// The final context with all accumulated data.
    pub context: ExecutionContext,
    /// Every node visited, in order.
    pub path: ExecutionPath,
    /// Total execution time in milliseconds.
    pub elapsed_ms: u64,
}

/// Executes a workflow graph.
///
/// Starting from the start node, it invokes each node under its policies,
/// merges the node's delta into the run's context, and follows the first
/// matching outgoing edge. The run ends successfully when no edge matches.
///
/// The engine is cheap to share: the graph is immutable and each run keeps
/// its own context and path, so `run` may be called concurrently.
pub struct WorkflowEngine {
    graph: Arc<GraphDefinition>,
    observers: Arc<ObserverHub>,
    max_visits: usize,
}

impl WorkflowEngine {
    pub fn new(graph: GraphDefinition) -> Self {
        Self {
            graph: Arc::new(graph),
            observers: Arc::new(ObserverHub::new()),
            max_visits: DEFAULT_MAX_VISITS,
        }
    }

    /// Build an engine using the limits from `config`.
    pub fn with_config(graph: GraphDefinition, config: &EngineConfig) -> Self {
        Self::new(graph).with_max_visits(config.engine.max_visits)
    }

    /// Set the cycle-guard limit. Values below 1 are treated as 1.
    pub fn with_max_visits(mut self, max_visits: usize) -> Self {
        self.max_visits = max_visits.max(1);
        self
    }

    /// Share an existing observer hub instead of the engine's own.
    pub fn with_observer_hub(mut self, hub: Arc<ObserverHub>) -> Self {
        self.observers = hub;
        self
    }

    pub fn graph(&self) -> &GraphDefinition {
        &self.graph
    }

    pub fn observers(&self) -> &Arc<ObserverHub> {
        &self.observers
    }

    pub fn max_visits(&self) -> usize {
        self.max_visits
    }

    pub fn add_observer(&self, observer: Arc<dyn RunObserver>) -> ObserverId {
        self.observers.add_observer(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove_observer(id)
    }

    /// Run the graph once and return the value under the output key.
    pub async fn run(&self, input: Value) -> Result<Value> {
        self.execute(input).await.map(|report| report.output)
    }

    /// Run the graph once and return the full report.
    pub async fn execute(&self, input: Value) -> Result<RunReport> {
        let run_id = RunId::new();
        let span = info_span!("run", run_id = %run_id);
        self.execute_inner(run_id, input).instrument(span).await
    }

    async fn execute_inner(&self, run_id: RunId, input: Value) -> Result<RunReport> {
        let start = Instant::now();
        let graph = &self.graph;

        if graph.node(graph.start_node_id()).is_none() {
            error!(node_id = %graph.start_node_id(), "Start node not registered");
            return Err(StepflowError::NodeNotFound(
                graph.start_node_id().to_string(),
            ));
        }

        let mut context = ExecutionContext::seeded(input);
        let mut path = ExecutionPath::new();
        let mut current = graph.start_node_id().to_string();

        info!(start = %current, "Workflow run started");
        self.observers.run_started(&run_id, &context);

        loop {
            let Some(node) = graph.node(&current) else {
                error!(node_id = %current, "Edge leads to an unregistered node");
                self.observers.run_completed(&run_id, &context, &path);
                return Err(StepflowError::NodeNotFound(current));
            };

            path.push(current.as_str());
            self.observers.node_started(&run_id, &current, &context);
            debug!(node_id = %current, step = path.len(), "Executing node");

            let node_start = Instant::now();
            match invoke_node(node, &context).await {
                Ok(delta) => {
                    context.merge(&delta);
                    debug!(
                        node_id = %current,
                        keys = delta.len(),
                        elapsed_ms = node_start.elapsed().as_millis() as u64,
                        "Node execution complete"
                    );
                    self.observers.node_completed(&run_id, &current, &delta);
                }
                Err(e) => {
                    error!(node_id = %current, error = %e, "Node failed");
                    self.observers.node_failed(&run_id, &current, &e);
                    self.observers.run_completed(&run_id, &context, &path);
                    return Err(e);
                }
            }

            match next_node(graph.edges(), &current, &context) {
                Some(next) => {
                    let visits = path.visits(next) + 1;
                    if visits > self.max_visits {
                        warn!(
                            node_id = %next,
                            visits,
                            limit = self.max_visits,
                            "Cycle guard tripped, aborting run"
                        );
                        self.observers.run_completed(&run_id, &context, &path);
                        return Err(StepflowError::InvalidWorkflow {
                            node: next.to_string(),
                            visits,
                            limit: self.max_visits,
                        });
                    }
                    current = next.to_string();
                }
                None => {
                    debug!(node_id = %current, "No edge matched, run complete");
                    self.observers.run_completed(&run_id, &context, &path);
                    break;
                }
            }
        }

        let output_key = graph.output_key();
        let Some(output) = context.get(output_key).cloned() else {
            warn!(output_key = %output_key, path = %path, "Run finished without output");
            return Err(StepflowError::OutputKeyMissing(output_key.to_string()));
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(steps = path.len(), elapsed_ms, "Workflow run completed");

        Ok(RunReport {
            run_id,
            output,
            context,
            path,
            elapsed_ms,
        })
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("start", &self.graph.start_node_id())
            .field("nodes", &self.graph.node_count())
            .field("edges", &self.graph.edges().len())
            .field("max_visits", &self.max_visits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use stepflow_core::types::ContextDelta;
    use stepflow_test_utils::{IncrementHandler, RecordingObserver, ScriptedHandler};

    use crate::graph::builder::GraphBuilder;
    use crate::graph::edge::Edge;
    use crate::graph::node::{Node, RetryPolicy};

    fn echo(id: &str, key: &'static str) -> Node {
        Node::from_fn(id, move |ctx: ExecutionContext| async move {
            Ok(ContextDelta::new().with(key, ctx.input().cloned().unwrap_or_default()))
        })
    }

    fn recorded(engine: &WorkflowEngine) -> Arc<RecordingObserver> {
        let rec = Arc::new(RecordingObserver::new());
        engine.add_observer(rec.clone());
        rec
    }

    #[tokio::test]
    async fn test_linear_chain_counts() {
        let ids = ["n1", "n2", "n3", "n4", "n5"];
        let mut builder = GraphBuilder::new("n1").output_key("counter");
        for id in ids {
            builder = builder.node(Node::new(id, IncrementHandler::new("counter")));
        }
        let engine = WorkflowEngine::new(builder.chain(ids).build());
        let rec = recorded(&engine);

        let report = engine.execute(json!(null)).await.unwrap();
        assert_eq!(report.output, json!(5));
        assert_eq!(report.path.as_slice(), &ids.map(String::from));
        assert_eq!(rec.completed_paths(), vec![report.path.clone()]);
    }

    #[tokio::test]
    async fn test_round_trip() {
        let graph = GraphBuilder::new("only")
            .output_key("answer")
            .node(echo("only", "answer"))
            .build();
        let engine = WorkflowEngine::new(graph);

        let input = json!({"question": "why?", "n": [1, 2, 3]});
        assert_eq!(engine.run(input.clone()).await.unwrap(), input);
    }

    #[tokio::test]
    async fn test_missing_start_node() {
        let graph = GraphBuilder::new("ghost")
            .node(echo("real", "output"))
            .build();
        let engine = WorkflowEngine::new(graph);
        let rec = recorded(&engine);

        let err = engine.run(json!(1)).await.unwrap_err();
        assert!(matches!(err, StepflowError::NodeNotFound(ref id) if id == "ghost"));
        assert_eq!(rec.node_event_count(), 0);
        assert!(rec.events().is_empty());
    }

    #[tokio::test]
    async fn test_edge_to_missing_node() {
        let graph = GraphBuilder::new("a")
            .node(echo("a", "output"))
            .edge(Edge::always("a", "nowhere"))
            .build();
        let engine = WorkflowEngine::new(graph);
        let rec = recorded(&engine);

        let err = engine.run(json!(1)).await.unwrap_err();
        assert!(matches!(err, StepflowError::NodeNotFound(ref id) if id == "nowhere"));
        assert_eq!(
            rec.events(),
            vec![
                "run_started",
                "node_started:a",
                "node_completed:a",
                "run_completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_output_key_missing() {
        let graph = GraphBuilder::new("a")
            .output_key("answer")
            .node(echo("a", "draft"))
            .build();
        let engine = WorkflowEngine::new(graph);
        let rec = recorded(&engine);

        let err = engine.run(json!("x")).await.unwrap_err();
        assert!(matches!(err, StepflowError::OutputKeyMissing(ref k) if k == "answer"));
        // Natural termination still notifies before the output check
        assert_eq!(rec.events().last().map(String::as_str), Some("run_completed"));
    }

    #[tokio::test]
    async fn test_conditional_branch() {
        let build = || {
            GraphBuilder::new("classify")
                .output_key("answer")
                .node(Node::from_fn("classify", |_ctx| async { Ok(ContextDelta::new()) }))
                .node(Node::from_fn("p1", |_ctx| async {
                    Ok(ContextDelta::new().with("answer", json!("took p1")))
                }))
                .node(Node::from_fn("p2", |_ctx| async {
                    Ok(ContextDelta::new().with("answer", json!("took p2")))
                }))
                .edge(Edge::when("classify", "p1", |ctx| {
                    ctx.input() == Some(&json!("left"))
                }))
                .edge(Edge::when("classify", "p2", |ctx| {
                    ctx.input() != Some(&json!("left"))
                }))
                .build()
        };

        let engine = WorkflowEngine::new(build());
        assert_eq!(engine.run(json!("left")).await.unwrap(), json!("took p1"));
        assert_eq!(engine.run(json!("right")).await.unwrap(), json!("took p2"));
    }

    #[tokio::test]
    async fn test_cycle_guard_trips_on_fourth_visit() {
        let b = IncrementHandler::new("b_runs");
        let b_log = b.log();
        let graph = GraphBuilder::new("a")
            .node(echo("a", "seen"))
            .node(Node::new("b", b))
            .edge(Edge::always("a", "b"))
            .edge(Edge::always("b", "b"))
            .build();
        let engine = WorkflowEngine::new(graph);
        let rec = recorded(&engine);

        let err = engine.run(json!(0)).await.unwrap_err();
        match err {
            StepflowError::InvalidWorkflow {
                node,
                visits,
                limit,
            } => {
                assert_eq!(node, "b");
                assert_eq!(visits, 4);
                assert_eq!(limit, 3);
            }
            other => panic!("expected InvalidWorkflow, got {other:?}"),
        }
        assert_eq!(b_log.count(), 3);
        let path = &rec.completed_paths()[0];
        assert_eq!(path.to_string(), "a -> b -> b -> b");
    }

    #[tokio::test]
    async fn test_bounded_loop_within_limit() {
        // b loops until it has run three times, then hands off to done
        let graph = GraphBuilder::new("b")
            .output_key("b_runs")
            .node(Node::new("b", IncrementHandler::new("b_runs")))
            .node(echo("done", "finished"))
            .edge(Edge::conditional("b", "b", "b_runs < 3"))
            .edge(Edge::always("b", "done"))
            .build();
        let engine = WorkflowEngine::new(graph);

        let report = engine.execute(json!(null)).await.unwrap();
        assert_eq!(report.output, json!(3));
        assert_eq!(report.path.to_string(), "b -> b -> b -> done");
    }

    #[tokio::test]
    async fn test_custom_visit_limit() {
        let graph = GraphBuilder::new("b")
            .output_key("b_runs")
            .node(Node::new("b", IncrementHandler::new("b_runs")))
            .edge(Edge::conditional("b", "b", "b_runs < 5"))
            .build();

        let strict = WorkflowEngine::new(graph.clone());
        assert!(matches!(
            strict.run(json!(null)).await,
            Err(StepflowError::InvalidWorkflow { .. })
        ));

        let relaxed = WorkflowEngine::new(graph).with_max_visits(5);
        assert_eq!(relaxed.run(json!(null)).await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_handler_error_propagates_unchanged() {
        let graph = GraphBuilder::new("a")
            .node(echo("a", "x"))
            .node(Node::new("b", ScriptedHandler::always_failing()))
            .node(echo("c", "output"))
            .chain(["a", "b", "c"])
            .build();
        let engine = WorkflowEngine::new(graph);
        let rec = recorded(&engine);

        let err = engine.run(json!(1)).await.unwrap_err();
        assert_eq!(err.to_string(), "Handler failed: attempt 1 failed");
        assert_eq!(
            rec.events(),
            vec![
                "run_started",
                "node_started:a",
                "node_completed:a",
                "node_started:b",
                "node_failed:b",
                "run_completed"
            ]
        );
        assert_eq!(rec.completed_paths()[0].to_string(), "a -> b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_absorbed_failure_continues() {
        let failing = ScriptedHandler::always_failing();
        let log = failing.log();
        let graph = GraphBuilder::new("search")
            .output_key("answer")
            .node(
                Node::new("search", failing)
                    .with_retry(RetryPolicy::new(3, Duration::from_millis(10)))
                    .with_fallback_fn(|_err, _ctx| async {
                        Ok(ContextDelta::new().with("results", json!([])))
                    }),
            )
            .node(Node::from_fn("answer", |ctx: ExecutionContext| async move {
                let n = ctx.get("results").and_then(|v| v.as_array()).map_or(0, |a| a.len());
                Ok(ContextDelta::new().with("answer", json!(format!("{n} results"))))
            }))
            .chain(["search", "answer"])
            .build();
        let engine = WorkflowEngine::new(graph);
        let rec = recorded(&engine);

        assert_eq!(engine.run(json!("q")).await.unwrap(), json!("0 results"));
        assert_eq!(log.count(), 3);
        assert!(!rec.events().iter().any(|e| e.starts_with("node_failed")));
    }

    #[tokio::test]
    async fn test_later_write_wins() {
        let graph = GraphBuilder::new("a")
            .output_key("value")
            .node(Node::from_fn("a", |_ctx| async {
                Ok(ContextDelta::new().with("value", json!("first")))
            }))
            .node(Node::from_fn("b", |_ctx| async {
                Ok(ContextDelta::new().with("value", json!("second")))
            }))
            .chain(["a", "b"])
            .build();
        let engine = WorkflowEngine::new(graph);
        assert_eq!(engine.run(json!(null)).await.unwrap(), json!("second"));
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_isolated() {
        let graph = GraphBuilder::new("inc")
            .output_key("counter")
            .node(Node::new("inc", IncrementHandler::new("counter")))
            .build();
        let engine = Arc::new(WorkflowEngine::new(graph));
        let rec = recorded(&engine);

        let runs: Vec<_> = (0..16)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.run(json!(i)).await })
            })
            .collect();
        for run in runs {
            assert_eq!(run.await.unwrap().unwrap(), json!(1));
        }
        assert_eq!(rec.completed_paths().len(), 16);
    }
}
