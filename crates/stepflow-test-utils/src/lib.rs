//! Mock handlers and observers shared by the Stepflow test suites.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use tokio::time::Instant;

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::{NodeHandler, RunObserver};
use stepflow_core::types::{ContextDelta, ExecutionContext, ExecutionPath, RunId};

/// Shared view of how often a handler was called and when.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    count: Arc<AtomicUsize>,
    times: Arc<Mutex<Vec<Instant>>>,
}

impl CallLog {
    fn record(&self) -> usize {
        self.times.lock().unwrap().push(Instant::now());
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Time elapsed between consecutive calls.
    pub fn gaps(&self) -> Vec<Duration> {
        let times = self.times.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

/// Fails a fixed number of times, then returns `delta` forever after.
pub struct ScriptedHandler {
    failures: usize,
    delta: ContextDelta,
    log: CallLog,
}

impl ScriptedHandler {
    pub fn new(failures: usize, delta: ContextDelta) -> Self {
        Self {
            failures,
            delta,
            log: CallLog::default(),
        }
    }

    /// Never succeeds.
    pub fn always_failing() -> Self {
        Self::new(usize::MAX, ContextDelta::new())
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }
}

impl NodeHandler for ScriptedHandler {
    fn handle(&self, _ctx: ExecutionContext) -> BoxFuture<'_, Result<ContextDelta>> {
        Box::pin(async move {
            let attempt = self.log.record();
            if attempt <= self.failures {
                Err(StepflowError::handler(format!("attempt {attempt} failed")))
            } else {
                Ok(self.delta.clone())
            }
        })
    }
}

/// Adds one to an integer key, starting from zero.
pub struct IncrementHandler {
    key: String,
    log: CallLog,
}

impl IncrementHandler {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            log: CallLog::default(),
        }
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }
}

impl NodeHandler for IncrementHandler {
    fn handle(&self, ctx: ExecutionContext) -> BoxFuture<'_, Result<ContextDelta>> {
        Box::pin(async move {
            self.log.record();
            let current = ctx.get_i64(&self.key).unwrap_or(0);
            Ok(ContextDelta::new().with(self.key.clone(), json!(current + 1)))
        })
    }
}

/// Sleeps before answering. Raises a flag if dropped mid-sleep.
pub struct SlowHandler {
    delay: Duration,
    cancelled: Arc<AtomicBool>,
    log: CallLog,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            cancelled: Arc::new(AtomicBool::new(false)),
            log: CallLog::default(),
        }
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// Set once an in-flight invocation was dropped before finishing.
    pub fn cancelled_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}

struct CancelGuard {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

impl NodeHandler for SlowHandler {
    fn handle(&self, _ctx: ExecutionContext) -> BoxFuture<'_, Result<ContextDelta>> {
        Box::pin(async move {
            self.log.record();
            let mut guard = CancelGuard {
                flag: self.cancelled.clone(),
                armed: true,
            };
            tokio::time::sleep(self.delay).await;
            guard.armed = false;
            Ok(ContextDelta::new().with("slow", json!("done")))
        })
    }
}

/// Records every notification as a short string, e.g. `node_started:a`.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
    paths: Mutex<Vec<ExecutionPath>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Paths handed to `on_run_completed`, one per finished run.
    pub fn completed_paths(&self) -> Vec<ExecutionPath> {
        self.paths.lock().unwrap().clone()
    }

    /// Number of node-level notifications seen.
    pub fn node_event_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with("node_"))
            .count()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl RunObserver for RecordingObserver {
    fn on_run_started(&self, _run_id: &RunId, _context: &ExecutionContext) {
        self.push("run_started".into());
    }

    fn on_node_started(&self, _run_id: &RunId, node_id: &str, _context: &ExecutionContext) {
        self.push(format!("node_started:{node_id}"));
    }

    fn on_node_completed(&self, _run_id: &RunId, node_id: &str, _delta: &ContextDelta) {
        self.push(format!("node_completed:{node_id}"));
    }

    fn on_node_failed(&self, _run_id: &RunId, node_id: &str, _error: &StepflowError) {
        self.push(format!("node_failed:{node_id}"));
    }

    fn on_run_completed(&self, _run_id: &RunId, _context: &ExecutionContext, path: &ExecutionPath) {
        self.paths.lock().unwrap().push(path.clone());
        self.push("run_completed".into());
    }
}
