use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use stepflow_core::error::StepflowError;
use stepflow_core::traits::RunObserver;
use stepflow_core::types::{ContextDelta, ExecutionContext, ExecutionPath, RunId};

/// Handle returned by [`ObserverHub::add_observer`], used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Synchronous fan-out of run notifications.
///
/// Delivery happens inline on the calling run, in registration order. The
/// registry is snapshotted before each notification, so observers can be
/// added or removed from any thread (or from inside a callback) while runs
/// are in flight; a change takes effect from the next notification on.
#[derive(Default)]
pub struct ObserverHub {
    next_id: AtomicU64,
    observers: RwLock<Vec<(ObserverId, Arc<dyn RunObserver>)>>,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&self, observer: Arc<dyn RunObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().push((id, observer));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn run_started(&self, run_id: &RunId, context: &ExecutionContext) {
        for observer in self.snapshot() {
            observer.on_run_started(run_id, context);
        }
    }

    pub fn node_started(&self, run_id: &RunId, node_id: &str, context: &ExecutionContext) {
        for observer in self.snapshot() {
            observer.on_node_started(run_id, node_id, context);
        }
    }

    pub fn node_completed(&self, run_id: &RunId, node_id: &str, delta: &ContextDelta) {
        for observer in self.snapshot() {
            observer.on_node_completed(run_id, node_id, delta);
        }
    }

    pub fn node_failed(&self, run_id: &RunId, node_id: &str, error: &StepflowError) {
        for observer in self.snapshot() {
            observer.on_node_failed(run_id, node_id, error);
        }
    }

    pub fn run_completed(&self, run_id: &RunId, context: &ExecutionContext, path: &ExecutionPath) {
        for observer in self.snapshot() {
            observer.on_run_completed(run_id, context, path);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn RunObserver>> {
        self.read().iter().map(|(_, o)| o.clone()).collect()
    }

    // A panicking observer must not wedge the registry for everyone else.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<(ObserverId, Arc<dyn RunObserver>)>> {
        self.observers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<(ObserverId, Arc<dyn RunObserver>)>> {
        self.observers.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ObserverHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHub")
            .field("observers", &self.len())
            .finish()
    }
}
