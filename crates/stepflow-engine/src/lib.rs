pub mod builtin;
pub mod graph;
pub mod manifest;
pub mod observers;
pub mod run_log;

pub use graph::{
    Component, Edge, EdgeCondition, GraphBuilder, GraphDefinition, Node, ObserverHub, ObserverId,
    RetryPolicy, RunReport, WorkflowEngine,
};
pub use manifest::WorkflowManifest;
pub use observers::{EventBusObserver, TracingObserver};
pub use run_log::RunLogger;
