//! Graph Execution Engine: conditional multi-step workflow execution.
//!
//! A workflow is a directed graph of `Node`s connected by `Edge`s. Each node
//! wraps a handler plus optional retry, timeout and failure-handler policies.
//! Edges are scanned in declaration order and the first one whose condition
//! holds is taken; exactly one edge is followed per step.
//!
//! The `WorkflowEngine` walks the graph from the start node, merging each
//! node's delta into a per-run `ExecutionContext` and notifying registered
//! observers along the way.

pub mod builder;
pub mod definition;
pub mod edge;
pub mod executor;
pub mod invoker;
pub mod node;
pub mod observer;
pub mod router;

pub use builder::GraphBuilder;
pub use definition::{Component, GraphDefinition};
pub use edge::{evaluate_condition, Edge, EdgeCondition};
pub use executor::{RunReport, WorkflowEngine, DEFAULT_MAX_VISITS};
pub use invoker::invoke_node;
pub use node::{Node, RetryPolicy};
pub use observer::{ObserverHub, ObserverId};
pub use router::next_node;
