use std::collections::HashMap;

use tracing::debug;

use super::edge::Edge;
use super::node::Node;

/// One entry in a component list handed over by a graph builder.
#[derive(Debug, Clone)]
pub enum Component {
    Node(Node),
    Edge(Edge),
}

impl From<Node> for Component {
    fn from(node: Node) -> Self {
        Self::Node(node)
    }
}

impl From<Edge> for Component {
    fn from(edge: Edge) -> Self {
        Self::Edge(edge)
    }
}

/// The structure of a workflow: nodes by id, edges in declaration order,
/// the start node and the key whose value is the run's output.
///
/// Only appended to while it is being built. Once handed to a
/// [`super::WorkflowEngine`] it sits behind an `Arc` and is never mutated
/// again, so concurrent runs can share it freely.
#[derive(Debug, Clone)]
pub struct GraphDefinition {
    nodes: HashMap<String, Node>,
    edges: Vec<Edge>,
    start_node: String,
    output_key: String,
}

impl GraphDefinition {
    /// Create an empty graph.
    ///
    /// `start_node` does not need to be registered yet; a missing start node
    /// is reported when a run begins.
    pub fn new(start_node: impl Into<String>, output_key: impl Into<String>) -> Self {
        Self {
            nodes: HashMap::new(),
            edges: Vec::new(),
            start_node: start_node.into(),
            output_key: output_key.into(),
        }
    }

    /// Partition an ordered component list into nodes and edges.
    pub fn from_components(
        start_node: impl Into<String>,
        output_key: impl Into<String>,
        components: impl IntoIterator<Item = Component>,
    ) -> Self {
        let mut graph = Self::new(start_node, output_key);
        for component in components {
            match component {
                Component::Node(node) => graph.add_node(node),
                Component::Edge(edge) => graph.add_edge(edge),
            }
        }
        graph
    }

    /// Register a node. A node with the same id is replaced.
    pub fn add_node(&mut self, node: Node) {
        if self.nodes.contains_key(node.id()) {
            debug!(node_id = %node.id(), "Replacing previously registered node");
        }
        self.nodes.insert(node.id().to_string(), node);
    }

    /// Append an edge. Endpoints are not checked here.
    pub fn add_edge(&mut self, edge: Edge) {
        self.edges.push(edge);
    }

    /// Registered node ids, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All edges in declaration order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn start_node_id(&self) -> &str {
        &self.start_node
    }

    pub fn output_key(&self) -> &str {
        &self.output_key
    }

    /// Edge endpoints that don't name a registered node.
    ///
    /// The engine doesn't require this to be empty; it only reports
    /// NodeNotFound if a run actually reaches such an id.
    pub fn dangling_targets(&self) -> Vec<&str> {
        let mut missing: Vec<&str> = self
            .edges
            .iter()
            .flat_map(|e| [e.from.as_str(), e.to.as_str()])
            .filter(|id| !self.nodes.contains_key(*id))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }
}
