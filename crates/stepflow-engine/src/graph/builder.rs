use super::definition::{Component, GraphDefinition};
use super::edge::Edge;
use super::node::Node;

/// Fluent construction of a [`GraphDefinition`].
///
/// ```ignore
/// let graph = GraphBuilder::new("analyze")
///     .output_key("answer")
///     .node(analyze)
///     .node(answer)
///     .edge(Edge::always("analyze", "answer"))
///     .build();
/// ```
#[derive(Debug)]
pub struct GraphBuilder {
    start_node: String,
    output_key: String,
    components: Vec<Component>,
}

impl GraphBuilder {
    /// Start a graph at `start_node`. The output key defaults to `"output"`.
    pub fn new(start_node: impl Into<String>) -> Self {
        Self {
            start_node: start_node.into(),
            output_key: "output".to_string(),
            components: Vec::new(),
        }
    }

    /// Set the key whose value is returned from a successful run.
    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = key.into();
        self
    }

    /// Add a node.
    pub fn node(mut self, node: Node) -> Self {
        self.components.push(Component::Node(node));
        self
    }

    /// Add an edge.
    pub fn edge(mut self, edge: Edge) -> Self {
        self.components.push(Component::Edge(edge));
        self
    }

    /// Chain unconditional edges through `ids` in order.
    pub fn chain<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        for pair in ids.windows(2) {
            self.components
                .push(Component::Edge(Edge::always(pair[0].clone(), pair[1].clone())));
        }
        self
    }

    pub fn build(self) -> GraphDefinition {
        GraphDefinition::from_components(self.start_node, self.output_key, self.components)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_core::types::ContextDelta;

    fn noop(id: &str) -> Node {
        Node::from_fn(id, |_ctx| async { Ok(ContextDelta::new()) })
    }

    #[test]
    fn test_builder_defaults() {
        let graph = GraphBuilder::new("a").node(noop("a")).build();
        assert_eq!(graph.start_node_id(), "a");
        assert_eq!(graph.output_key(), "output");
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn test_builder_chain() {
        let graph = GraphBuilder::new("analyze")
            .output_key("answer")
            .node(noop("analyze"))
            .node(noop("search"))
            .node(noop("answer"))
            .chain(["analyze", "search", "answer"])
            .build();

        assert_eq!(graph.output_key(), "answer");
        assert_eq!(graph.node_count(), 3);
        let pairs: Vec<(&str, &str)> = graph
            .edges()
            .iter()
            .map(|e| (e.from.as_str(), e.to.as_str()))
            .collect();
        assert_eq!(pairs, vec![("analyze", "search"), ("search", "answer")]);
    }
}
