use tracing::trace;

use stepflow_core::types::ExecutionContext;

use super::edge::Edge;

/// Pick the next node after `current`.
///
/// Scans the outgoing edges of `current` in declaration order and returns
/// the target of the first one whose condition holds. `None` means the run
/// ends here normally.
pub fn next_node<'a>(edges: &'a [Edge], current: &str, ctx: &ExecutionContext) -> Option<&'a str> {
    let edge = edges
        .iter()
        .filter(|e| e.from == current)
        .find(|e| e.matches(ctx))?;

    trace!(from = %current, to = %edge.to, label = ?edge.label, "Edge selected");
    Some(edge.to.as_str())
}
