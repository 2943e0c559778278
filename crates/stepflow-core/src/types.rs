use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reserved context key holding the run's input.
pub const INPUT_KEY: &str = "input";

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key-value store threaded through a single run.
///
/// Keys are strings; values are JSON so every node sees the same uniform
/// shape. The engine owns one of these per run and grows it by merging each
/// node's [`ContextDelta`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    data: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the initial context for a run: only `input` is present.
    pub fn seeded(input: Value) -> Self {
        let mut data = HashMap::new();
        data.insert(INPUT_KEY.to_string(), input);
        Self { data }
    }

    /// Create a context from initial data.
    pub fn from_map(data: HashMap<String, Value>) -> Self {
        Self { data }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Get a value as an integer, if it's an integer.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(|v| v.as_i64())
    }

    /// The run input, if present.
    pub fn input(&self) -> Option<&Value> {
        self.data.get(INPUT_KEY)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Shallow merge: every key in `delta` replaces the current value
    /// wholesale. Nested objects are never merged recursively.
    pub fn merge(&mut self, delta: &ContextDelta) {
        for (k, v) in &delta.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }

    /// Render the context as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// A node's own contribution to the context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextDelta {
    data: HashMap<String, Value>,
}

impl ContextDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl From<HashMap<String, Value>> for ContextDelta {
    fn from(data: HashMap<String, Value>) -> Self {
        Self { data }
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for ContextDelta {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            data: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Ordered, repeat-inclusive list of node ids visited during one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPath(Vec<String>);

impl ExecutionPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node_id: impl Into<String>) {
        self.0.push(node_id.into());
    }

    /// How many times `node_id` appears in the path so far.
    pub fn visits(&self, node_id: &str) -> usize {
        self.0.iter().filter(|id| *id == node_id).count()
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }
}

impl std::fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join(" -> "))
    }
}

/// Lifecycle events published on the [`crate::EventBus`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Run started with its seeded context.
    RunStarted { run_id: RunId, context: Value },
    /// A node is about to be invoked.
    NodeStarted { run_id: RunId, node_id: String },
    /// A node finished (possibly via its failure handler).
    NodeCompleted {
        run_id: RunId,
        node_id: String,
        delta: Value,
    },
    /// A node failed and the failure was not absorbed.
    NodeFailed {
        run_id: RunId,
        node_id: String,
        error: String,
    },
    /// The run reached a terminal state.
    RunCompleted {
        run_id: RunId,
        context: Value,
        path: Vec<String>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeCompleted { run_id, .. }
            | Self::NodeFailed { run_id, .. }
            | Self::RunCompleted { run_id, .. } => run_id,
        }
    }

    /// Short name used in log files.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeCompleted { .. } => "node_completed",
            Self::NodeFailed { .. } => "node_failed",
            Self::RunCompleted { .. } => "run_completed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seeded_context() {
        let ctx = ExecutionContext::seeded(json!("hello"));
        assert_eq!(ctx.input(), Some(&json!("hello")));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_merge_last_write_wins() {
        let mut ctx = ExecutionContext::new();
        ctx.set("a", json!("1"));
        ctx.set("b", json!("2"));

        let delta = ContextDelta::new()
            .with("b", json!("overwritten"))
            .with("c", json!("3"));
        ctx.merge(&delta);

        assert_eq!(ctx.get_str("a"), Some("1"));
        assert_eq!(ctx.get_str("b"), Some("overwritten"));
        assert_eq!(ctx.get_str("c"), Some("3"));
    }

    #[test]
    fn test_merge_is_shallow() {
        let mut ctx = ExecutionContext::new();
        ctx.set("doc", json!({"title": "a", "tags": ["x"]}));

        ctx.merge(&ContextDelta::new().with("doc", json!({"tags": ["y"]})));

        // Nested objects are replaced, not merged
        assert_eq!(ctx.get("doc"), Some(&json!({"tags": ["y"]})));
    }

    #[test]
    fn test_delta_from_iter() {
        let delta: ContextDelta = vec![("k", json!(1)), ("j", json!(true))]
            .into_iter()
            .collect();
        assert_eq!(delta.len(), 2);
        assert_eq!(delta.get("k"), Some(&json!(1)));
    }

    #[test]
    fn test_path_visits() {
        let mut path = ExecutionPath::new();
        path.push("a");
        path.push("b");
        path.push("b");
        assert_eq!(path.visits("a"), 1);
        assert_eq!(path.visits("b"), 2);
        assert_eq!(path.visits("c"), 0);
        assert_eq!(path.last(), Some("b"));
        assert_eq!(path.to_string(), "a -> b -> b");
    }

    #[test]
    fn test_run_event_serialization() {
        let event = RunEvent::NodeFailed {
            run_id: RunId::from_str("r1"),
            node_id: "search".into(),
            error: "boom".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "node_failed");
        assert_eq!(json["node_id"], "search");
        assert_eq!(event.kind(), "node_failed");
        assert_eq!(event.run_id().0, "r1");
    }
}
