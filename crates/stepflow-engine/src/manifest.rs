use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use stepflow_core::config::EngineConfig;
use stepflow_core::error::{Result, StepflowError};

use crate::builtin::{Builtin, StaticFallback};
use crate::graph::{Edge, GraphDefinition, Node, RetryPolicy};

/// TOML manifest for a declarative workflow built from [`Builtin`] nodes.
///
/// ```toml
/// start = "greet"
/// output_key = "greeting"
///
/// [[nodes]]
/// id = "greet"
/// kind = "template"
/// template = "Hello, {input}!"
/// into = "greeting"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowManifest {
    /// Display name, defaults to the file stem when loaded from disk.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub start: String,
    #[serde(default = "default_output_key")]
    pub output_key: String,
    #[serde(default)]
    pub nodes: Vec<NodeManifest>,
    #[serde(default)]
    pub edges: Vec<EdgeManifest>,
}

fn default_output_key() -> String {
    "output".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Set,
    Copy,
    Template,
    Increment,
    Fail,
    Echo,
}

/// One `[[nodes]]` entry. Which of the optional fields are required depends
/// on `kind`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeManifest {
    pub id: String,
    pub kind: NodeKind,

    /// `set`: values to write.
    #[serde(default)]
    pub values: HashMap<String, Value>,
    /// `copy`: source key.
    #[serde(default)]
    pub from: Option<String>,
    /// `copy`: destination key.
    #[serde(default)]
    pub to: Option<String>,
    /// `template`: text with `{key}` placeholders.
    #[serde(default)]
    pub template: Option<String>,
    /// `template` / `echo`: destination key (default: "output").
    #[serde(default)]
    pub into: Option<String>,
    /// `increment`: integer key.
    #[serde(default)]
    pub key: Option<String>,
    /// `increment`: amount to add.
    #[serde(default = "default_increment")]
    pub by: i64,
    /// `fail`: error message.
    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Values written in place of the node's output when it fails.
    #[serde(default)]
    pub fallback: Option<HashMap<String, Value>>,
    /// Key receiving the error message when the fallback runs.
    #[serde(default)]
    pub fallback_error_key: Option<String>,
}

fn default_increment() -> i64 {
    1
}

/// One `[[edges]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeManifest {
    pub from: String,
    pub to: String,
    /// Condition expression, see [`crate::graph::evaluate_condition`].
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

impl WorkflowManifest {
    /// Load and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StepflowError::Manifest(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut manifest = Self::parse(&content)?;
        if manifest.name.is_none() {
            manifest.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned());
        }
        debug!(path = %path.display(), nodes = manifest.nodes.len(), "Loaded workflow manifest");
        Ok(manifest)
    }

    /// Parse and validate manifest TOML.
    pub fn parse(content: &str) -> Result<Self> {
        let manifest: Self =
            toml::from_str(content).map_err(|e| StepflowError::Manifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check ids and per-kind required fields.
    ///
    /// Edges pointing at undeclared nodes are allowed; a run only fails if
    /// it actually reaches one.
    pub fn validate(&self) -> Result<()> {
        if self.start.trim().is_empty() {
            return Err(StepflowError::Manifest("start must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(StepflowError::Manifest("node id must not be empty".into()));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(StepflowError::Manifest(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
            node.builtin()?;
        }

        if !seen.contains(self.start.as_str()) {
            warn!(start = %self.start, "Start node is not declared in the manifest");
        }
        Ok(())
    }

    /// Build the graph using engine defaults.
    pub fn to_graph(&self) -> Result<GraphDefinition> {
        self.build_graph(&EngineConfig::default())
    }

    /// Build the graph. Nodes without their own `timeout_ms` get
    /// `engine.default_timeout_ms`, if set.
    pub fn build_graph(&self, config: &EngineConfig) -> Result<GraphDefinition> {
        let mut graph = GraphDefinition::new(self.start.clone(), self.output_key.clone());

        for spec in &self.nodes {
            let mut node = Node::new(spec.id.clone(), spec.builtin()?);
            if let Some(policy) = spec.retry {
                node = node.with_retry(RetryPolicy::new(policy.max_attempts, policy.delay));
            }
            if let Some(ms) = spec.timeout_ms.or(config.engine.default_timeout_ms) {
                node = node.with_timeout(Duration::from_millis(ms));
            }
            if let Some(values) = &spec.fallback {
                let mut fallback = StaticFallback::new(values.clone());
                if let Some(key) = &spec.fallback_error_key {
                    fallback = fallback.with_error_key(key.clone());
                }
                node = node.with_fallback(fallback);
            }
            graph.add_node(node);
        }

        for spec in &self.edges {
            let mut edge = match &spec.when {
                Some(expr) => Edge::conditional(spec.from.clone(), spec.to.clone(), expr.clone()),
                None => Edge::always(spec.from.clone(), spec.to.clone()),
            };
            if let Some(label) = &spec.label {
                edge = edge.with_label(label.clone());
            }
            graph.add_edge(edge);
        }

        Ok(graph)
    }
}

impl NodeManifest {
    /// Resolve the handler for this node's kind.
    pub fn builtin(&self) -> Result<Builtin> {
        let into = || self.into.clone().unwrap_or_else(default_output_key);
        let builtin = match self.kind {
            NodeKind::Set => Builtin::Set(self.values.clone()),
            NodeKind::Copy => Builtin::Copy {
                from: self.require(&self.from, "from")?,
                to: self.require(&self.to, "to")?,
            },
            NodeKind::Template => Builtin::Template {
                template: self.require(&self.template, "template")?,
                into: into(),
            },
            NodeKind::Increment => Builtin::Increment {
                key: self.require(&self.key, "key")?,
                by: self.by,
            },
            NodeKind::Fail => Builtin::Fail {
                message: self
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("node '{}' failed", self.id)),
            },
            NodeKind::Echo => Builtin::Echo { into: into() },
        };
        Ok(builtin)
    }

    fn require(&self, field: &Option<String>, name: &str) -> Result<String> {
        field.clone().ok_or_else(|| {
            StepflowError::Manifest(format!("node '{}' is missing required field '{}'", self.id, name))
        })
    }
}
