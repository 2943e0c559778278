use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepflowError {
    // Structural errors, raised by the engine itself
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid workflow: node '{node}' would be visited {visits} times (limit {limit})")]
    InvalidWorkflow {
        node: String,
        visits: usize,
        limit: usize,
    },

    #[error("Output key missing from final context: {0}")]
    OutputKeyMissing(String),

    #[error("Node timeout after {timeout_ms}ms: {node}")]
    Timeout { node: String, timeout_ms: u64 },

    // Node logic errors
    #[error("Handler failed: {0}")]
    Handler(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Workflow manifest error: {0}")]
    Manifest(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StepflowError {
    /// Shorthand for a handler failure with a message.
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Whether this error originated in the engine rather than node logic.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::NodeNotFound(_)
                | Self::InvalidWorkflow { .. }
                | Self::OutputKeyMissing(_)
                | Self::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, StepflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_kinds() {
        assert!(StepflowError::NodeNotFound("a".into()).is_structural());
        assert!(StepflowError::OutputKeyMissing("answer".into()).is_structural());
        assert!(StepflowError::Timeout {
            node: "a".into(),
            timeout_ms: 10
        }
        .is_structural());
        assert!(!StepflowError::handler("boom").is_structural());
        assert!(!StepflowError::Config("bad".into()).is_structural());
    }

    #[test]
    fn display_messages() {
        let e = StepflowError::InvalidWorkflow {
            node: "b".into(),
            visits: 4,
            limit: 3,
        };
        assert_eq!(
            e.to_string(),
            "Invalid workflow: node 'b' would be visited 4 times (limit 3)"
        );
        assert_eq!(
            StepflowError::handler("boom").to_string(),
            "Handler failed: boom"
        );
    }
}
