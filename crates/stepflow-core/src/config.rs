use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepflowError};

/// Top-level Stepflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Maximum visits to a single node within one run before the cycle
    /// guard aborts it.
    #[serde(default = "default_max_visits")]
    pub max_visits: usize,
    /// Capacity of the broadcast channel backing the event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
    /// Timeout applied to manifest nodes that don't declare their own.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_visits: default_max_visits(),
            event_bus_capacity: default_event_bus_capacity(),
            default_timeout_ms: None,
            workspace: default_workspace(),
        }
    }
}

fn default_max_visits() -> usize { 3 }
fn default_event_bus_capacity() -> usize { 256 }
fn default_workspace() -> String { "~/.stepflow".to_string() }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = run summary only, 2 = node outcomes, 3 = every event (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| StepflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine can't run with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_visits == 0 {
            return Err(StepflowError::Config(
                "engine.max_visits must be at least 1".into(),
            ));
        }
        if let Some(log) = &self.log {
            if !(1..=3).contains(&log.level) {
                return Err(StepflowError::Config(format!(
                    "log.level must be 1, 2 or 3 (got {})",
                    log.level
                )));
            }
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.engine.workspace;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    /// Directory for JSONL run logs, if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match &log.log_dir {
            Some(dir) => PathBuf::from(dir),
            None => self.workspace_dir().join("logs"),
        })
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_STEPFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_STEPFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_STEPFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_STEPFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_STEPFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_visits, 3);
        assert_eq!(config.engine.event_bus_capacity, 256);
        assert!(config.engine.default_timeout_ms.is_none());
        assert!(config.log.is_none());
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn test_log_section_defaults() {
        let toml_str = r#"
[engine]
workspace = "/tmp/stepflow-ws"

[log]
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        let log = config.log.as_ref().unwrap();
        assert!(log.enabled);
        assert_eq!(log.level, 2);
        assert_eq!(
            config.log_dir(),
            Some(PathBuf::from("/tmp/stepflow-ws/logs"))
        );
    }

    #[test]
    fn test_disabled_log_has_no_dir() {
        let toml_str = r#"
[log]
enabled = false
log_dir = "/tmp/never"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn test_validate_rejects_zero_visits() {
        let mut config = EngineConfig::default();
        config.engine.max_visits = 0;
        assert!(matches!(config.validate(), Err(StepflowError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let config = EngineConfig {
            log: Some(LogConfig {
                level: 7,
                ..LogConfig::default()
            }),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load(Path::new("/nonexistent/stepflow.toml")).unwrap_err();
        assert!(matches!(err, StepflowError::ConfigNotFound(_)));
    }
}
