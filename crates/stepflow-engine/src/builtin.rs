use std::collections::HashMap;

use futures::future::BoxFuture;
use serde_json::Value;

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::{FailureHandler, NodeHandler};
use stepflow_core::types::{ContextDelta, ExecutionContext, INPUT_KEY};

/// Handlers usable from declarative workflows without writing Rust.
#[derive(Debug, Clone, PartialEq)]
pub enum Builtin {
    /// Write fixed values.
    Set(HashMap<String, Value>),
    /// Copy one context key to another. Fails if `from` is absent.
    Copy { from: String, to: String },
    /// Render `{key}` placeholders from the context into a string.
    Template { template: String, into: String },
    /// Add `by` to an integer key, treating a missing key as 0.
    Increment { key: String, by: i64 },
    /// Always fail with `message`.
    Fail { message: String },
    /// Write the run input under `into`.
    Echo { into: String },
}

impl Builtin {
    pub fn kind(&self) -> &'static str {
        match self {
            Builtin::Set(_) => "set",
            Builtin::Copy { .. } => "copy",
            Builtin::Template { .. } => "template",
            Builtin::Increment { .. } => "increment",
            Builtin::Fail { .. } => "fail",
            Builtin::Echo { .. } => "echo",
        }
    }

    fn apply(&self, ctx: &ExecutionContext) -> Result<ContextDelta> {
        match self {
            Builtin::Set(values) => Ok(ContextDelta::from(values.clone())),
            Builtin::Copy { from, to } => {
                let value = ctx
                    .get(from)
                    .ok_or_else(|| StepflowError::handler(format!("copy: key '{}' not set", from)))?;
                Ok(ContextDelta::new().with(to.clone(), value.clone()))
            }
            Builtin::Template { template, into } => {
                let rendered = render_template(template, ctx)?;
                Ok(ContextDelta::new().with(into.clone(), Value::String(rendered)))
            }
            Builtin::Increment { key, by } => {
                let current = match ctx.get(key) {
                    None | Some(Value::Null) => 0,
                    Some(v) => v.as_i64().ok_or_else(|| {
                        StepflowError::handler(format!("increment: '{}' is not an integer", key))
                    })?,
                };
                let next = current.checked_add(*by).ok_or_else(|| {
                    StepflowError::handler(format!("increment: '{}' overflowed", key))
                })?;
                Ok(ContextDelta::new().with(key.clone(), Value::from(next)))
            }
            Builtin::Fail { message } => Err(StepflowError::handler(message.clone())),
            Builtin::Echo { into } => {
                let input = ctx.input().cloned().unwrap_or(Value::Null);
                Ok(ContextDelta::new().with(into.clone(), input))
            }
        }
    }
}

impl NodeHandler for Builtin {
    fn handle(&self, ctx: ExecutionContext) -> BoxFuture<'_, Result<ContextDelta>> {
        Box::pin(async move { self.apply(&ctx) })
    }
}

/// Failure handler that writes fixed values in place of the failed node's
/// output.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticFallback {
    values: HashMap<String, Value>,
    /// Key receiving the error message, if any.
    error_key: Option<String>,
}

impl StaticFallback {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self {
            values,
            error_key: None,
        }
    }

    /// Also record the error message under `key`.
    pub fn with_error_key(mut self, key: impl Into<String>) -> Self {
        self.error_key = Some(key.into());
        self
    }
}

impl FailureHandler for StaticFallback {
    fn recover(
        &self,
        error: StepflowError,
        _ctx: ExecutionContext,
    ) -> BoxFuture<'_, Result<ContextDelta>> {
        Box::pin(async move {
            let mut delta = ContextDelta::from(self.values.clone());
            if let Some(key) = &self.error_key {
                delta.set(key.clone(), Value::String(error.to_string()));
            }
            Ok(delta)
        })
    }
}

/// Substitute `{key}` placeholders with context values. Strings are inserted
/// without quotes, other values as compact JSON. `{{` and `}}` are literal
/// braces. `{input}` refers to the run input.
pub fn render_template(template: &str, ctx: &ExecutionContext) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            return Err(StepflowError::handler("template: unmatched '}'"));
        }

        let Some(close) = tail.find('}') else {
            return Err(StepflowError::handler("template: unclosed '{'"));
        };
        let key = tail[1..close].trim();
        let key = if key.is_empty() { INPUT_KEY } else { key };
        match ctx.get(key) {
            Some(Value::String(s)) => out.push_str(s),
            Some(v) => out.push_str(&v.to_string()),
            None => {
                return Err(StepflowError::handler(format!(
                    "template: key '{}' not set",
                    key
                )))
            }
        }
        rest = &tail[close + 1..];
    }

    out.push_str(rest);
    Ok(out)
}
