use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use stepflow_core::types::ExecutionContext;

/// Predicate over the current context. Must be pure and must not block.
pub type Predicate = Arc<dyn Fn(&ExecutionContext) -> bool + Send + Sync>;

/// An edge connecting two nodes in the execution graph.
#[derive(Clone)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Condition that must be true to traverse this edge.
    pub condition: EdgeCondition,
    /// Optional label, only used for display.
    pub label: Option<String>,
}

/// Condition for traversing an edge.
#[derive(Clone, Default)]
pub enum EdgeCondition {
    /// Always traverse this edge.
    #[default]
    Always,
    /// Traverse if a simple expression matches.
    /// See [`evaluate_condition`] for the supported forms.
    Expr(String),
    /// Traverse if the predicate returns true.
    Predicate(Predicate),
}

impl EdgeCondition {
    pub fn is_unconditional(&self) -> bool {
        matches!(self, Self::Always)
    }

    pub fn evaluate(&self, ctx: &ExecutionContext) -> bool {
        match self {
            Self::Always => true,
            Self::Expr(expr) => evaluate_condition(expr, ctx),
            Self::Predicate(p) => p(ctx),
        }
    }
}

impl fmt::Debug for EdgeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::Expr(expr) => f.debug_tuple("Expr").field(expr).finish(),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("condition", &self.condition)
            .field("label", &self.label)
            .finish()
    }
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Always,
            label: None,
        }
    }

    /// Create an edge guarded by a predicate.
    pub fn when<P>(from: impl Into<String>, to: impl Into<String>, predicate: P) -> Self
    where
        P: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Predicate(Arc::new(predicate)),
            label: None,
        }
    }

    /// Create an edge guarded by an expression.
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Expr(expr.into()),
            label: None,
        }
    }

    /// Set the label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Whether this edge may be taken from the given context.
    pub fn matches(&self, ctx: &ExecutionContext) -> bool {
        self.condition.evaluate(ctx)
    }
}

/// Evaluate a simple conditional expression against context data.
///
/// Supported expressions:
/// - `exists key`: key is present
/// - `key contains "substr"`: substring match on string values
/// - `key == "value"` / `key != "value"`: equality; the right side may be a
///   quoted string, a number, `true`/`false` or `null`
/// - `key < 3`, `key <= 3`, `key > 3`, `key >= 3`: numeric comparison
///
/// Returns `false` for unparseable expressions and for missing keys.
pub fn evaluate_condition(expr: &str, ctx: &ExecutionContext) -> bool {
    let expr = expr.trim();

    // exists key
    if let Some(key) = expr.strip_prefix("exists ") {
        return ctx.contains_key(key.trim());
    }

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return ctx
            .get_str(key)
            .is_some_and(|s| s.contains(unquote(substr)));
    }

    // key != value
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return ctx.get(key).is_some_and(|v| !literal_eq(v, value));
    }

    // key == value
    if let Some((key, value)) = parse_operator(expr, "==") {
        return ctx.get(key).is_some_and(|v| literal_eq(v, value));
    }

    // Two-character operators first so `<=` isn't read as `<`.
    for op in ["<=", ">=", "<", ">"] {
        if let Some((key, value)) = parse_operator(expr, op) {
            let (Some(lhs), Ok(rhs)) = (ctx.get(key).and_then(Value::as_f64), value.parse::<f64>())
            else {
                return false;
            };
            return match op {
                "<=" => lhs <= rhs,
                ">=" => lhs >= rhs,
                "<" => lhs < rhs,
                _ => lhs > rhs,
            };
        }
    }

    false
}

/// Parse `key OP value` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, val.trim()))
}

fn unquote(s: &str) -> &str {
    s.trim_matches('"')
}

/// Compare a context value against a literal from an expression.
fn literal_eq(value: &Value, literal: &str) -> bool {
    if literal.starts_with('"') {
        return value.as_str() == Some(unquote(literal));
    }
    match literal {
        "true" => value.as_bool() == Some(true),
        "false" => value.as_bool() == Some(false),
        "null" => value.is_null(),
        _ => match (value.as_f64(), literal.parse::<f64>()) {
            (Some(lhs), Ok(rhs)) => lhs == rhs,
            // Bare words compare as strings
            _ => value.as_str() == Some(literal),
        },
    }
}
