//! Expression evaluation seam.
//!
//! The definition language and its expression engine live outside this
//! crate. Definitions carry opaque [`Expr`] values and the engine resolves
//! them through an [`ExpressionEvaluator`] against an [`EvalContext`].

mod context;

pub use context::{Each, EvalContext};

use crate::core::Input;
use crate::errors::ErrorModel;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// An unevaluated expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Expr(String);

impl Expr {
    /// Wraps expression source text.
    pub fn new(source: impl Into<String>) -> Self {
        Self(source.into())
    }

    /// Returns the source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Expr {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

/// Resolves expressions to values.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluates an expression.
    fn evaluate(&self, expr: &Expr, ctx: &EvalContext) -> Result<Value, ErrorModel>;

    /// Evaluates an expression that must produce a boolean.
    fn evaluate_bool(&self, expr: &Expr, ctx: &EvalContext) -> Result<bool, ErrorModel> {
        match self.evaluate(expr, ctx)? {
            Value::Bool(value) => Ok(value),
            other => Err(ErrorModel::bad_request(format!(
                "expression '{expr}' must evaluate to a bool, got {other}"
            ))),
        }
    }

    /// Resolves a named set of expressions into an input map.
    fn resolve_inputs(
        &self,
        inputs: &BTreeMap<String, Expr>,
        ctx: &EvalContext,
    ) -> Result<Input, ErrorModel> {
        let mut resolved = Input::new();
        for (name, expr) in inputs {
            resolved.insert(name.clone(), self.evaluate(expr, ctx)?);
        }
        Ok(resolved)
    }
}

/// Minimal evaluator: JSON literals and dotted references.
///
/// `"[1, 2]"`, `"true"` and `"\"text\""` evaluate to themselves;
/// `param.x`, `step.http.a.status`, `each.value`, `loop.index` and
/// `result.errors` are looked up in the context.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathEvaluator;

impl PathEvaluator {
    const ROOTS: [&'static str; 5] = ["param", "step", "each", "loop", "result"];
}

impl ExpressionEvaluator for PathEvaluator {
    fn evaluate(&self, expr: &Expr, ctx: &EvalContext) -> Result<Value, ErrorModel> {
        let source = expr.source().trim();
        if let Ok(literal) = serde_json::from_str::<Value>(source) {
            return Ok(literal);
        }

        let root = source.split('.').next().unwrap_or_default();
        if !Self::ROOTS.contains(&root) {
            return Err(ErrorModel::bad_request(format!(
                "unsupported expression '{source}'"
            )));
        }

        ctx.lookup(source).ok_or_else(|| {
            ErrorModel::bad_request(format!("unresolved reference '{source}'"))
        })
    }
}
