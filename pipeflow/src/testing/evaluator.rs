//! Scripted expression evaluator.

use crate::errors::ErrorModel;
use crate::eval::{EvalContext, Expr, ExpressionEvaluator, PathEvaluator};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

type Script = Box<dyn Fn(&EvalContext) -> Result<Value, ErrorModel> + Send + Sync>;

/// Evaluates registered expressions with closures and everything else with
/// [`PathEvaluator`].
///
/// ```rust,ignore
/// let evaluator = ScriptedEvaluator::new()
///     .on("loop.index >= 2", |ctx| Ok(json!(ctx.loop_index.unwrap_or_default() >= 2)));
/// ```
#[derive(Default)]
pub struct ScriptedEvaluator {
    scripts: HashMap<String, Script>,
}

impl ScriptedEvaluator {
    /// Creates an evaluator with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the closure evaluating `source`.
    #[must_use]
    pub fn on<F>(mut self, source: impl Into<String>, script: F) -> Self
    where
        F: Fn(&EvalContext) -> Result<Value, ErrorModel> + Send + Sync + 'static,
    {
        self.scripts.insert(source.into(), Box::new(script));
        self
    }

    /// Makes `source` always fail to evaluate.
    #[must_use]
    pub fn failing(self, source: impl Into<String>) -> Self {
        let source = source.into();
        let detail = format!("cannot evaluate '{source}'");
        self.on(source, move |_| Err(ErrorModel::bad_request(detail.clone())))
    }
}

impl fmt::Debug for ScriptedEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sources: Vec<_> = self.scripts.keys().collect();
        sources.sort();
        f.debug_struct("ScriptedEvaluator")
            .field("scripts", &sources)
            .finish()
    }
}

impl ExpressionEvaluator for ScriptedEvaluator {
    fn evaluate(&self, expr: &Expr, ctx: &EvalContext) -> Result<Value, ErrorModel> {
        match self.scripts.get(expr.source()) {
            Some(script) => script(ctx),
            None => PathEvaluator.evaluate(expr, ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_script_takes_precedence() {
        let evaluator = ScriptedEvaluator::new().on("param.count > 1", |ctx| {
            Ok(json!(ctx.params.get("count").and_then(Value::as_i64) > Some(1)))
        });
        let mut params = crate::core::Input::new();
        params.insert("count".to_string(), json!(3));
        let ctx = EvalContext::new(params);

        assert!(evaluator.evaluate_bool(&"param.count > 1".into(), &ctx).unwrap());
        assert_eq!(evaluator.evaluate(&"param.count".into(), &ctx).unwrap(), json!(3));
    }

    #[test]
    fn test_failing_script() {
        let evaluator = ScriptedEvaluator::new().failing("broken");
        let err = evaluator
            .evaluate(&"broken".into(), &EvalContext::default())
            .unwrap_err();
        assert_eq!(err.status, 400);
        assert!(format!("{evaluator:?}").contains("broken"));
    }
}
