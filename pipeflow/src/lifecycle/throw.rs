//! `throw` clause evaluation.

use crate::definition::StepDefinition;
use crate::errors::ErrorModel;
use crate::eval::{EvalContext, ExpressionEvaluator};
use serde_json::Value;

/// Message used when a clause has none.
pub const DEFAULT_THROW_MESSAGE: &str = "User defined error";

/// Returns the error raised by the first clause whose condition is true.
pub fn calculate_throw(
    step: &StepDefinition,
    evaluator: &dyn ExpressionEvaluator,
    ctx: &EvalContext,
) -> Result<Option<ErrorModel>, ErrorModel> {
    for clause in step.throw_config() {
        if !evaluator.evaluate_bool(&clause.if_condition, ctx)? {
            continue;
        }

        let message = match &clause.message {
            Some(message) => match evaluator.evaluate(message, ctx)? {
                Value::String(text) => text,
                other => other.to_string(),
            },
            None => DEFAULT_THROW_MESSAGE.to_string(),
        };
        tracing::debug!(step = %step.full_name(), %message, "Throw condition met");
        return Ok(Some(ErrorModel::user_defined(message)));
    }
    Ok(None)
}
