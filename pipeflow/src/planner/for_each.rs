//! For-each expansion.

use super::plan_instance;
use crate::core::{NextStep, StepForEach};
use crate::definition::PipelineDefinition;
use crate::errors::PipeflowError;
use crate::eval::ExpressionEvaluator;
use crate::execution::{PipelineExecution, StepStatus};
use serde_json::Value;

/// Expands a `for_each` step into one next step per branch not yet planned.
///
/// A list yields keys `"0".."n-1"` with `each.key` the index; an object
/// yields its keys with `each.key` the key. Any other value is rejected.
pub fn plan_for_each(
    pex: &PipelineExecution,
    defn: &PipelineDefinition,
    step_name: &str,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<Vec<NextStep>, PipeflowError> {
    plan_branches(pex, defn, step_name, evaluator, |status| status.is_none())
}

/// Expands the branches whose current status `wanted` accepts.
pub(super) fn plan_branches(
    pex: &PipelineExecution,
    defn: &PipelineDefinition,
    step_name: &str,
    evaluator: &dyn ExpressionEvaluator,
    wanted: fn(Option<&StepStatus>) -> bool,
) -> Result<Vec<NextStep>, PipeflowError> {
    let step = defn.step(step_name).ok_or_else(|| {
        PipeflowError::not_found(format!("step {step_name} in pipeline {}", defn.name()))
    })?;
    let for_each = step.for_each().ok_or_else(|| {
        PipeflowError::bad_request(format!("step {step_name} does not have a for_each"))
    })?;

    let ctx = pex.eval_context();
    let branches: Vec<(String, Value, Value)> = match evaluator.evaluate(for_each, &ctx)? {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, value)| (index.to_string(), Value::from(index), value))
            .collect(),
        Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| (key.clone(), Value::String(key), value))
            .collect(),
        other => {
            return Err(PipeflowError::bad_request(format!(
                "for_each of step {step_name} must be a list or a map, got {other}"
            )))
        }
    };

    let total_count = branches.len();
    let planned = pex.step_status.get(step_name);
    let mut next_steps = Vec::new();
    for (key, each_key, each_value) in branches {
        if !wanted(planned.and_then(|statuses| statuses.get(&key))) {
            continue;
        }
        let branch_ctx = ctx.clone().with_each(each_key.clone(), each_value.clone());
        next_steps.push(plan_instance(
            step,
            StepForEach::branch(key, total_count, each_value).with_each_key(each_key),
            branch_ctx,
            evaluator,
        )?);
    }

    tracing::debug!(
        pex_id = %pex.id,
        step = step_name,
        total_count,
        planned = next_steps.len(),
        "Planned for_each"
    );
    Ok(next_steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Input, NextStepAction, StepType};
    use crate::definition::StepDefinition;
    use crate::eval::PathEvaluator;
    use serde_json::json;

    fn defn(for_each: &str) -> PipelineDefinition {
        PipelineDefinition::new("deploy").with_step(
            StepDefinition::new(StepType::Echo, "each")
                .with_for_each(for_each)
                .with_input("text", "each.value")
                .with_max_concurrency(2),
        )
    }

    fn pex() -> PipelineExecution {
        PipelineExecution::new("pexec_1", "deploy", Input::new())
    }

    #[test]
    fn test_list_branches() {
        let next = plan_for_each(&pex(), &defn("[\"a\", \"b\"]"), "echo.each", &PathEvaluator).unwrap();
        assert_eq!(next.len(), 2);

        let second = next[1].step_for_each.as_ref().unwrap();
        assert_eq!(second.key, "1");
        assert_eq!(second.each_key, json!(1));
        assert_eq!(second.total_count, 2);
        assert!(second.for_each_step);
        assert_eq!(next[1].input["text"], json!("b"));
        assert_eq!(next[1].max_concurrency, Some(2));
        assert_eq!(next[1].action, NextStepAction::Start);
    }

    #[test]
    fn test_map_branches() {
        let next = plan_for_each(
            &pex(),
            &defn("{\"x\": 1, \"y\": 2}"),
            "echo.each",
            &PathEvaluator,
        )
        .unwrap();
        let keys: Vec<_> = next
            .iter()
            .map(|step| step.step_for_each.as_ref().unwrap().key.clone())
            .collect();
        assert_eq!(keys, vec!["x", "y"]);
        assert_eq!(next[0].input["text"], json!(1));
    }

    #[test]
    fn test_existing_branches_skipped() {
        let mut pex = pex();
        pex.step_status
            .entry("echo.each".to_string())
            .or_default()
            .insert("0".to_string(), StepStatus::initializing());
        let next = plan_for_each(&pex, &defn("[1, 2, 3]"), "echo.each", &PathEvaluator).unwrap();
        assert_eq!(next.len(), 2);
        assert_eq!(next[0].step_for_each.as_ref().unwrap().key, "1");
    }

    #[test]
    fn test_empty_list() {
        let next = plan_for_each(&pex(), &defn("[]"), "echo.each", &PathEvaluator).unwrap();
        assert!(next.is_empty());
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            plan_for_each(&pex(), &defn("3"), "echo.each", &PathEvaluator),
            Err(PipeflowError::BadRequest(_))
        ));
        assert!(matches!(
            plan_for_each(&pex(), &defn("[1]"), "echo.missing", &PathEvaluator),
            Err(PipeflowError::NotFound(_))
        ));

        let plain = PipelineDefinition::new("deploy").with_step(StepDefinition::new(StepType::Echo, "a"));
        assert!(matches!(
            plan_for_each(&pex(), &plain, "echo.a", &PathEvaluator),
            Err(PipeflowError::BadRequest(_))
        ));
    }
}
