//! `loop` evaluation.

use crate::core::{Input, StepLoop};
use crate::definition::StepDefinition;
use crate::errors::ErrorModel;
use crate::eval::{EvalContext, ExpressionEvaluator};

/// Decides whether a step loops again.
///
/// `until` is evaluated with the index of the iteration that just ran. When
/// it is false, the step inputs are re-resolved with the next index and the
/// loop's own input overrides, evaluated with the current index, are merged
/// over them.
pub fn calculate_loop(
    current: Option<&StepLoop>,
    step: &StepDefinition,
    evaluator: &dyn ExpressionEvaluator,
    ctx: &EvalContext,
) -> Result<Option<StepLoop>, ErrorModel> {
    let Some(config) = step.loop_config() else {
        return Ok(None);
    };

    let index = current.map_or(0, |step_loop| step_loop.index);
    let current_ctx = ctx.clone().with_loop_index(index);

    if evaluator.evaluate_bool(&config.until, &current_ctx)? {
        tracing::debug!(step = %step.full_name(), index, "Loop completed");
        return Ok(Some(StepLoop {
            index,
            input: None,
            loop_completed: true,
        }));
    }

    let next = index + 1;
    let next_ctx = ctx.clone().with_loop_index(next);
    let mut input: Input = evaluator.resolve_inputs(step.inputs(), &next_ctx)?;
    input.extend(evaluator.resolve_inputs(&config.inputs, &current_ctx)?);

    tracing::debug!(step = %step.full_name(), index = next, "Loop continues");
    Ok(Some(StepLoop {
        index: next,
        input: Some(input),
        loop_completed: false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StepType;
    use crate::definition::LoopConfig;
    use crate::testing::ScriptedEvaluator;
    use serde_json::json;

    fn looping_step() -> StepDefinition {
        StepDefinition::new(StepType::Echo, "count")
            .with_input("index", "loop.index")
            .with_loop(LoopConfig::new("loop.index >= 2").with_input("previous", "loop.index"))
    }

    fn evaluator() -> ScriptedEvaluator {
        ScriptedEvaluator::new().on("loop.index >= 2", |ctx| {
            Ok(json!(ctx.loop_index.unwrap_or_default() >= 2))
        })
    }

    #[test]
    fn test_until_uses_current_index_inputs_use_next() {
        let step_loop = calculate_loop(None, &looping_step(), &evaluator(), &EvalContext::default())
            .unwrap()
            .unwrap();

        assert_eq!(step_loop.index, 1);
        assert!(!step_loop.loop_completed);
        let input = step_loop.input.unwrap();
        assert_eq!(input["index"], json!(1));
        assert_eq!(input["previous"], json!(0));
    }

    #[test]
    fn test_loop_completes() {
        let current = StepLoop {
            index: 2,
            input: None,
            loop_completed: false,
        };
        let step_loop = calculate_loop(
            Some(&current),
            &looping_step(),
            &evaluator(),
            &EvalContext::default(),
        )
        .unwrap()
        .unwrap();

        assert_eq!(step_loop.index, 2);
        assert!(step_loop.loop_completed);
        assert!(step_loop.input.is_none());
    }

    #[test]
    fn test_no_loop_block() {
        let step = StepDefinition::new(StepType::Echo, "once");
        assert!(calculate_loop(None, &step, &evaluator(), &EvalContext::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_until_error_propagates() {
        let step = StepDefinition::new(StepType::Echo, "bad").with_loop(LoopConfig::new("nope"));
        assert!(calculate_loop(None, &step, &evaluator(), &EvalContext::default()).is_err());
    }
}
