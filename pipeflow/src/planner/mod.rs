//! Decides what runs next.
//!
//! [`plan_pipeline`] walks the step definitions in declaration order and
//! returns every step that became ready in one pass. Steps with `for_each`
//! are returned undivided; [`plan_for_each`] expands them into one
//! [`NextStep`](crate::core::NextStep) per branch. [`plan_unqueued`] finds
//! the steps a pause cut off between planning and queueing.

mod for_each;
mod pipeline;

pub use for_each::plan_for_each;
pub use pipeline::{plan_pipeline, plan_unqueued};

use crate::core::{Input, NextStep, NextStepAction, StepForEach, StepLoop};
use crate::definition::StepDefinition;
use crate::errors::PipeflowError;
use crate::eval::{EvalContext, ExpressionEvaluator};

/// Evaluates `if` and inputs for one step instance.
///
/// `ctx` must already carry `each` for for-each branches. Looping steps see
/// `loop.index = 0`.
fn plan_instance(
    step: &StepDefinition,
    step_for_each: StepForEach,
    ctx: EvalContext,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<NextStep, PipeflowError> {
    let full_name = step.full_name();
    let ctx = if step.loop_config().is_some() {
        ctx.with_loop_index(0)
    } else {
        ctx
    };

    if let Some(condition) = step.if_condition() {
        if !evaluator.evaluate_bool(condition, &ctx)? {
            tracing::debug!(step = %full_name, key = %step_for_each.key, "Step skipped by if condition");
            return Ok(NextStep::new(full_name, NextStepAction::Skip)
                .with_input(Input::new())
                .with_for_each(step_for_each));
        }
    }

    let input = evaluator.resolve_inputs(step.inputs(), &ctx)?;
    let mut next_step = NextStep::new(full_name, NextStepAction::Start)
        .with_input(input)
        .with_for_each(step_for_each)
        .with_max_concurrency(step.max_concurrency());
    if step.loop_config().is_some() {
        next_step = next_step.with_loop(StepLoop::first());
    }
    Ok(next_step)
}
