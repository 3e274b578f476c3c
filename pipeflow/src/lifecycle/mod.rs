//! Step lifecycle: what happens after a primitive returns.
//!
//! A finished primitive is resolved in a fixed order:
//!
//! 1. the error config decides whether a failure is ignored;
//! 2. configured `output` values are evaluated;
//! 3. `throw` clauses may raise an error, bypassing retry;
//! 4. `retry` may re-queue a failed step with the same input;
//! 5. the error config is applied again, since a throw can fail a step
//!    whose primitive succeeded;
//! 6. `loop` may re-queue a successful (or ignored) step with new input.
//!
//! Any expression that fails to evaluate marks the output
//! [`FailureMode::Fatal`]: it can not be retried or looped.

mod loop_control;
mod retry;
mod throw;

pub use loop_control::calculate_loop;
pub use retry::{calculate_retry, BackoffStrategy, JitterStrategy, RetryConfig};
pub use throw::{calculate_throw, DEFAULT_THROW_MESSAGE};

use crate::core::{FailureMode, Input, Output, StepExecutionStatus, StepLoop, StepRetry};
use crate::definition::StepDefinition;
use crate::errors::{ErrorModel, StepError};
use crate::eval::{EvalContext, ExpressionEvaluator};

/// Sets the failure mode according to the step's `error` block.
///
/// A failure already marked [`FailureMode::Fatal`] keeps its mode.
pub fn apply_error_config(output: &mut Output, step: &StepDefinition) {
    match output.status {
        StepExecutionStatus::Failed => {
            if output.is_fatal() {
                return;
            }
            output.failure_mode = Some(if step.ignores_errors() {
                FailureMode::Ignored
            } else {
                FailureMode::Standard
            });
        }
        StepExecutionStatus::Skipped => {}
        _ => output.status = StepExecutionStatus::Finished,
    }
}

/// Evaluates the step's configured `output` values.
pub fn calculate_step_output(
    step: &StepDefinition,
    evaluator: &dyn ExpressionEvaluator,
    ctx: &EvalContext,
) -> Result<Input, ErrorModel> {
    let mut step_output = Input::new();
    for output in step.output_config() {
        step_output.insert(output.name.clone(), evaluator.evaluate(&output.value, ctx)?);
    }
    Ok(step_output)
}

/// What ending a step execution produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StepEnd {
    /// The primitive output with error resolution applied.
    pub output: Output,
    /// Configured `output` values.
    pub step_output: Input,
    /// Retry record; pending unless `retry_completed`.
    pub step_retry: Option<StepRetry>,
    /// Loop record; pending unless `loop_completed`.
    pub step_loop: Option<StepLoop>,
}

impl StepEnd {
    /// Returns true if the step is re-queued for another attempt.
    #[must_use]
    pub fn retry_pending(&self) -> bool {
        self.step_retry
            .as_ref()
            .is_some_and(|retry| !retry.retry_completed)
    }

    /// Returns true if the step is re-queued for another iteration.
    #[must_use]
    pub fn loop_pending(&self) -> bool {
        !self.retry_pending()
            && self
                .step_loop
                .as_ref()
                .is_some_and(|step_loop| !step_loop.loop_completed)
    }
}

/// One step execution being ended.
#[derive(Debug, Clone, Copy)]
pub struct EndStepRequest<'a> {
    /// The step definition.
    pub step: &'a StepDefinition,
    /// Input the execution ran with.
    pub input: &'a Input,
    /// Loop record the execution ran with.
    pub step_loop: Option<&'a StepLoop>,
    /// Retry record the execution ran with.
    pub step_retry: Option<&'a StepRetry>,
}

/// Resolves a primitive output through error config, outputs, throw, retry
/// and loop.
///
/// `ctx` is the pipeline context of the execution, with `each` and
/// `loop.index` already bound; `result` is bound here.
pub fn end_step(
    request: EndStepRequest<'_>,
    mut output: Output,
    evaluator: &dyn ExpressionEvaluator,
    ctx: &EvalContext,
) -> StepEnd {
    let step = request.step;
    apply_error_config(&mut output, step);

    if output.status == StepExecutionStatus::Skipped {
        return StepEnd {
            output,
            step_output: Input::new(),
            step_retry: None,
            step_loop: None,
        };
    }

    let result_ctx = ctx.clone().with_result(output.eval_value(&Input::new()));

    let step_output = match calculate_step_output(step, evaluator, &result_ctx) {
        Ok(step_output) => step_output,
        Err(err) => {
            output.fail_with(FailureMode::Fatal, StepError::new(err));
            Input::new()
        }
    };

    let mut thrown = false;
    if !output.is_fatal() {
        match calculate_throw(step, evaluator, &result_ctx) {
            Ok(Some(err)) => {
                output.fail_with(FailureMode::Standard, StepError::new(err));
                thrown = true;
            }
            Ok(None) => {}
            Err(err) => output.fail_with(FailureMode::Fatal, StepError::new(err)),
        }
    }

    let mut step_retry = request.step_retry.map(|retry| StepRetry {
        count: retry.count,
        input: None,
        retry_completed: true,
    });
    if output.is_failed() && !output.is_fatal() && !thrown {
        match calculate_retry(request.step_retry, step, evaluator, &result_ctx) {
            Ok(Some(mut retry)) => {
                retry.input = Some(request.input.clone());
                step_retry = Some(retry);
            }
            Ok(None) => {
                if step.retry_config().is_some() {
                    step_retry = Some(StepRetry {
                        count: request.step_retry.map_or(0, |retry| retry.count),
                        input: None,
                        retry_completed: true,
                    });
                }
            }
            Err(err) => output.fail_with(FailureMode::Fatal, StepError::new(err)),
        }
    }

    if output.is_failed() && !output.is_fatal() {
        apply_error_config(&mut output, step);
    }

    let retry_pending = step_retry.as_ref().is_some_and(|retry| !retry.retry_completed);
    let step_loop = if retry_pending {
        request.step_loop.cloned()
    } else if !output.is_failed() || output.is_ignored() {
        match calculate_loop(request.step_loop, step, evaluator, &result_ctx) {
            Ok(step_loop) => step_loop,
            Err(err) => {
                output.fail_with(FailureMode::Fatal, StepError::new(err));
                None
            }
        }
    } else {
        None
    };

    StepEnd {
        output,
        step_output,
        step_retry,
        step_loop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StepType;
    use crate::definition::{LoopConfig, OutputConfig, ThrowConfig};
    use crate::testing::ScriptedEvaluator;
    use serde_json::json;

    fn request<'a>(step: &'a StepDefinition, input: &'a Input) -> EndStepRequest<'a> {
        EndStepRequest {
            step,
            input,
            step_loop: None,
            step_retry: None,
        }
    }

    fn failing() -> Output {
        Output::failed(ErrorModel::internal("connection refused"))
    }

    #[test]
    fn test_apply_error_config() {
        let ignored = StepDefinition::new(StepType::Http, "a").with_ignore_errors();
        let mut output = failing();
        apply_error_config(&mut output, &ignored);
        assert!(output.is_ignored());

        let standard = StepDefinition::new(StepType::Http, "a");
        let mut output = failing();
        apply_error_config(&mut output, &standard);
        assert_eq!(output.failure_mode, Some(FailureMode::Standard));

        let mut output = Output {
            status: StepExecutionStatus::Started,
            ..Output::default()
        };
        apply_error_config(&mut output, &standard);
        assert_eq!(output.status, StepExecutionStatus::Finished);
    }

    #[test]
    fn test_success_without_policies() {
        let step = StepDefinition::new(StepType::Echo, "a");
        let input = Input::new();
        let end = end_step(
            request(&step, &input),
            Output::default(),
            &ScriptedEvaluator::new(),
            &EvalContext::default(),
        );
        assert!(!end.output.is_failed());
        assert!(end.step_retry.is_none());
        assert!(end.step_loop.is_none());
        assert!(!end.retry_pending());
    }

    #[test]
    fn test_skip_returns_early() {
        let step = StepDefinition::new(StepType::Echo, "a").with_loop(LoopConfig::new("false"));
        let input = Input::new();
        let end = end_step(
            request(&step, &input),
            Output::skipped(),
            &ScriptedEvaluator::new(),
            &EvalContext::default(),
        );
        assert_eq!(end.output.status, StepExecutionStatus::Skipped);
        assert!(end.step_loop.is_none());
    }

    #[test]
    fn test_step_output_sees_result() {
        let step = StepDefinition::new(StepType::Echo, "a")
            .with_output(OutputConfig::new("echoed", "result.text"));
        let mut data = Input::new();
        data.insert("text".to_string(), json!("hi"));
        let input = Input::new();
        let end = end_step(
            request(&step, &input),
            Output::finished(data),
            &ScriptedEvaluator::new(),
            &EvalContext::default(),
        );
        assert_eq!(end.step_output["echoed"], json!("hi"));
    }

    #[test]
    fn test_output_error_is_fatal() {
        let step = StepDefinition::new(StepType::Echo, "a")
            .with_output(OutputConfig::new("bad", "result.missing"))
            .with_retry(RetryConfig::new());
        let input = Input::new();
        let end = end_step(
            request(&step, &input),
            Output::default(),
            &ScriptedEvaluator::new(),
            &EvalContext::default(),
        );
        assert!(end.output.is_fatal());
        assert!(!end.retry_pending());
    }

    #[test]
    fn test_throw_bypasses_retry() {
        let step = StepDefinition::new(StepType::Http, "a")
            .with_throw(ThrowConfig::new("true").with_message("\"bad status\""))
            .with_retry(RetryConfig::new());
        let input = Input::new();
        let end = end_step(
            request(&step, &input),
            Output::default(),
            &ScriptedEvaluator::new(),
            &EvalContext::default(),
        );
        assert!(end.output.is_failed());
        assert_eq!(end.output.failure_mode, Some(FailureMode::Standard));
        assert_eq!(end.output.errors[0].error.detail, "bad status");
        assert!(end.step_retry.is_none());
    }

    #[test]
    fn test_throw_on_ignoring_step_is_ignored() {
        let step = StepDefinition::new(StepType::Http, "a")
            .with_ignore_errors()
            .with_throw(ThrowConfig::new("true"));
        let input = Input::new();
        let end = end_step(
            request(&step, &input),
            Output::default(),
            &ScriptedEvaluator::new(),
            &EvalContext::default(),
        );
        assert!(end.output.is_failed());
        assert!(end.output.is_ignored());
        assert_eq!(end.output.errors.len(), 1);
    }

    #[test]
    fn test_exhausted_retry_on_ignoring_step_is_ignored() {
        let step = StepDefinition::new(StepType::Http, "a")
            .with_ignore_errors()
            .with_retry(RetryConfig::new());
        let input = Input::new();
        let previous = StepRetry {
            count: 2,
            input: None,
            retry_completed: false,
        };
        let end = end_step(
            EndStepRequest {
                step_retry: Some(&previous),
                ..request(&step, &input)
            },
            failing(),
            &ScriptedEvaluator::new(),
            &EvalContext::default(),
        );
        assert!(!end.retry_pending());
        assert!(end.output.is_ignored());
    }

    #[test]
    fn test_fatal_output_error_is_not_ignored() {
        let step = StepDefinition::new(StepType::Echo, "a")
            .with_ignore_errors()
            .with_output(OutputConfig::new("bad", "result.missing"));
        let input = Input::new();
        let end = end_step(
            request(&step, &input),
            Output::default(),
            &ScriptedEvaluator::new(),
            &EvalContext::default(),
        );
        assert!(end.output.is_fatal());
        assert!(!end.output.is_ignored());
    }

    #[test]
    fn test_retry_pending_keeps_input() {
        let step = StepDefinition::new(StepType::Http, "a").with_retry(RetryConfig::new());
        let mut input = Input::new();
        input.insert("url".to_string(), json!("https://example.com"));
        let end = end_step(
            request(&step, &input),
            failing(),
            &ScriptedEvaluator::new(),
            &EvalContext::default(),
        );

        assert!(end.retry_pending());
        let retry = end.step_retry.unwrap();
        assert_eq!(retry.count, 1);
        assert_eq!(retry.input.unwrap()["url"], json!("https://example.com"));
    }

    #[test]
    fn test_retry_exhausted() {
        let step = StepDefinition::new(StepType::Http, "a").with_retry(RetryConfig::new());
        let input = Input::new();
        let previous = StepRetry {
            count: 2,
            input: None,
            retry_completed: false,
        };
        let end = end_step(
            EndStepRequest {
                step_retry: Some(&previous),
                ..request(&step, &input)
            },
            failing(),
            &ScriptedEvaluator::new(),
            &EvalContext::default(),
        );

        assert!(!end.retry_pending());
        let retry = end.step_retry.unwrap();
        assert_eq!(retry.count, 2);
        assert!(retry.retry_completed);
    }

    #[test]
    fn test_success_after_retry_completes_retry() {
        let step = StepDefinition::new(StepType::Http, "a").with_retry(RetryConfig::new());
        let input = Input::new();
        let previous = StepRetry {
            count: 1,
            input: None,
            retry_completed: false,
        };
        let end = end_step(
            EndStepRequest {
                step_retry: Some(&previous),
                ..request(&step, &input)
            },
            Output::default(),
            &ScriptedEvaluator::new(),
            &EvalContext::default(),
        );
        assert!(end.step_retry.unwrap().retry_completed);
    }

    #[test]
    fn test_ignored_failure_loops() {
        let step = StepDefinition::new(StepType::Http, "a")
            .with_ignore_errors()
            .with_loop(LoopConfig::new("false"));
        let input = Input::new();
        let end = end_step(
            request(&step, &input),
            failing(),
            &ScriptedEvaluator::new(),
            &EvalContext::default(),
        );
        assert!(end.output.is_ignored());
        assert!(end.loop_pending());
        assert_eq!(end.step_loop.unwrap().index, 1);
    }

    #[test]
    fn test_failed_step_does_not_loop() {
        let step = StepDefinition::new(StepType::Http, "a").with_loop(LoopConfig::new("false"));
        let input = Input::new();
        let end = end_step(
            request(&step, &input),
            failing(),
            &ScriptedEvaluator::new(),
            &EvalContext::default(),
        );
        assert!(end.step_loop.is_none());
        assert!(!end.loop_pending());
    }

    #[test]
    fn test_loop_error_is_fatal() {
        let step = StepDefinition::new(StepType::Http, "a").with_loop(LoopConfig::new("loop.nope"));
        let input = Input::new();
        let end = end_step(
            request(&step, &input),
            Output::default(),
            &ScriptedEvaluator::new(),
            &EvalContext::default(),
        );
        assert!(end.output.is_fatal());
        assert!(end.step_loop.is_none());
    }

    #[test]
    fn test_retry_carries_loop() {
        let step = StepDefinition::new(StepType::Http, "a")
            .with_retry(RetryConfig::new())
            .with_loop(LoopConfig::new("false"));
        let input = Input::new();
        let current = StepLoop {
            index: 3,
            input: None,
            loop_completed: false,
        };
        let end = end_step(
            EndStepRequest {
                step_loop: Some(&current),
                ..request(&step, &input)
            },
            failing(),
            &ScriptedEvaluator::new(),
            &EvalContext::default(),
        );
        assert!(end.retry_pending());
        assert!(!end.loop_pending());
        assert_eq!(end.step_loop.unwrap().index, 3);
    }
}
