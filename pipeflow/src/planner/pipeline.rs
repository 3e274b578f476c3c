//! Pipeline planning pass.

use super::for_each::plan_branches;
use super::plan_instance;
use crate::core::{NextStep, NextStepAction, StepForEach};
use crate::definition::PipelineDefinition;
use crate::errors::PipeflowError;
use crate::eval::ExpressionEvaluator;
use crate::execution::{PipelineExecution, StepStatus};
use tracing::warn;

/// Returns the steps that can be started, skipped, or will never run.
///
/// A step is considered once: it is passed over if it is already
/// initialized, queued or loop-held. A dependency on itself or on a step
/// the pipeline does not define is ignored with a warning. A step whose
/// dependency failed is [`NextStepAction::Inaccessible`]. Whether a failure
/// counts is settled when the step ends: an ignored failure is recorded as
/// finished, a fatal one as failed even under `error { ignore = true }`.
pub fn plan_pipeline(
    pex: &PipelineExecution,
    defn: &PipelineDefinition,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<Vec<NextStep>, PipeflowError> {
    let ctx = pex.eval_context();
    let mut next_steps = Vec::new();

    for step in defn.steps() {
        let full_name = step.full_name();
        if pex.is_step_initialized(&full_name)
            || pex.is_step_queued(&full_name)
            || pex.is_step_loop_hold(&full_name)
        {
            continue;
        }

        let mut ready = true;
        let mut inaccessible = false;
        for dependency in step.depends_on() {
            if *dependency == full_name {
                warn!(step = %full_name, pipeline = defn.name(), "Ignoring dependency on itself");
                continue;
            }
            if defn.step(dependency).is_none() {
                warn!(
                    step = %full_name,
                    dependency = %dependency,
                    pipeline = defn.name(),
                    "Ignoring dependency on unknown step"
                );
                continue;
            }
            if !pex.is_step_complete(dependency) {
                ready = false;
                break;
            }
            if pex.is_step_fail(dependency) {
                inaccessible = true;
                break;
            }
        }

        if inaccessible {
            tracing::info!(step = %full_name, pex_id = %pex.id, "Step inaccessible, dependency failed");
            next_steps.push(NextStep::new(full_name, NextStepAction::Inaccessible));
            continue;
        }
        if !ready {
            continue;
        }

        if step.for_each().is_some() {
            next_steps.push(
                NextStep::new(full_name, NextStepAction::Start)
                    .with_max_concurrency(step.max_concurrency()),
            );
            continue;
        }

        next_steps.push(plan_instance(
            step,
            StepForEach::single(),
            ctx.clone(),
            evaluator,
        )?);
    }

    tracing::debug!(
        pex_id = %pex.id,
        pipeline = defn.name(),
        count = next_steps.len(),
        "Planned pipeline"
    );
    Ok(next_steps)
}

/// Plans again the steps that were planned but never queued.
///
/// A step initialized with no branch yet is returned as [`plan_pipeline`]
/// would return it. A `for_each` branch still initializing is expanded
/// again on its own.
pub fn plan_unqueued(
    pex: &PipelineExecution,
    defn: &PipelineDefinition,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<Vec<NextStep>, PipeflowError> {
    let ctx = pex.eval_context();
    let mut next_steps = Vec::new();

    for step in defn.steps() {
        let full_name = step.full_name();
        let Some(statuses) = pex.step_status.get(&full_name) else {
            continue;
        };

        if statuses.is_empty() {
            if step.for_each().is_some() {
                next_steps.push(
                    NextStep::new(full_name, NextStepAction::Start)
                        .with_max_concurrency(step.max_concurrency()),
                );
            } else {
                next_steps.push(plan_instance(
                    step,
                    StepForEach::single(),
                    ctx.clone(),
                    evaluator,
                )?);
            }
        } else if step.for_each().is_some()
            && statuses.values().any(|status| status.initializing)
        {
            next_steps.extend(plan_branches(
                pex,
                defn,
                &full_name,
                evaluator,
                |status| status.is_some_and(|status| status.initializing),
            )?);
        }
    }

    if !next_steps.is_empty() {
        tracing::info!(pex_id = %pex.id, count = next_steps.len(), "Re-planned unqueued steps");
    }
    Ok(next_steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FailureMode, Input, Output, StepType};
    use crate::definition::{LoopConfig, StepDefinition};
    use crate::errors::ErrorModel;
    use crate::eval::PathEvaluator;
    use crate::execution::StepExecution;
    use crate::events::{Envelope, StepQueue};
    use serde_json::json;

    fn pex() -> PipelineExecution {
        let mut args = Input::new();
        args.insert("url".to_string(), json!("https://example.com"));
        PipelineExecution::new("pexec_1", "deploy", args)
    }

    fn run_step(pex: &mut PipelineExecution, step: &str, id: &str, output: Output) {
        let cmd = StepQueue {
            event: Envelope::new("exec_1"),
            pipeline_execution_id: pex.id.clone(),
            step_execution_id: id.to_string(),
            step_name: step.to_string(),
            action: NextStepAction::Start,
            input: Input::new(),
            step_for_each: StepForEach::single(),
            step_loop: None,
            step_retry: None,
            max_concurrency: None,
            delay_ms: 0,
        };
        let status = pex
            .step_status
            .entry(step.to_string())
            .or_default()
            .entry("0".to_string())
            .or_default();
        status.queue(id).unwrap();
        if output.is_failed() && !output.is_ignored() {
            status.fail(id).unwrap();
        } else {
            status.finish(id, false, false).unwrap();
        }
        status.record_execution(id);
        let mut step_execution = StepExecution::queued(&cmd);
        step_execution.output = Some(output);
        pex.step_executions.insert(id.to_string(), step_execution);
    }

    fn two_steps() -> PipelineDefinition {
        PipelineDefinition::new("deploy")
            .with_step(StepDefinition::new(StepType::Http, "a").with_input("url", "param.url"))
            .with_step(
                StepDefinition::new(StepType::Echo, "b")
                    .with_depends_on("http.a")
                    .with_input("status", "step.http.a.status"),
            )
    }

    fn names(next_steps: &[NextStep]) -> Vec<(&str, NextStepAction)> {
        next_steps
            .iter()
            .map(|step| (step.step_name.as_str(), step.action))
            .collect()
    }

    #[test]
    fn test_dependency_defers_step() {
        let next = plan_pipeline(&pex(), &two_steps(), &PathEvaluator).unwrap();
        assert_eq!(names(&next), vec![("http.a", NextStepAction::Start)]);
        assert_eq!(next[0].input["url"], json!("https://example.com"));
        assert_eq!(next[0].step_for_each.as_ref().unwrap().key, "0");
    }

    #[test]
    fn test_started_dependency_still_defers() {
        let mut pex = pex();
        pex.initialize_step("http.a");
        let next = plan_pipeline(&pex, &two_steps(), &PathEvaluator).unwrap();
        assert!(next.is_empty());
    }

    #[test]
    fn test_completed_dependency_releases_step() {
        let mut pex = pex();
        run_step(&mut pex, "http.a", "sexec_1", Output::default());
        let next = plan_pipeline(&pex, &two_steps(), &PathEvaluator).unwrap();
        assert_eq!(names(&next), vec![("echo.b", NextStepAction::Start)]);
        assert_eq!(next[0].input["status"], json!("finished"));
    }

    #[test]
    fn test_failed_dependency_is_inaccessible() {
        let mut pex = pex();
        run_step(&mut pex, "http.a", "sexec_1", Output::failed(ErrorModel::internal("boom")));
        let next = plan_pipeline(&pex, &two_steps(), &PathEvaluator).unwrap();
        assert_eq!(names(&next), vec![("echo.b", NextStepAction::Inaccessible)]);
    }

    fn failed_with(mode: FailureMode) -> Output {
        let mut output = Output::failed(ErrorModel::internal("boom"));
        output.failure_mode = Some(mode);
        output
    }

    fn ignoring_dependency() -> PipelineDefinition {
        PipelineDefinition::new("deploy")
            .with_step(StepDefinition::new(StepType::Http, "a").with_ignore_errors())
            .with_step(StepDefinition::new(StepType::Echo, "b").with_depends_on("http.a"))
    }

    #[test]
    fn test_ignored_failed_dependency_starts() {
        let mut pex = pex();
        run_step(&mut pex, "http.a", "sexec_1", failed_with(FailureMode::Ignored));
        assert!(!pex.is_step_fail("http.a"));

        let next = plan_pipeline(&pex, &ignoring_dependency(), &PathEvaluator).unwrap();
        assert_eq!(names(&next), vec![("echo.b", NextStepAction::Start)]);
    }

    #[test]
    fn test_fatal_failure_of_ignoring_dependency_is_inaccessible() {
        let mut pex = pex();
        run_step(&mut pex, "http.a", "sexec_1", failed_with(FailureMode::Fatal));
        assert!(pex.is_step_fail("http.a"));

        let next = plan_pipeline(&pex, &ignoring_dependency(), &PathEvaluator).unwrap();
        assert_eq!(names(&next), vec![("echo.b", NextStepAction::Inaccessible)]);
    }

    #[test]
    fn test_self_and_unknown_dependencies_are_ignored() {
        let defn = PipelineDefinition::new("deploy").with_step(
            StepDefinition::new(StepType::Echo, "a")
                .with_depends_on("echo.a")
                .with_depends_on("http.missing"),
        );
        let next = plan_pipeline(&pex(), &defn, &PathEvaluator).unwrap();
        assert_eq!(names(&next), vec![("echo.a", NextStepAction::Start)]);
    }

    #[test]
    fn test_independent_steps_planned_together_in_order() {
        let defn = PipelineDefinition::new("deploy")
            .with_step(StepDefinition::new(StepType::Echo, "c"))
            .with_step(StepDefinition::new(StepType::Echo, "a"))
            .with_step(StepDefinition::new(StepType::Echo, "b"));
        let next = plan_pipeline(&pex(), &defn, &PathEvaluator).unwrap();
        let order: Vec<_> = next.iter().map(|step| step.step_name.as_str()).collect();
        assert_eq!(order, vec!["echo.c", "echo.a", "echo.b"]);
    }

    #[test]
    fn test_if_false_skips() {
        let defn = PipelineDefinition::new("deploy")
            .with_step(StepDefinition::new(StepType::Echo, "a").with_if("false"));
        let next = plan_pipeline(&pex(), &defn, &PathEvaluator).unwrap();
        assert_eq!(names(&next), vec![("echo.a", NextStepAction::Skip)]);
        assert!(next[0].input.is_empty());
    }

    #[test]
    fn test_for_each_step_is_not_expanded() {
        let defn = PipelineDefinition::new("deploy").with_step(
            StepDefinition::new(StepType::Echo, "a")
                .with_for_each("[1, 2]")
                .with_max_concurrency(2),
        );
        let next = plan_pipeline(&pex(), &defn, &PathEvaluator).unwrap();
        assert_eq!(next.len(), 1);
        assert!(next[0].step_for_each.is_none());
        assert_eq!(next[0].max_concurrency, Some(2));
    }

    #[test]
    fn test_loop_step_starts_at_index_zero() {
        let defn = PipelineDefinition::new("deploy").with_step(
            StepDefinition::new(StepType::Echo, "a")
                .with_input("index", "loop.index")
                .with_loop(LoopConfig::new("true")),
        );
        let next = plan_pipeline(&pex(), &defn, &PathEvaluator).unwrap();
        assert_eq!(next[0].input["index"], json!(0));
        assert_eq!(next[0].step_loop.as_ref().unwrap().index, 0);
    }

    #[test]
    fn test_loop_held_step_not_replanned() {
        let defn = PipelineDefinition::new("deploy")
            .with_step(StepDefinition::new(StepType::Echo, "a").with_loop(LoopConfig::new("true")));
        let mut pex = pex();
        run_step(&mut pex, "echo.a", "sexec_1", Output::default());
        pex.step_status.get_mut("echo.a").unwrap().get_mut("0").unwrap().loop_hold = true;
        assert!(plan_pipeline(&pex, &defn, &PathEvaluator).unwrap().is_empty());
    }

    #[test]
    fn test_plan_unqueued_returns_stranded_steps() {
        let defn = PipelineDefinition::new("deploy")
            .with_step(StepDefinition::new(StepType::Http, "a").with_input("url", "param.url"))
            .with_step(
                StepDefinition::new(StepType::Echo, "items")
                    .with_for_each("[\"x\", \"y\"]")
                    .with_input("value", "each.value"),
            )
            .with_step(StepDefinition::new(StepType::Echo, "done"));
        let mut pex = pex();
        pex.initialize_step("http.a");
        pex.initialize_step("echo.items");
        let branches = pex.step_status.get_mut("echo.items").unwrap();
        branches.insert("0".to_string(), StepStatus::initializing());
        branches.insert("1".to_string(), StepStatus::initializing());
        run_step(&mut pex, "echo.items", "sexec_1", Output::default());
        run_step(&mut pex, "echo.done", "sexec_2", Output::default());

        let next = plan_unqueued(&pex, &defn, &PathEvaluator).unwrap();

        assert_eq!(
            names(&next),
            vec![("http.a", NextStepAction::Start), ("echo.items", NextStepAction::Start)]
        );
        assert_eq!(next[0].input["url"], json!("https://example.com"));
        let branch = next[1].step_for_each.as_ref().unwrap();
        assert_eq!(branch.key, "1");
        assert_eq!(next[1].input["value"], json!("y"));
    }

    #[test]
    fn test_plan_unqueued_returns_whole_for_each_step() {
        let defn = PipelineDefinition::new("deploy")
            .with_step(StepDefinition::new(StepType::Echo, "items").with_for_each("[1]"));
        let mut pex = pex();
        pex.initialize_step("echo.items");

        let next = plan_unqueued(&pex, &defn, &PathEvaluator).unwrap();
        assert_eq!(names(&next), vec![("echo.items", NextStepAction::Start)]);
        assert!(next[0].step_for_each.is_none());

        let fresh = PipelineExecution::new("pexec_2", "deploy", Input::new());
        assert!(plan_unqueued(&fresh, &defn, &PathEvaluator).unwrap().is_empty());
    }

    #[test]
    fn test_evaluation_error_propagates() {
        let defn = PipelineDefinition::new("deploy")
            .with_step(StepDefinition::new(StepType::Echo, "a").with_input("x", "param.missing"));
        let err = plan_pipeline(&pex(), &defn, &PathEvaluator).unwrap_err();
        assert!(matches!(err, PipeflowError::Evaluation(_)));
    }
}
