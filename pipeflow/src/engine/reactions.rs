//! Event handlers: each reads the locked aggregate and returns the commands
//! an event calls for.

use super::{EngineInner, Handled};
use crate::core::{NextStep, NextStepAction, PipelineStatus};
use crate::definition::{PipelineDefinition, StepDefinition};
use crate::errors::{ErrorModel, StepError};
use crate::events::{
    Command, Envelope, Event, ExecutionFail, ExecutionFinish, ExecutionStart, LogEntry,
    PipelineFail, PipelineFinish, PipelinePlan, PipelinePlanned, PipelineQueue, PipelineResumed,
    PipelineStart, StepFinished, StepForEachPlan, StepForEachPlanned, StepPipelineFinish,
    StepPipelineStarted, StepQueue, StepStart,
};
use crate::execution::{Execution, PipelineExecution, StepExecution};
use crate::planner::plan_unqueued;
use crate::utils::new_step_execution_id;

impl EngineInner {
    pub(super) async fn on_event(&self, event: &Event) -> Handled {
        match event {
            Event::ExecutionQueued(queued) => Ok(vec![Command::from(ExecutionStart {
                event: queued.event.child(),
                pipeline_queue: queued.pipeline_queue.clone(),
            })
            .into()]),
            Event::ExecutionStarted(started) => {
                let mut pipeline_queue = started.pipeline_queue.clone();
                pipeline_queue.event = started.event.child();
                Ok(vec![Command::from(pipeline_queue).into()])
            }
            Event::TriggerStarted(started) => Ok(vec![Command::from(PipelineQueue {
                event: started.event.child(),
                name: started.pipeline.clone(),
                args: started.args.clone(),
                pipeline_execution_id: started.pipeline_execution_id.clone(),
                parent_pipeline_execution_id: None,
                parent_step_execution_id: None,
            })
            .into()]),
            Event::ExecutionFinished(_) | Event::ExecutionFailed(_) => {
                self.execution_ended(&event.envelope().execution_id).await
            }
            Event::PipelineQueued(queued) => Ok(vec![Command::from(PipelineStart {
                event: queued.event.child(),
                pipeline_execution_id: queued.pipeline_execution_id.clone(),
            })
            .into()]),
            Event::PipelineStarted(started) => Ok(vec![plan(
                &started.event,
                &started.pipeline_execution_id,
            )]),
            Event::PipelineResumed(resumed) => self.pipeline_resumed(resumed).await,
            Event::PipelinePlanned(planned) => self.pipeline_planned(planned).await,
            Event::PipelinePaused(_) => Ok(Vec::new()),
            Event::PipelineCanceled(ended) => {
                self.pipeline_ended(&ended.event, &ended.pipeline_execution_id)
                    .await
            }
            Event::PipelineFinished(ended) => {
                self.pipeline_ended(&ended.event, &ended.pipeline_execution_id)
                    .await
            }
            Event::PipelineFailed(ended) => {
                self.pipeline_ended(&ended.event, &ended.pipeline_execution_id)
                    .await
            }
            Event::StepForEachPlanned(planned) => self.step_for_each_planned(planned).await,
            Event::StepQueued(queued) => Ok(vec![Command::from(StepStart {
                event: queued.event.child(),
                pipeline_execution_id: queued.pipeline_execution_id.clone(),
                step_execution_id: queued.step_execution_id.clone(),
            })
            .into()]),
            Event::StepPipelineStarted(started) => Ok(vec![queue_child(started)]),
            Event::StepFinished(finished) => self.step_finished(finished).await,
        }
    }

    async fn pipeline_planned(&self, planned: &PipelinePlanned) -> Handled {
        let Some(guard) = self.lock_running(&planned.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let pex = guard
            .execution()
            .pipeline_execution(&planned.pipeline_execution_id)?;
        if pex.blocks_planning() {
            return Ok(Vec::new());
        }

        if let Some(step) = planned
            .next_steps
            .iter()
            .find(|next_step| next_step.action == NextStepAction::Inaccessible)
        {
            tracing::info!(pipeline_execution_id = %pex.id, step = %step.step_name, "Failing pipeline with inaccessible step");
            return Ok(vec![fail(&planned.event, &pex.id, None)]);
        }

        if planned.next_steps.is_empty() {
            if !pex.is_complete() {
                return Ok(Vec::new());
            }
            let follow_up = if pex.should_fail() {
                fail(&planned.event, &pex.id, None)
            } else {
                Command::from(PipelineFinish {
                    event: planned.event.child(),
                    pipeline_execution_id: pex.id.clone(),
                })
                .into()
            };
            return Ok(vec![follow_up]);
        }

        Ok(planned
            .next_steps
            .iter()
            .map(|next_step| dispatch_step(&planned.event, &pex.id, next_step.clone()))
            .collect())
    }

    async fn step_for_each_planned(&self, planned: &StepForEachPlanned) -> Handled {
        let Some(guard) = self.lock_running(&planned.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let pex = guard
            .execution()
            .pipeline_execution(&planned.pipeline_execution_id)?;
        if pex.blocks_planning() {
            return Ok(Vec::new());
        }

        if planned.next_steps.is_empty() {
            return Ok(vec![plan(&planned.event, &pex.id)]);
        }
        Ok(planned
            .next_steps
            .iter()
            .map(|next_step| queue_step(&planned.event, &pex.id, next_step.clone()))
            .collect())
    }

    async fn step_finished(&self, finished: &StepFinished) -> Handled {
        let Some(guard) = self.lock_running(&finished.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let execution = guard.execution();
        let pex = execution.pipeline_execution(&finished.pipeline_execution_id)?;
        if pex.blocks_planning() {
            return Ok(Vec::new());
        }
        let se = execution.step_execution(&pex.id, &finished.step_execution_id)?;
        let defn = self.definitions.pipeline(&pex.name)?;
        Ok(vec![after_step(&finished.event, pex, &defn, se)])
    }

    /// Re-drives the work a pause held back: queued step executions are
    /// started, pending retries and loop iterations re-queued, steps planned
    /// but never queued planned again, and the pipeline planned again.
    async fn pipeline_resumed(&self, resumed: &PipelineResumed) -> Handled {
        let Some(guard) = self.lock_running(&resumed.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let pex = guard
            .execution()
            .pipeline_execution(&resumed.pipeline_execution_id)?;
        if pex.status != PipelineStatus::Started {
            return Ok(Vec::new());
        }

        let defn = self.definitions.pipeline(&pex.name)?;
        let mut follow_ups: Vec<LogEntry> = pex
            .queued_step_executions()
            .into_iter()
            .map(|se| {
                Command::from(StepStart {
                    event: resumed.event.child(),
                    pipeline_execution_id: pex.id.clone(),
                    step_execution_id: se.id.clone(),
                })
                .into()
            })
            .collect();
        follow_ups.extend(
            pex.held_step_executions()
                .into_iter()
                .map(|se| after_step(&resumed.event, pex, &defn, se)),
        );
        follow_ups.extend(
            plan_unqueued(pex, &defn, self.evaluator.as_ref())?
                .into_iter()
                .map(|next_step| dispatch_step(&resumed.event, &pex.id, next_step)),
        );
        follow_ups.push(plan(&resumed.event, &pex.id));
        Ok(follow_ups)
    }

    /// Releases a terminal pipeline's resources and reports its end to the
    /// parent step, or ends the execution once every root pipeline ended.
    async fn pipeline_ended(&self, envelope: &Envelope, pipeline_execution_id: &str) -> Handled {
        self.limiter.complete_pipeline_execution(pipeline_execution_id);
        if let Some(token) = self.tokens.release(pipeline_execution_id) {
            token.cancel("pipeline execution ended");
        }

        let Some(guard) = self.lock_running(&envelope.execution_id).await? else {
            return Ok(Vec::new());
        };
        let execution = guard.execution();
        let pex = execution.pipeline_execution(pipeline_execution_id)?;

        if let (Some(parent_pex), Some(parent_step)) = (
            pex.parent_pipeline_execution_id.clone(),
            pex.parent_step_execution_id.clone(),
        ) {
            return Ok(vec![Command::from(StepPipelineFinish {
                event: envelope.child(),
                pipeline_execution_id: parent_pex,
                step_execution_id: parent_step,
                child_pipeline_execution_id: pex.id.clone(),
                output: pex.output.clone(),
                errors: end_errors(pex),
            })
            .into()]);
        }

        if execution.is_terminal() || !execution.roots_terminal() {
            return Ok(Vec::new());
        }
        Ok(vec![end_execution(envelope, execution)])
    }

    async fn execution_ended(&self, execution_id: &str) -> Handled {
        let guard = self.repository.lock(execution_id).await?;
        if !guard.execution().is_terminal() {
            return Ok(Vec::new());
        }
        let execution = self.repository.retire(guard);
        for pipeline_execution_id in execution.pipeline_executions.keys() {
            if let Some(token) = self.tokens.release(pipeline_execution_id) {
                token.cancel("execution ended");
            }
            self.limiter.complete_pipeline_execution(pipeline_execution_id);
        }
        tracing::info!(
            execution_id,
            status = %execution.status,
            errors = execution.errors.len(),
            "Execution ended"
        );
        Ok(Vec::new())
    }
}

/// What follows an ended step execution: another retry attempt, another
/// loop iteration, a for-each re-plan, or a pipeline re-plan.
fn after_step(
    envelope: &Envelope,
    pex: &PipelineExecution,
    defn: &PipelineDefinition,
    se: &StepExecution,
) -> LogEntry {
    if let Some(retry) = se.step_retry.as_ref().filter(|retry| !retry.retry_completed) {
        let delay = defn
            .step(&se.name)
            .and_then(StepDefinition::retry_config)
            .map_or(0, |config| {
                u64::try_from(config.calculate_backoff(retry.count).as_millis()).unwrap_or(u64::MAX)
            });
        return Command::from(StepQueue {
            event: envelope.child(),
            pipeline_execution_id: pex.id.clone(),
            step_execution_id: new_step_execution_id(),
            step_name: se.name.clone(),
            action: NextStepAction::Start,
            input: retry.input.clone().unwrap_or_else(|| se.input.clone()),
            step_for_each: se.step_for_each.clone(),
            step_loop: se.step_loop.clone(),
            step_retry: Some(retry.clone()),
            max_concurrency: se.max_concurrency,
            delay_ms: delay,
        })
        .into();
    }

    if let Some(step_loop) = se.step_loop.as_ref().filter(|step_loop| !step_loop.loop_completed) {
        return Command::from(StepQueue {
            event: envelope.child(),
            pipeline_execution_id: pex.id.clone(),
            step_execution_id: new_step_execution_id(),
            step_name: se.name.clone(),
            action: NextStepAction::Start,
            input: step_loop.input.clone().unwrap_or_else(|| se.input.clone()),
            step_for_each: se.step_for_each.clone(),
            step_loop: Some(step_loop.clone()),
            step_retry: None,
            max_concurrency: se.max_concurrency,
            delay_ms: 0,
        })
        .into();
    }

    if se.step_for_each.for_each_step {
        return Command::from(StepForEachPlan {
            event: envelope.child(),
            pipeline_execution_id: pex.id.clone(),
            step_name: se.name.clone(),
        })
        .into();
    }
    plan(envelope, &pex.id)
}

/// Expands an undivided `for_each` step, queues anything else.
fn dispatch_step(envelope: &Envelope, pipeline_execution_id: &str, next_step: NextStep) -> LogEntry {
    if next_step.step_for_each.is_none() {
        Command::from(StepForEachPlan {
            event: envelope.child(),
            pipeline_execution_id: pipeline_execution_id.to_string(),
            step_name: next_step.step_name,
        })
        .into()
    } else {
        queue_step(envelope, pipeline_execution_id, next_step)
    }
}

fn queue_step(envelope: &Envelope, pipeline_execution_id: &str, next_step: NextStep) -> LogEntry {
    Command::from(StepQueue {
        event: envelope.child(),
        pipeline_execution_id: pipeline_execution_id.to_string(),
        step_execution_id: new_step_execution_id(),
        step_name: next_step.step_name,
        action: next_step.action,
        input: next_step.input,
        step_for_each: next_step.step_for_each.unwrap_or_default(),
        step_loop: next_step.step_loop,
        step_retry: None,
        max_concurrency: next_step.max_concurrency,
        delay_ms: 0,
    })
    .into()
}

fn queue_child(started: &StepPipelineStarted) -> LogEntry {
    Command::from(PipelineQueue {
        event: started.event.child(),
        name: started.child_pipeline.clone(),
        args: started.args.clone(),
        pipeline_execution_id: started.child_pipeline_execution_id.clone(),
        parent_pipeline_execution_id: Some(started.pipeline_execution_id.clone()),
        parent_step_execution_id: Some(started.step_execution_id.clone()),
    })
    .into()
}

fn plan(envelope: &Envelope, pipeline_execution_id: &str) -> LogEntry {
    Command::from(PipelinePlan {
        event: envelope.child(),
        pipeline_execution_id: pipeline_execution_id.to_string(),
    })
    .into()
}

fn fail(envelope: &Envelope, pipeline_execution_id: &str, error: Option<ErrorModel>) -> LogEntry {
    Command::from(PipelineFail {
        event: envelope.child(),
        pipeline_execution_id: pipeline_execution_id.to_string(),
        error,
    })
    .into()
}

/// Errors a terminal pipeline reports upward. A canceled pipeline always
/// reports at least one.
fn end_errors(pex: &PipelineExecution) -> Vec<StepError> {
    let mut errors = pex.errors.clone();
    if pex.is_canceled() && errors.is_empty() {
        errors.push(
            StepError::new(ErrorModel::canceled(format!(
                "pipeline execution {} was canceled",
                pex.id
            )))
            .with_step(pex.name.clone(), String::new())
            .with_execution_ids(pex.id.clone(), String::new()),
        );
    }
    errors
}

/// Finishes the execution if every root pipeline finished, fails it
/// otherwise.
fn end_execution(envelope: &Envelope, execution: &Execution) -> LogEntry {
    let unfinished: Vec<&PipelineExecution> = execution
        .root_pipelines
        .iter()
        .filter_map(|id| execution.pipeline_executions.get(id))
        .filter(|pex| !pex.is_finished())
        .collect();

    if unfinished.is_empty() {
        Command::from(ExecutionFinish {
            event: envelope.child(),
        })
        .into()
    } else {
        Command::from(ExecutionFail {
            event: envelope.child(),
            errors: unfinished.into_iter().flat_map(end_errors).collect(),
        })
        .into()
    }
}
