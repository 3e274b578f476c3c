//! Execution and pipeline command handlers.
//!
//! Each handler checks its guard against the locked aggregate, appends the
//! command and the event it produces, and returns the event. A guard that
//! does not hold makes the command a no-op.

use super::{EngineInner, Handled};
use crate::core::{ExecutionStatus, Input, PipelineStatus};
use crate::errors::StepError;
use crate::events::{
    Command, Envelope, Event, ExecutionFail, ExecutionFailed, ExecutionFinish, ExecutionFinished,
    ExecutionQueue, ExecutionQueued, ExecutionStart, ExecutionStarted, LogEntry, PipelineCancel,
    PipelineCanceled, PipelineFail, PipelineFailed, PipelineFinish, PipelineFinished,
    PipelinePause, PipelinePaused, PipelinePlan, PipelinePlanned, PipelineQueue, PipelineQueued,
    PipelineResume, PipelineResumed, PipelineStart, PipelineStarted, StepForEachPlan,
    StepForEachPlanned, StepPipelineFinish, TriggerStart, TriggerStarted,
};
use crate::eval::EvalContext;
use crate::execution::Execution;
use crate::planner::{plan_for_each, plan_pipeline};
use crate::utils::new_pipeline_execution_id;

impl EngineInner {
    pub(super) async fn on_command(&self, command: Command) -> Handled {
        match command {
            Command::ExecutionQueue(cmd) => self.execution_queue(cmd).await,
            Command::ExecutionStart(cmd) => self.execution_start(cmd).await,
            Command::ExecutionFinish(cmd) => self.execution_finish(cmd).await,
            Command::ExecutionFail(cmd) => self.execution_fail(cmd).await,
            Command::PipelineQueue(cmd) => self.pipeline_queue(cmd).await,
            Command::PipelineStart(cmd) => self.pipeline_start(cmd).await,
            Command::PipelinePlan(cmd) => self.pipeline_plan(cmd).await,
            Command::PipelineFinish(cmd) => self.pipeline_finish(cmd).await,
            Command::PipelineFail(cmd) => self.pipeline_fail(cmd).await,
            Command::PipelineCancel(cmd) => self.pipeline_cancel(cmd).await,
            Command::PipelinePause(cmd) => self.pipeline_pause(cmd).await,
            Command::PipelineResume(cmd) => self.pipeline_resume(cmd).await,
            Command::StepForEachPlan(cmd) => self.step_for_each_plan(cmd).await,
            Command::StepQueue(cmd) => self.step_queue(cmd).await,
            Command::StepStart(cmd) => self.step_start(cmd).await,
            Command::StepPipelineFinish(cmd) => self.step_pipeline_finish(cmd).await,
            Command::TriggerStart(cmd) => self.trigger_start(cmd).await,
        }
    }

    /// Resolves the trigger's pipeline arguments from the firing arguments.
    /// A trigger that configures none passes them through unchanged.
    async fn trigger_start(&self, cmd: TriggerStart) -> Handled {
        let Some(mut guard) = self.lock_running(&cmd.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let execution = guard.execution();
        if execution.start_time.is_some() || !execution.pipeline_executions.is_empty() {
            return Ok(Vec::new());
        }

        let trigger = self.definitions.trigger(&cmd.name)?;
        let args = if trigger.args().is_empty() {
            cmd.args.clone()
        } else {
            let ctx = EvalContext::new(cmd.args.clone());
            self.evaluator.resolve_inputs(trigger.args(), &ctx)?
        };

        let event = TriggerStarted {
            event: cmd.event.child(),
            name: cmd.name.clone(),
            trigger_execution_id: cmd.trigger_execution_id.clone(),
            pipeline: trigger.pipeline().to_string(),
            args,
            pipeline_execution_id: new_pipeline_execution_id(),
        };
        guard.append(Command::from(cmd)).await?;
        tracing::info!(
            execution_id = %event.event.execution_id,
            trigger = %event.name,
            pipeline = %event.pipeline,
            "Trigger started"
        );
        Ok(vec![guard.append(Event::from(event)).await?])
    }

    async fn execution_queue(&self, cmd: ExecutionQueue) -> Handled {
        let Some(mut guard) = self.lock_running(&cmd.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let execution = guard.execution();
        if execution.start_time.is_some() || !execution.pipeline_executions.is_empty() {
            return Ok(Vec::new());
        }

        let event = ExecutionQueued {
            event: cmd.event.child(),
            pipeline_queue: cmd.pipeline_queue.clone(),
        };
        guard.append(Command::from(cmd)).await?;
        Ok(vec![guard.append(Event::from(event)).await?])
    }

    async fn execution_start(&self, cmd: ExecutionStart) -> Handled {
        let Some(mut guard) = self.lock_running(&cmd.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let execution = guard.execution();
        if execution.status != ExecutionStatus::Queued || execution.start_time.is_some() {
            return Ok(Vec::new());
        }

        let event = ExecutionStarted {
            event: cmd.event.child(),
            pipeline_queue: cmd.pipeline_queue.clone(),
        };
        guard.append(Command::from(cmd)).await?;
        tracing::info!(
            execution_id = %event.event.execution_id,
            pipeline = %event.pipeline_queue.name,
            "Execution started"
        );
        Ok(vec![guard.append(Event::from(event)).await?])
    }

    async fn execution_finish(&self, cmd: ExecutionFinish) -> Handled {
        let Some(mut guard) = self.lock_running(&cmd.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let event = ExecutionFinished {
            event: cmd.event.child(),
        };
        guard.append(Command::from(cmd)).await?;
        Ok(vec![guard.append(Event::from(event)).await?])
    }

    async fn execution_fail(&self, cmd: ExecutionFail) -> Handled {
        let Some(mut guard) = self.lock_running(&cmd.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let event = ExecutionFailed {
            event: cmd.event.child(),
            errors: cmd.errors.clone(),
        };
        guard.append(Command::from(cmd)).await?;
        Ok(vec![guard.append(Event::from(event)).await?])
    }

    async fn pipeline_queue(&self, cmd: PipelineQueue) -> Handled {
        let Some(mut guard) = self.lock_running(&cmd.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        if guard
            .execution()
            .pipeline_executions
            .contains_key(&cmd.pipeline_execution_id)
        {
            return Ok(Vec::new());
        }

        if let Err(err) = self.definitions.pipeline(&cmd.name) {
            let (Some(parent_pex), Some(parent_step)) = (
                cmd.parent_pipeline_execution_id.clone(),
                cmd.parent_step_execution_id.clone(),
            ) else {
                return Err(err);
            };
            // A child that can not be loaded fails the step that launched it.
            tracing::warn!(pipeline = %cmd.name, error = %err, "Child pipeline not found");
            return Ok(vec![Command::from(StepPipelineFinish {
                event: cmd.event.child(),
                pipeline_execution_id: parent_pex,
                step_execution_id: parent_step,
                child_pipeline_execution_id: cmd.pipeline_execution_id,
                output: Input::new(),
                errors: vec![StepError::new(err.into_error_model())],
            })
            .into()]);
        }

        let event = PipelineQueued {
            event: cmd.event.child(),
            name: cmd.name.clone(),
            args: cmd.args.clone(),
            pipeline_execution_id: cmd.pipeline_execution_id.clone(),
            parent_pipeline_execution_id: cmd.parent_pipeline_execution_id.clone(),
            parent_step_execution_id: cmd.parent_step_execution_id.clone(),
        };
        guard.append(Command::from(cmd)).await?;
        Ok(vec![guard.append(Event::from(event)).await?])
    }

    async fn pipeline_start(&self, cmd: PipelineStart) -> Handled {
        let Some(mut guard) = self.lock_running(&cmd.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let pex = guard.execution().pipeline_execution(&cmd.pipeline_execution_id)?;
        if pex.status != PipelineStatus::Queued {
            return Ok(Vec::new());
        }

        let event = PipelineStarted {
            event: cmd.event.child(),
            pipeline_execution_id: cmd.pipeline_execution_id.clone(),
        };
        guard.append(Command::from(cmd)).await?;
        Ok(vec![guard.append(Event::from(event)).await?])
    }

    async fn pipeline_plan(&self, cmd: PipelinePlan) -> Handled {
        let Some(mut guard) = self.lock_running(&cmd.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let pex = guard.execution().pipeline_execution(&cmd.pipeline_execution_id)?;
        if pex.status != PipelineStatus::Started {
            return Ok(Vec::new());
        }

        let defn = self.definitions.pipeline(&pex.name)?;
        let next_steps = plan_pipeline(pex, &defn, self.evaluator.as_ref())?;
        let event = PipelinePlanned {
            event: cmd.event.child(),
            pipeline_execution_id: cmd.pipeline_execution_id.clone(),
            next_steps,
        };
        guard.append(Command::from(cmd)).await?;
        Ok(vec![guard.append(Event::from(event)).await?])
    }

    async fn step_for_each_plan(&self, cmd: StepForEachPlan) -> Handled {
        let Some(mut guard) = self.lock_running(&cmd.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let pex = guard.execution().pipeline_execution(&cmd.pipeline_execution_id)?;
        if pex.status != PipelineStatus::Started {
            return Ok(Vec::new());
        }

        let defn = self.definitions.pipeline(&pex.name)?;
        let next_steps = plan_for_each(pex, &defn, &cmd.step_name, self.evaluator.as_ref())?;
        let event = StepForEachPlanned {
            event: cmd.event.child(),
            pipeline_execution_id: cmd.pipeline_execution_id.clone(),
            step_name: cmd.step_name.clone(),
            next_steps,
        };
        guard.append(Command::from(cmd)).await?;
        Ok(vec![guard.append(Event::from(event)).await?])
    }

    /// Evaluates the pipeline's outputs and finishes it, or fails it if an
    /// output can not be evaluated or a step failed.
    async fn pipeline_finish(&self, cmd: PipelineFinish) -> Handled {
        let Some(mut guard) = self.lock_running(&cmd.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let pex = guard.execution().pipeline_execution(&cmd.pipeline_execution_id)?;
        if pex.status != PipelineStatus::Started || !pex.is_complete() {
            return Ok(Vec::new());
        }

        let defn = self.definitions.pipeline(&pex.name)?;
        let ctx = pex.eval_context();
        let mut output = Input::new();
        let mut errors = pex.errors.clone();
        for config in defn.output_config() {
            match self.evaluator.evaluate(&config.value, &ctx) {
                Ok(value) => {
                    output.insert(config.name.clone(), value);
                }
                Err(err) => {
                    errors.push(
                        StepError::new(err)
                            .with_step(pex.name.clone(), String::new())
                            .with_execution_ids(pex.id.clone(), String::new()),
                    );
                    break;
                }
            }
        }

        let envelope = cmd.event.child();
        let pipeline_execution_id = cmd.pipeline_execution_id.clone();
        let event = if errors.is_empty() {
            Event::from(PipelineFinished {
                event: envelope,
                pipeline_execution_id,
                output,
            })
        } else {
            Event::from(PipelineFailed {
                event: envelope,
                pipeline_execution_id,
                errors,
                output,
            })
        };
        guard.append(Command::from(cmd)).await?;
        Ok(vec![guard.append(event).await?])
    }

    async fn pipeline_fail(&self, cmd: PipelineFail) -> Handled {
        let Some(mut guard) = self.lock_running(&cmd.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let execution = guard.execution();
        let Some(pex) = execution.pipeline_executions.get(&cmd.pipeline_execution_id) else {
            // Failed before it was queued: only the execution is left to fail.
            return Ok(vec![Command::from(ExecutionFail {
                event: cmd.event.child(),
                errors: cmd.error.into_iter().map(StepError::new).collect(),
            })
            .into()]);
        };
        if pex.is_terminal() {
            return Ok(Vec::new());
        }

        let mut errors = pex.errors.clone();
        if let Some(error) = &cmd.error {
            errors.push(
                StepError::new(error.clone())
                    .with_step(pex.name.clone(), String::new())
                    .with_execution_ids(pex.id.clone(), String::new()),
            );
        }
        let event = PipelineFailed {
            event: cmd.event.child(),
            pipeline_execution_id: pex.id.clone(),
            errors,
            output: pex.output.clone(),
        };
        let cancels = cancel_children(execution, &pex.id, &cmd.event, "parent pipeline failed");
        tracing::warn!(
            pipeline_execution_id = %pex.id,
            pipeline = %pex.name,
            errors = event.errors.len(),
            "Pipeline failed"
        );

        guard.append(Command::from(cmd)).await?;
        let mut follow_ups = vec![guard.append(Event::from(event)).await?];
        follow_ups.extend(cancels);
        Ok(follow_ups)
    }

    async fn pipeline_cancel(&self, cmd: PipelineCancel) -> Handled {
        let Some(mut guard) = self.lock_running(&cmd.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let execution = guard.execution();
        let pex = execution.pipeline_execution(&cmd.pipeline_execution_id)?;
        if pex.is_terminal() {
            return Ok(Vec::new());
        }

        let cancels = cancel_children(execution, &pex.id, &cmd.event, &cmd.reason);
        let event = PipelineCanceled {
            event: cmd.event.child(),
            pipeline_execution_id: cmd.pipeline_execution_id.clone(),
            reason: cmd.reason.clone(),
        };
        guard.append(Command::from(cmd)).await?;
        if let Some(token) = self.tokens.get(&event.pipeline_execution_id) {
            token.cancel(event.reason.clone());
        }
        tracing::info!(
            pipeline_execution_id = %event.pipeline_execution_id,
            reason = %event.reason,
            "Pipeline canceled"
        );

        let mut follow_ups = vec![guard.append(Event::from(event)).await?];
        follow_ups.extend(cancels);
        Ok(follow_ups)
    }

    async fn pipeline_pause(&self, cmd: PipelinePause) -> Handled {
        let Some(mut guard) = self.lock_running(&cmd.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let pex = guard.execution().pipeline_execution(&cmd.pipeline_execution_id)?;
        if pex.status != PipelineStatus::Started {
            return Ok(Vec::new());
        }

        let event = PipelinePaused {
            event: cmd.event.child(),
            pipeline_execution_id: cmd.pipeline_execution_id.clone(),
        };
        guard.append(Command::from(cmd)).await?;
        tracing::info!(pipeline_execution_id = %event.pipeline_execution_id, "Pipeline paused");
        Ok(vec![guard.append(Event::from(event)).await?])
    }

    async fn pipeline_resume(&self, cmd: PipelineResume) -> Handled {
        let Some(mut guard) = self.lock_running(&cmd.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let pex = guard.execution().pipeline_execution(&cmd.pipeline_execution_id)?;
        if !pex.is_paused() {
            return Ok(Vec::new());
        }

        let event = PipelineResumed {
            event: cmd.event.child(),
            pipeline_execution_id: cmd.pipeline_execution_id.clone(),
        };
        guard.append(Command::from(cmd)).await?;
        tracing::info!(pipeline_execution_id = %event.pipeline_execution_id, "Pipeline resumed");
        Ok(vec![guard.append(Event::from(event)).await?])
    }
}

/// Cancel commands for the running child pipelines of a pipeline execution.
fn cancel_children(
    execution: &Execution,
    pipeline_execution_id: &str,
    envelope: &Envelope,
    reason: &str,
) -> Vec<LogEntry> {
    execution
        .pipeline_executions
        .values()
        .filter(|child| {
            child.parent_pipeline_execution_id.as_deref() == Some(pipeline_execution_id)
                && !child.is_terminal()
        })
        .map(|child| {
            Command::from(PipelineCancel {
                event: envelope.child(),
                pipeline_execution_id: child.id.clone(),
                reason: reason.to_string(),
            })
            .into()
        })
        .collect()
}
