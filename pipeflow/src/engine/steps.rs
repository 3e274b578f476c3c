//! Step command handlers: queueing, starting, and ending step executions.

use super::{EngineInner, Handled};
use crate::cancellation;
use crate::concurrency::PermitRequest;
use crate::core::{NextStepAction, Output, StepExecutionStatus, StepType};
use crate::definition::{PipelineDefinition, StepDefinition};
use crate::errors::{ErrorModel, PipeflowError};
use crate::eval::EvalContext;
use crate::events::{
    Command, Envelope, Event, StepFinished, StepPipelineFinish, StepPipelineStarted, StepQueue,
    StepQueued, StepStart,
};
use crate::execution::{PipelineExecution, StepExecution, StepStatus};
use crate::lifecycle::{end_step, EndStepRequest};
use crate::observability::{step_span, SpanTimer, StepSpanAttributes};
use crate::runner::PrimitiveRequest;
use crate::utils::new_pipeline_execution_id;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

impl EngineInner {
    /// Records a step execution, waits out its retry delay, then publishes
    /// it as queued.
    pub(super) async fn step_queue(&self, cmd: StepQueue) -> Handled {
        let envelope = cmd.event.clone();
        let pipeline_execution_id = cmd.pipeline_execution_id.clone();
        let step_execution_id = cmd.step_execution_id.clone();
        let delay_ms = cmd.delay_ms;
        {
            let Some(mut guard) = self.lock_running(&envelope.execution_id).await? else {
                return Ok(Vec::new());
            };
            let pex = guard.execution().pipeline_execution(&pipeline_execution_id)?;
            if pex.is_terminal() || pex.step_executions.contains_key(&step_execution_id) {
                return Ok(Vec::new());
            }
            if is_duplicate_plan(pex, &cmd) {
                tracing::debug!(step = %cmd.step_name, key = %cmd.step_for_each.key, "Step already queued by an earlier plan");
                return Ok(Vec::new());
            }
            guard.append(Command::from(cmd)).await?;
        }

        if delay_ms > 0 {
            tracing::debug!(step_execution_id = %step_execution_id, delay_ms, "Delaying step execution");
            let token = self.token(&pipeline_execution_id);
            match cancellation::sleep(Duration::from_millis(delay_ms), &token).await {
                Ok(()) => {}
                Err(PipeflowError::Cancelled(_)) => return Ok(Vec::new()),
                Err(err) => return Err(err),
            }
        }

        let Some(mut guard) = self.lock_running(&envelope.execution_id).await? else {
            return Ok(Vec::new());
        };
        if guard
            .execution()
            .pipeline_execution(&pipeline_execution_id)?
            .is_terminal()
        {
            return Ok(Vec::new());
        }
        let event = StepQueued {
            event: envelope.child(),
            pipeline_execution_id,
            step_execution_id,
        };
        Ok(vec![guard.append(Event::from(event)).await?])
    }

    /// Starts a queued step execution.
    ///
    /// Skipped steps end immediately and pipeline steps launch their child.
    /// Anything else waits for its concurrency permits without holding the
    /// execution lock, runs its primitive, and ends with the result.
    pub(super) async fn step_start(&self, cmd: StepStart) -> Handled {
        let Some(_claim) = StartClaim::new(&self.starting, &cmd.step_execution_id) else {
            return Ok(Vec::new());
        };
        let Some(mut guard) = self.lock_running(&cmd.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let execution = guard.execution();
        let pex = execution.pipeline_execution(&cmd.pipeline_execution_id)?;
        let se = execution.step_execution(&cmd.pipeline_execution_id, &cmd.step_execution_id)?;
        if pex.blocks_planning() || se.status != StepExecutionStatus::Starting {
            return Ok(Vec::new());
        }

        let defn = self.definitions.pipeline(&pex.name)?;
        let step = step_definition(&defn, pex, se)?;

        if se.action == NextStepAction::Skip {
            let event = self.end_step_execution(cmd.event.child(), pex, se, step, Output::skipped());
            guard.append(Command::from(cmd)).await?;
            return Ok(vec![guard.append(Event::from(event)).await?]);
        }

        if step.step_type() == StepType::Pipeline {
            let child_pipeline = step.pipeline().ok_or_else(|| {
                PipeflowError::bad_request(format!("step {} names no pipeline", se.name))
            })?;
            let event = StepPipelineStarted {
                event: cmd.event.child(),
                pipeline_execution_id: pex.id.clone(),
                step_execution_id: se.id.clone(),
                child_pipeline_execution_id: new_pipeline_execution_id(),
                child_pipeline: child_pipeline.to_string(),
                args: se.input.clone(),
            };
            guard.append(Command::from(cmd)).await?;
            return Ok(vec![guard.append(Event::from(event)).await?]);
        }

        let request = PrimitiveRequest {
            step_type: step.step_type(),
            step_name: se.name.clone(),
            pipeline: pex.name.clone(),
            execution_id: execution.id.clone(),
            pipeline_execution_id: pex.id.clone(),
            step_execution_id: se.id.clone(),
            input: se.input.clone(),
        };
        let step_max_concurrency = se.max_concurrency;
        drop(guard);

        let token = self.token(&request.pipeline_execution_id);
        let permit_request = PermitRequest {
            step_type: request.step_type,
            pipeline: &request.pipeline,
            pipeline_max_concurrency: defn.max_concurrency(),
            pipeline_execution_id: &request.pipeline_execution_id,
            step_name: &request.step_name,
            step_max_concurrency,
        };
        let permits = match self.limiter.acquire(&permit_request, &token).await {
            Ok(permits) => permits,
            Err(PipeflowError::Cancelled(reason)) => {
                tracing::debug!(step_execution_id = %request.step_execution_id, reason = %reason, "Step canceled before start");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        {
            let Some(mut guard) = self.lock_running(&request.execution_id).await? else {
                return Ok(Vec::new());
            };
            let execution = guard.execution();
            let pex = execution.pipeline_execution(&request.pipeline_execution_id)?;
            let se = execution.step_execution(&pex.id, &request.step_execution_id)?;
            if pex.blocks_planning() || se.status != StepExecutionStatus::Starting {
                return Ok(Vec::new());
            }
            guard.append(Command::from(cmd.clone())).await?;
        }

        let attributes = StepSpanAttributes::new(
            request.execution_id.clone(),
            request.pipeline_execution_id.clone(),
            request.step_execution_id.clone(),
            request.step_name.clone(),
        );
        let span = step_span(&attributes);
        let timer = SpanTimer::start(request.step_name.clone());
        let result = self
            .runner
            .run(request.clone(), Arc::clone(&token))
            .instrument(span.clone())
            .await;
        drop(permits);

        let output = result.unwrap_or_else(|err| Output::failed(ErrorModel::from(err)));
        let attributes = attributes
            .with_status(output.status.to_string())
            .with_duration_ms(timer.finish());
        attributes.record(&span);
        span.in_scope(|| {
            tracing::info!(status = %output.status, duration_ms = ?attributes.duration_ms, "Step primitive returned");
        });

        let Some(mut guard) = self.lock_running(&request.execution_id).await? else {
            return Ok(Vec::new());
        };
        let execution = guard.execution();
        let pex = execution.pipeline_execution(&request.pipeline_execution_id)?;
        if pex.is_terminal() {
            tracing::debug!(
                step_execution_id = %request.step_execution_id,
                status = %pex.status,
                "Dropping result of step in ended pipeline"
            );
            return Ok(Vec::new());
        }
        let se = execution.step_execution(&pex.id, &request.step_execution_id)?;
        if se.status != StepExecutionStatus::Started {
            return Ok(Vec::new());
        }

        let event = self.end_step_execution(cmd.event.child(), pex, se, step, output);
        Ok(vec![guard.append(Event::from(event)).await?])
    }

    /// Ends a pipeline step with the result of its child pipeline.
    pub(super) async fn step_pipeline_finish(&self, cmd: StepPipelineFinish) -> Handled {
        let Some(mut guard) = self.lock_running(&cmd.event.execution_id).await? else {
            return Ok(Vec::new());
        };
        let execution = guard.execution();
        let pex = execution.pipeline_execution(&cmd.pipeline_execution_id)?;
        if pex.is_terminal() {
            return Ok(Vec::new());
        }
        let se = execution.step_execution(&cmd.pipeline_execution_id, &cmd.step_execution_id)?;
        if se.status != StepExecutionStatus::Started
            || se.child_pipeline_execution_id.as_deref() != Some(cmd.child_pipeline_execution_id.as_str())
        {
            return Ok(Vec::new());
        }

        let defn = self.definitions.pipeline(&pex.name)?;
        let step = step_definition(&defn, pex, se)?;
        let mut output = Output::finished(cmd.output.clone());
        if !cmd.errors.is_empty() {
            output.status = StepExecutionStatus::Failed;
            output.errors = cmd.errors.clone();
        }

        let event = self.end_step_execution(cmd.event.child(), pex, se, step, output);
        guard.append(Command::from(cmd)).await?;
        Ok(vec![guard.append(Event::from(event)).await?])
    }

    /// Resolves a primitive output into the step's finished event.
    fn end_step_execution(
        &self,
        envelope: Envelope,
        pex: &PipelineExecution,
        se: &StepExecution,
        step: &StepDefinition,
        output: Output,
    ) -> StepFinished {
        let request = EndStepRequest {
            step,
            input: &se.input,
            step_loop: se.step_loop.as_ref(),
            step_retry: se.step_retry.as_ref(),
        };
        let mut end = end_step(request, output, self.evaluator.as_ref(), &step_context(pex, se));
        for err in &mut end.output.errors {
            if err.step_execution_id.is_empty() {
                err.pipeline = pex.name.clone();
                err.step = se.name.clone();
                err.pipeline_execution_id = pex.id.clone();
                err.step_execution_id = se.id.clone();
            }
        }

        tracing::debug!(
            step_execution_id = %se.id,
            step = %se.name,
            status = %end.output.status,
            retry_pending = end.retry_pending(),
            loop_pending = end.loop_pending(),
            "Step execution ended"
        );
        StepFinished {
            event: envelope,
            pipeline_execution_id: pex.id.clone(),
            step_execution_id: se.id.clone(),
            output: end.output,
            step_output: end.step_output,
            step_retry: end.step_retry,
            step_loop: end.step_loop,
        }
    }
}

/// Evaluation context of one step execution: the pipeline context plus the
/// branch's `each` and the loop index.
fn step_context(pex: &PipelineExecution, se: &StepExecution) -> EvalContext {
    let mut ctx = pex.eval_context();
    if se.step_for_each.for_each_step {
        ctx = ctx.with_each(se.step_for_each.each_key.clone(), se.step_for_each.each.clone());
    }
    if let Some(step_loop) = &se.step_loop {
        ctx = ctx.with_loop_index(step_loop.index);
    }
    ctx
}

/// A first attempt for an entry that already ran comes from a plan that
/// raced another one, such as a resume re-planning a step whose planned
/// event was still being handled.
fn is_duplicate_plan(pex: &PipelineExecution, cmd: &StepQueue) -> bool {
    let first_attempt = cmd.step_retry.is_none()
        && cmd.step_loop.as_ref().map_or(true, |step_loop| step_loop.index == 0);
    first_attempt
        && pex
            .step_status_for(&cmd.step_name, &cmd.step_for_each.key)
            .is_some_and(StepStatus::has_executions)
}

fn step_definition<'a>(
    defn: &'a PipelineDefinition,
    pex: &PipelineExecution,
    se: &StepExecution,
) -> Result<&'a StepDefinition, PipeflowError> {
    defn.step(&se.name).ok_or_else(|| {
        PipeflowError::not_found(format!("step {} in pipeline {}", se.name, pex.name))
    })
}

/// Marks a step execution as being started for as long as it lives.
struct StartClaim<'a> {
    starting: &'a Mutex<HashSet<String>>,
    step_execution_id: String,
}

impl<'a> StartClaim<'a> {
    /// Returns `None` if another handler is already starting the execution.
    fn new(starting: &'a Mutex<HashSet<String>>, step_execution_id: &str) -> Option<Self> {
        let claimed = starting.lock().insert(step_execution_id.to_string());
        claimed.then(|| Self {
            starting,
            step_execution_id: step_execution_id.to_string(),
        })
    }
}

impl Drop for StartClaim<'_> {
    fn drop(&mut self) {
        self.starting.lock().remove(&self.step_execution_id);
    }
}
