//! One concrete run of a step.

use crate::core::{
    Input, NextStepAction, Output, StepExecutionStatus, StepForEach, StepLoop, StepRetry,
};
use crate::events::StepQueue;
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};

/// A step execution, owned by its pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    /// Step execution identifier.
    pub id: String,
    /// Owning pipeline execution.
    pub pipeline_execution_id: String,
    /// Step full name.
    pub name: String,
    /// Current status.
    pub status: StepExecutionStatus,
    /// Run or skip.
    pub action: NextStepAction,
    /// Resolved input.
    pub input: Input,
    /// Fan-out branch.
    pub step_for_each: StepForEach,
    /// Loop record.
    pub step_loop: Option<StepLoop>,
    /// Retry record.
    pub step_retry: Option<StepRetry>,
    /// Per-pipeline-execution concurrency limit for this step.
    pub max_concurrency: Option<usize>,
    /// Primitive output, once ended.
    pub output: Option<Output>,
    /// Configured `output` values, once ended.
    pub step_output: Input,
    /// Child pipeline, for `pipeline` steps.
    pub child_pipeline_execution_id: Option<String>,
    /// When the primitive started.
    pub start_time: Option<Timestamp>,
    /// When the step ended.
    pub end_time: Option<Timestamp>,
}

impl StepExecution {
    /// Creates the step execution a queue command describes.
    #[must_use]
    pub fn queued(cmd: &StepQueue) -> Self {
        Self {
            id: cmd.step_execution_id.clone(),
            pipeline_execution_id: cmd.pipeline_execution_id.clone(),
            name: cmd.step_name.clone(),
            status: StepExecutionStatus::Starting,
            action: cmd.action,
            input: cmd.input.clone(),
            step_for_each: cmd.step_for_each.clone(),
            step_loop: cmd.step_loop.clone(),
            step_retry: cmd.step_retry.clone(),
            max_concurrency: cmd.max_concurrency,
            output: None,
            step_output: Input::new(),
            child_pipeline_execution_id: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Fan-out key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.step_for_each.key
    }

    /// Returns true once a step finished event was folded.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.output.is_some()
    }
}
