//! Event payloads. An event is a fact already appended to the log.

use super::{Envelope, PipelineQueue};
use crate::core::{Input, NextStep, Output, StepLoop, StepRetry};
use crate::errors::StepError;
use serde::{Deserialize, Serialize};

/// An execution was queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionQueued {
    /// Event reference.
    pub event: Envelope,
    /// The root pipeline to queue once the execution starts.
    pub pipeline_queue: PipelineQueue,
}

/// An execution started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStarted {
    /// Event reference.
    pub event: Envelope,
    /// The root pipeline to queue.
    pub pipeline_queue: PipelineQueue,
}

/// Every root pipeline finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFinished {
    /// Event reference.
    pub event: Envelope,
}

/// A root pipeline failed or was canceled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailed {
    /// Event reference.
    pub event: Envelope,
    /// Errors causing the failure.
    #[serde(default)]
    pub errors: Vec<StepError>,
}

/// A trigger resolved its pipeline arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerStarted {
    /// Event reference.
    pub event: Envelope,
    /// Trigger definition name.
    pub name: String,
    /// The trigger execution.
    pub trigger_execution_id: String,
    /// Pipeline the trigger starts.
    pub pipeline: String,
    /// Resolved pipeline arguments.
    #[serde(default)]
    pub args: Input,
    /// Identifier reserved for the root pipeline execution.
    pub pipeline_execution_id: String,
}

/// A pipeline execution was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineQueued {
    /// Event reference.
    pub event: Envelope,
    /// Pipeline definition name.
    pub name: String,
    /// Pipeline arguments.
    #[serde(default)]
    pub args: Input,
    /// The new pipeline execution.
    pub pipeline_execution_id: String,
    /// Parent pipeline execution, for child pipelines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_pipeline_execution_id: Option<String>,
    /// Parent step execution, for child pipelines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_execution_id: Option<String>,
}

/// A pipeline execution started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStarted {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
}

/// A paused pipeline execution resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResumed {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
}

/// The planner decided the next steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePlanned {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
    /// Steps to start, skip or declare inaccessible.
    #[serde(default)]
    pub next_steps: Vec<NextStep>,
}

/// A pipeline execution was canceled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCanceled {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
    /// Why it was canceled.
    #[serde(default)]
    pub reason: String,
}

/// A pipeline execution was paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePaused {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
}

/// A pipeline execution finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFinished {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
    /// Pipeline output values.
    #[serde(default)]
    pub output: Input,
}

/// A pipeline execution failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFailed {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
    /// Errors causing the failure.
    #[serde(default)]
    pub errors: Vec<StepError>,
    /// Partial output computed before the failure.
    #[serde(default)]
    pub output: Input,
}

/// The branches of a `for_each` step were expanded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepForEachPlanned {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
    /// Step full name.
    pub step_name: String,
    /// One entry per new branch.
    #[serde(default)]
    pub next_steps: Vec<NextStep>,
}

/// A step execution is ready to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepQueued {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
    /// Target step execution.
    pub step_execution_id: String,
}

/// A `pipeline` step launched its child pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPipelineStarted {
    /// Event reference.
    pub event: Envelope,
    /// Parent pipeline execution.
    pub pipeline_execution_id: String,
    /// Parent step execution.
    pub step_execution_id: String,
    /// The child pipeline execution.
    pub child_pipeline_execution_id: String,
    /// Child pipeline name.
    pub child_pipeline: String,
    /// Child pipeline arguments.
    #[serde(default)]
    pub args: Input,
}

/// A step execution ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFinished {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
    /// Target step execution.
    pub step_execution_id: String,
    /// Resolved primitive output.
    pub output: Output,
    /// Configured `output` values.
    #[serde(default)]
    pub step_output: Input,
    /// Retry record after error resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_retry: Option<StepRetry>,
    /// Loop record after loop evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_loop: Option<StepLoop>,
}
