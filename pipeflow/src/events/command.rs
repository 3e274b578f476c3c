//! Command payloads. A command asks a single handler to do something.

use super::Envelope;
use crate::core::{Input, NextStepAction, StepForEach, StepLoop, StepRetry};
use crate::errors::{ErrorModel, StepError};
use serde::{Deserialize, Serialize};

/// Queue a new execution running one root pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionQueue {
    /// Event reference.
    pub event: Envelope,
    /// The root pipeline to queue once the execution starts.
    pub pipeline_queue: PipelineQueue,
}

/// Start a queued execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStart {
    /// Event reference.
    pub event: Envelope,
    /// The root pipeline to queue.
    pub pipeline_queue: PipelineQueue,
}

/// Mark an execution finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFinish {
    /// Event reference.
    pub event: Envelope,
}

/// Mark an execution failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFail {
    /// Event reference.
    pub event: Envelope,
    /// Errors causing the failure.
    #[serde(default)]
    pub errors: Vec<StepError>,
}

/// Start the pipeline behind a named trigger in a new execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerStart {
    /// Event reference.
    pub event: Envelope,
    /// Trigger definition name.
    pub name: String,
    /// Identifier of the new trigger execution.
    pub trigger_execution_id: String,
    /// Arguments the trigger fired with.
    #[serde(default)]
    pub args: Input,
}

/// Queue a pipeline execution, root or child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineQueue {
    /// Event reference.
    pub event: Envelope,
    /// Pipeline definition name.
    pub name: String,
    /// Pipeline arguments.
    #[serde(default)]
    pub args: Input,
    /// Identifier of the new pipeline execution.
    pub pipeline_execution_id: String,
    /// Parent pipeline execution, for child pipelines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_pipeline_execution_id: Option<String>,
    /// Parent step execution, for child pipelines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_execution_id: Option<String>,
}

/// Start a queued pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStart {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
}

/// Compute the next steps of a pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePlan {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
}

/// Compute outputs and finish a complete pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFinish {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
}

/// Fail a pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFail {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
    /// Error raised by the engine itself, in addition to step errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorModel>,
}

/// Cancel a pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCancel {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
    /// Why it is canceled.
    #[serde(default)]
    pub reason: String,
}

/// Pause a pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePause {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
}

/// Resume a paused pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResume {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
}

/// Expand the branches of a `for_each` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepForEachPlan {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
    /// Step full name.
    pub step_name: String,
}

/// Queue one step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepQueue {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
    /// Identifier of the new step execution.
    pub step_execution_id: String,
    /// Step full name.
    pub step_name: String,
    /// Run or skip.
    pub action: NextStepAction,
    /// Resolved input.
    #[serde(default)]
    pub input: Input,
    /// Fan-out branch; key `"0"` for steps without `for_each`.
    pub step_for_each: StepForEach,
    /// Loop record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_loop: Option<StepLoop>,
    /// Retry record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_retry: Option<StepRetry>,
    /// Per-pipeline-execution limit on concurrent instances of this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Delay before the step is published as queued.
    #[serde(default)]
    pub delay_ms: u64,
}

/// Start a queued step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStart {
    /// Event reference.
    pub event: Envelope,
    /// Target pipeline execution.
    pub pipeline_execution_id: String,
    /// Target step execution.
    pub step_execution_id: String,
}

/// Report a child pipeline's result to the step that launched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPipelineFinish {
    /// Event reference.
    pub event: Envelope,
    /// Parent pipeline execution.
    pub pipeline_execution_id: String,
    /// Parent step execution.
    pub step_execution_id: String,
    /// The child pipeline execution.
    pub child_pipeline_execution_id: String,
    /// Child pipeline output.
    #[serde(default)]
    pub output: Input,
    /// Child pipeline errors; empty on success.
    #[serde(default)]
    pub errors: Vec<StepError>,
}
