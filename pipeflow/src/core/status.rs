//! Status, failure mode and step type enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of primitive a step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// An HTTP request.
    Http,
    /// A database query.
    Query,
    /// A container run.
    Container,
    /// A function invocation.
    Function,
    /// A child pipeline launch.
    Pipeline,
    /// A timed pause.
    Sleep,
    /// Returns its input.
    Echo,
    /// Sends an email.
    Email,
    /// Waits for human input.
    Input,
    /// Sends a message to an integration.
    Message,
    /// Pure value transform.
    Transform,
}

impl Default for StepType {
    fn default() -> Self {
        Self::Transform
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StepType {
    /// Returns the lowercase name used in step full names and semaphore keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Query => "query",
            Self::Container => "container",
            Self::Function => "function",
            Self::Pipeline => "pipeline",
            Self::Sleep => "sleep",
            Self::Echo => "echo",
            Self::Email => "email",
            Self::Input => "input",
            Self::Message => "message",
            Self::Transform => "transform",
        }
    }

    /// Returns true if in-flight primitives of this type are globally limited.
    #[must_use]
    pub const fn is_globally_limited(&self) -> bool {
        matches!(self, Self::Http | Self::Query | Self::Container | Self::Function)
    }
}

/// Status of an execution (one trigger firing or top-level pipeline run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Accepted, not yet started.
    Queued,
    /// Running.
    Started,
    /// Paused by request.
    Paused,
    /// Completed successfully.
    Finished,
    /// Completed with errors.
    Failed,
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Started => write!(f, "started"),
            Self::Paused => write!(f, "paused"),
            Self::Finished => write!(f, "finished"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl ExecutionStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Status of a pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Queued, not yet started.
    Queued,
    /// Running.
    Started,
    /// Paused by request.
    Paused,
    /// Canceled by request.
    Canceled,
    /// All steps complete, output being computed.
    Finishing,
    /// Completed successfully.
    Finished,
    /// Completed with errors.
    Failed,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Started => write!(f, "started"),
            Self::Paused => write!(f, "paused"),
            Self::Canceled => write!(f, "canceled"),
            Self::Finishing => write!(f, "finishing"),
            Self::Finished => write!(f, "finished"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl PipelineStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Finished | Self::Failed)
    }

    /// Returns true if planning must not proceed in this status.
    ///
    /// A failed pipeline also blocks planning so steps still in flight when
    /// the failure was recorded cannot queue further work.
    #[must_use]
    pub const fn blocks_planning(&self) -> bool {
        matches!(
            self,
            Self::Canceled | Self::Paused | Self::Finishing | Self::Finished | Self::Failed
        )
    }
}

/// Status of a single step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    /// Queued, primitive not yet invoked.
    Starting,
    /// Primitive running.
    Started,
    /// Primitive completed successfully.
    Finished,
    /// Primitive completed with errors.
    Failed,
    /// The step's `if` condition was false.
    Skipped,
}

impl Default for StepExecutionStatus {
    fn default() -> Self {
        Self::Starting
    }
}

impl fmt::Display for StepExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Started => write!(f, "started"),
            Self::Finished => write!(f, "finished"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// How a step failure is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Subject to throw, retry and the error config.
    Standard,
    /// The step's error config ignores the failure.
    Ignored,
    /// Not retryable; the engine itself failed to process the step.
    Fatal,
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Ignored => write!(f, "ignored"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// What the planner decided for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextStepAction {
    /// Run the step.
    Start,
    /// The step's `if` condition is false; record it without running.
    Skip,
    /// A dependency failed permanently; the step can never run.
    Inaccessible,
}

impl fmt::Display for NextStepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Skip => write!(f, "skip"),
            Self::Inaccessible => write!(f, "inaccessible"),
        }
    }
}
