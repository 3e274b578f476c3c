//! Core domain model types for pipeflow.
//!
//! This module contains the value types shared by every layer:
//! - Status, failure mode and step type enums
//! - Primitive output
//! - For-each, loop and retry control records
//! - Planner decisions

mod output;
mod status;

pub use output::{Input, NextStep, Output, StepForEach, StepLoop, StepRetry};
pub use status::{
    ExecutionStatus, FailureMode, NextStepAction, PipelineStatus, StepExecutionStatus, StepType,
};
