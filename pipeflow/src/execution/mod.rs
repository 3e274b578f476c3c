//! Execution state rebuilt from the log.
//!
//! - [`Execution`]: the aggregate for one execution and its reducer
//! - [`PipelineExecution`]: one running pipeline, with completeness queries
//! - [`StepExecution`]: one run of one step
//! - [`StepStatus`]: per (step, fan-out key) transition bookkeeping
//! - [`TriggerExecution`]: the trigger an execution was started by
//! - [`ExecutionCache`]: terminal executions kept for a grace period

mod aggregate;
mod cache;
mod pipeline;
mod step;
mod step_status;
mod trigger;

pub use aggregate::Execution;
pub use cache::ExecutionCache;
pub use pipeline::{PipelineExecution, StepStatusMap};
pub use step::StepExecution;
pub use step_status::StepStatus;
pub use trigger::TriggerExecution;
