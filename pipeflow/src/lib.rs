//! # Pipeflow
//!
//! An event-sourced pipeline execution engine.
//!
//! A pipeline is a set of typed steps wired by dependencies. Pipeflow runs
//! them as a state machine driven by commands and events, and every
//! transition is appended to a per-execution log before anything acts on
//! it. Replaying the log rebuilds the exact state, so an execution can be
//! inspected, resumed or audited after the fact.
//!
//! - **Planning**: dependencies, `if` conditions and `for_each` fan-out
//! - **Step lifecycle**: error handling, `throw`, `retry` with backoff, `loop`
//! - **Concurrency**: per-step, per-pipeline and global per-type limits
//! - **Control**: cancel, pause and resume pipeline executions
//! - **Child pipelines**: a step may run another pipeline and take its output
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipeflow::prelude::*;
//!
//! let definitions = Arc::new(InMemoryDefinitionProvider::new());
//! definitions.register(
//!     PipelineDefinition::new("deploy")
//!         .with_step(StepDefinition::new(StepType::Http, "fetch").with_input("url", "param.url"))
//!         .with_step(StepDefinition::new(StepType::Echo, "report").with_depends_on("http.fetch")),
//! )?;
//!
//! let engine = Engine::open(EngineConfig::from_env(), definitions, Arc::new(PathEvaluator), runner).await?;
//! let execution_id = engine.start_pipeline("deploy", args)?;
//! let execution = engine.wait_for_execution(&execution_id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod concurrency;
pub mod config;
pub mod core;
pub mod definition;
pub mod engine;
pub mod errors;
pub mod eval;
pub mod events;
pub mod execution;
pub mod lifecycle;
pub mod observability;
pub mod planner;
pub mod registry;
pub mod runner;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::concurrency::{ConcurrencyConfig, ConcurrencyLimiter};
    pub use crate::config::EngineConfig;
    pub use crate::core::{
        ExecutionStatus, FailureMode, Input, NextStep, NextStepAction, Output, PipelineStatus,
        StepExecutionStatus, StepType,
    };
    pub use crate::definition::{
        DefinitionProvider, InMemoryDefinitionProvider, LoopConfig, OutputConfig,
        PipelineDefinition, StepDefinition, ThrowConfig, TriggerDefinition,
    };
    pub use crate::engine::Engine;
    pub use crate::errors::{ErrorModel, FatalError, PipeflowError, StepError};
    pub use crate::eval::{EvalContext, Expr, ExpressionEvaluator, PathEvaluator};
    pub use crate::events::{Command, Event, LogEntry};
    pub use crate::execution::{Execution, PipelineExecution, StepExecution, TriggerExecution};
    pub use crate::lifecycle::RetryConfig;
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::runner::{BuiltinRunner, PrimitiveRequest, PrimitiveRunner};
    pub use crate::store::{EventLogStore, InMemoryEventStore, JsonlEventStore};
    pub use crate::utils::Timestamp;
}
