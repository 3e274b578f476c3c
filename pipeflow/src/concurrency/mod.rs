//! Three-tier step concurrency limiting.
//!
//! Before a step primitive runs it takes one permit from each tier that
//! applies to it:
//!
//! - the step's own `max_concurrency`, scoped to one pipeline execution;
//! - the pipeline definition's `max_concurrency`, shared by every execution
//!   of that pipeline;
//! - the global limit of the step type (`http`, `query`, `container`,
//!   `function`).
//!
//! Permits are released when the returned [`StepPermits`] is dropped.

mod config;
mod limiter;

pub use config::ConcurrencyConfig;
pub use limiter::{ConcurrencyLimiter, PermitRequest, StepPermits};
