//! Identifier generation.
//!
//! Execution identifiers are prefixed UUID v7 values so they sort by
//! creation time in logs and file listings.

use uuid::Uuid;

fn prefixed(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7().simple())
}

/// New identifier for an execution.
#[must_use]
pub fn new_execution_id() -> String {
    prefixed("exec")
}

/// New identifier for a pipeline execution.
#[must_use]
pub fn new_pipeline_execution_id() -> String {
    prefixed("pexec")
}

/// New identifier for a trigger execution.
#[must_use]
pub fn new_trigger_execution_id() -> String {
    prefixed("texec")
}

/// New identifier for a step execution.
#[must_use]
pub fn new_step_execution_id() -> String {
    prefixed("sexec")
}
