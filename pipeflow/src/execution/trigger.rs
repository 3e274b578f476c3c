//! The trigger that opened an execution.

use crate::core::Input;
use crate::events::TriggerStarted;
use serde::{Deserialize, Serialize};

/// Record of a fired trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerExecution {
    /// Trigger execution identifier.
    pub id: String,
    /// Trigger definition name.
    pub name: String,
    /// Pipeline the trigger starts.
    pub pipeline: String,
    /// Resolved pipeline arguments.
    pub args: Input,
    /// The root pipeline execution it queued.
    pub pipeline_execution_id: String,
}

impl TriggerExecution {
    /// The record a started trigger leaves.
    #[must_use]
    pub fn started(event: &TriggerStarted) -> Self {
        Self {
            id: event.trigger_execution_id.clone(),
            name: event.name.clone(),
            pipeline: event.pipeline.clone(),
            args: event.args.clone(),
            pipeline_execution_id: event.pipeline_execution_id.clone(),
        }
    }
}
