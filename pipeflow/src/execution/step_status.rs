//! Per (step, fan-out key) bookkeeping.

use crate::errors::FatalError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Tracks every step execution of one step for one fan-out key.
///
/// A step execution id moves `queued -> started -> finished | failed`. Once
/// it is finished or failed it can never transition again; attempting to is
/// a [`FatalError`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatus {
    /// Branch created by a for-each plan, not yet queued.
    pub initializing: bool,
    /// Queued step executions.
    pub queued: BTreeSet<String>,
    /// Started step executions.
    pub started: BTreeSet<String>,
    /// Finished step executions.
    pub finished: BTreeSet<String>,
    /// Failed step executions.
    pub failed: BTreeSet<String>,
    /// Another loop iteration is pending.
    pub loop_hold: bool,
    /// Another retry attempt is pending.
    pub error_hold: bool,
    /// Ended step executions in order.
    pub step_executions: Vec<String>,
}

impl StepStatus {
    /// A for-each branch that has been planned but not queued.
    #[must_use]
    pub fn initializing() -> Self {
        Self {
            initializing: true,
            ..Self::default()
        }
    }

    fn guard(&self, step_execution_id: &str, transition: &'static str) -> Result<(), FatalError> {
        if self.finished.contains(step_execution_id) {
            return Err(FatalError::new(step_execution_id, transition, "already finished"));
        }
        if self.failed.contains(step_execution_id) {
            return Err(FatalError::new(step_execution_id, transition, "already failed"));
        }
        Ok(())
    }

    /// Records a queued step execution.
    pub fn queue(&mut self, step_execution_id: &str) -> Result<(), FatalError> {
        self.guard(step_execution_id, "queue")?;
        self.initializing = false;
        self.queued.insert(step_execution_id.to_string());
        Ok(())
    }

    /// Records a started step execution.
    pub fn start(&mut self, step_execution_id: &str) -> Result<(), FatalError> {
        self.guard(step_execution_id, "start")?;
        self.queued.remove(step_execution_id);
        self.started.insert(step_execution_id.to_string());
        Ok(())
    }

    /// Records a finished step execution and the holds it leaves behind.
    pub fn finish(
        &mut self,
        step_execution_id: &str,
        loop_hold: bool,
        error_hold: bool,
    ) -> Result<(), FatalError> {
        self.guard(step_execution_id, "finish")?;
        self.queued.remove(step_execution_id);
        self.started.remove(step_execution_id);
        self.finished.insert(step_execution_id.to_string());
        self.loop_hold = loop_hold;
        self.error_hold = error_hold;
        Ok(())
    }

    /// Records a failed step execution. Clears both holds.
    pub fn fail(&mut self, step_execution_id: &str) -> Result<(), FatalError> {
        self.guard(step_execution_id, "fail")?;
        self.queued.remove(step_execution_id);
        self.started.remove(step_execution_id);
        self.failed.insert(step_execution_id.to_string());
        self.loop_hold = false;
        self.error_hold = false;
        Ok(())
    }

    /// Appends an ended step execution.
    pub fn record_execution(&mut self, step_execution_id: &str) {
        self.step_executions.push(step_execution_id.to_string());
    }

    /// Nothing in flight, nothing pending.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.initializing
            && self.queued.is_empty()
            && self.started.is_empty()
            && !self.loop_hold
            && !self.error_hold
    }

    /// Any step execution failed.
    #[must_use]
    pub fn is_fail(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Any step execution is queued.
    #[must_use]
    pub fn is_queued(&self) -> bool {
        !self.queued.is_empty()
    }

    /// Any step execution is started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        !self.started.is_empty()
    }

    /// Queued or started.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.is_queued() || self.is_started()
    }

    /// Any step execution was ever recorded for this entry.
    #[must_use]
    pub fn has_executions(&self) -> bool {
        self.is_in_flight() || !self.step_executions.is_empty()
    }

    /// The most recently ended step execution.
    #[must_use]
    pub fn last_execution(&self) -> Option<&str> {
        self.step_executions.last().map(String::as_str)
    }
}
