//! One running instance of a pipeline definition.

use super::{StepExecution, StepStatus};
use crate::core::{Input, PipelineStatus};
use crate::errors::StepError;
use crate::eval::EvalContext;
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

/// Step statuses of one step, keyed by fan-out key.
pub type StepStatusMap = BTreeMap<String, StepStatus>;

/// A pipeline execution, root or child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    /// Pipeline execution identifier.
    pub id: String,
    /// Pipeline definition name.
    pub name: String,
    /// Pipeline arguments.
    pub args: Input,
    /// Current status.
    pub status: PipelineStatus,
    /// Step statuses keyed by step full name, then fan-out key.
    pub step_status: BTreeMap<String, StepStatusMap>,
    /// Every step execution, keyed by id.
    pub step_executions: BTreeMap<String, StepExecution>,
    /// The step execution that launched this pipeline, for child pipelines.
    pub parent_step_execution_id: Option<String>,
    /// The pipeline execution of that step.
    pub parent_pipeline_execution_id: Option<String>,
    /// Accumulated errors, de-duplicated by error instance.
    pub errors: Vec<StepError>,
    /// Pipeline output, set when the pipeline finishes or fails.
    pub output: Input,
    /// When the pipeline started.
    pub start_time: Option<Timestamp>,
    /// When the pipeline reached a terminal status.
    pub end_time: Option<Timestamp>,
}

impl PipelineExecution {
    /// Creates a queued pipeline execution.
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Input) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
            status: PipelineStatus::Queued,
            step_status: BTreeMap::new(),
            step_executions: BTreeMap::new(),
            parent_step_execution_id: None,
            parent_pipeline_execution_id: None,
            errors: Vec::new(),
            output: Input::new(),
            start_time: None,
            end_time: None,
        }
    }

    /// Returns true if canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.status == PipelineStatus::Canceled
    }

    /// Returns true if paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.status == PipelineStatus::Paused
    }

    /// Returns true if computing outputs after completion.
    #[must_use]
    pub fn is_finishing(&self) -> bool {
        self.status == PipelineStatus::Finishing
    }

    /// Returns true if finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status == PipelineStatus::Finished
    }

    /// Returns true if failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == PipelineStatus::Failed
    }

    /// Returns true if canceled, finished or failed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if planning and step ending must no-op.
    #[must_use]
    pub fn blocks_planning(&self) -> bool {
        self.status.blocks_planning()
    }

    /// Returns true if a completed pipeline should fail rather than finish.
    #[must_use]
    pub fn should_fail(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns true if a child of another pipeline.
    #[must_use]
    pub fn is_child(&self) -> bool {
        self.parent_step_execution_id.is_some()
    }

    /// Every initialized step has at least one entry and every entry is complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.step_status
            .values()
            .all(|statuses| !statuses.is_empty() && statuses.values().all(StepStatus::is_complete))
    }

    /// Creates an empty status map for a planned step.
    pub fn initialize_step(&mut self, step_name: &str) {
        self.step_status.entry(step_name.to_string()).or_default();
    }

    /// Returns true if the step was planned.
    #[must_use]
    pub fn is_step_initialized(&self, step_name: &str) -> bool {
        self.step_status.contains_key(step_name)
    }

    /// Returns true if any entry of the step has a queued execution.
    #[must_use]
    pub fn is_step_queued(&self, step_name: &str) -> bool {
        self.step_status
            .get(step_name)
            .is_some_and(|statuses| statuses.values().any(StepStatus::is_queued))
    }

    /// Returns true if the step has entries and all are complete.
    #[must_use]
    pub fn is_step_complete(&self, step_name: &str) -> bool {
        self.step_status.get(step_name).is_some_and(|statuses| {
            !statuses.is_empty() && statuses.values().all(StepStatus::is_complete)
        })
    }

    /// Returns true if any entry of the step failed.
    #[must_use]
    pub fn is_step_fail(&self, step_name: &str) -> bool {
        self.step_status
            .get(step_name)
            .is_some_and(|statuses| statuses.values().any(StepStatus::is_fail))
    }

    /// Returns true if any entry of the step waits for another loop iteration.
    #[must_use]
    pub fn is_step_loop_hold(&self, step_name: &str) -> bool {
        self.step_status
            .get(step_name)
            .is_some_and(|statuses| statuses.values().any(|status| status.loop_hold))
    }

    /// Status entry for one fan-out key of one step.
    #[must_use]
    pub fn step_status_for(&self, step_name: &str, key: &str) -> Option<&StepStatus> {
        self.step_status.get(step_name)?.get(key)
    }

    /// Step executions that were queued but never started, in id order.
    #[must_use]
    pub fn queued_step_executions(&self) -> Vec<&StepExecution> {
        self.step_status
            .values()
            .flat_map(BTreeMap::values)
            .flat_map(|status| status.queued.iter())
            .filter_map(|id| self.step_executions.get(id))
            .collect()
    }

    /// The last ended step execution of every entry still held for another
    /// retry attempt or loop iteration with nothing in flight.
    #[must_use]
    pub fn held_step_executions(&self) -> Vec<&StepExecution> {
        self.step_status
            .values()
            .flat_map(BTreeMap::values)
            .filter(|status| (status.loop_hold || status.error_hold) && !status.is_in_flight())
            .filter_map(|status| status.last_execution())
            .filter_map(|id| self.step_executions.get(id))
            .collect()
    }

    /// Output value of every step as seen by expressions.
    ///
    /// Steps without `for_each` map to the output of their latest execution;
    /// `for_each` steps map to an object keyed by fan-out key.
    #[must_use]
    pub fn step_outputs(&self) -> BTreeMap<String, Value> {
        let mut outputs = BTreeMap::new();
        for (step_name, statuses) in &self.step_status {
            let mut by_key = Map::new();
            let mut for_each_step = false;
            for (key, status) in statuses {
                let Some(step_execution) = status
                    .last_execution()
                    .and_then(|id| self.step_executions.get(id))
                else {
                    continue;
                };
                let Some(output) = &step_execution.output else {
                    continue;
                };
                for_each_step |= step_execution.step_for_each.for_each_step;
                by_key.insert(key.clone(), output.eval_value(&step_execution.step_output));
            }

            if for_each_step {
                outputs.insert(step_name.clone(), Value::Object(by_key));
            } else if let Some(value) = by_key.remove(crate::core::StepForEach::SINGLE_KEY) {
                outputs.insert(step_name.clone(), value);
            }
        }
        outputs
    }

    /// Pipeline-level evaluation context: arguments and step outputs.
    #[must_use]
    pub fn eval_context(&self) -> EvalContext {
        let mut ctx = EvalContext::new(self.args.clone());
        ctx.steps = self.step_outputs();
        ctx
    }

    /// Appends errors whose instance is not already recorded.
    pub fn merge_errors<'a>(&mut self, errors: impl IntoIterator<Item = &'a StepError>) {
        merge_errors(&mut self.errors, errors);
    }
}

/// Appends `incoming` errors to `errors`, skipping known instances.
pub(crate) fn merge_errors<'a>(
    errors: &mut Vec<StepError>,
    incoming: impl IntoIterator<Item = &'a StepError>,
) {
    let mut seen: HashSet<String> = errors.iter().map(|err| err.instance().to_string()).collect();
    for err in incoming {
        if seen.insert(err.instance().to_string()) {
            errors.push(err.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NextStepAction, Output, StepForEach};
    use crate::errors::ErrorModel;
    use crate::events::{Envelope, StepQueue};
    use serde_json::json;

    fn queue(pex: &mut PipelineExecution, step: &str, id: &str, for_each: StepForEach) {
        let cmd = StepQueue {
            event: Envelope::new("exec_1"),
            pipeline_execution_id: pex.id.clone(),
            step_execution_id: id.to_string(),
            step_name: step.to_string(),
            action: NextStepAction::Start,
            input: Input::new(),
            step_for_each: for_each,
            step_loop: None,
            step_retry: None,
            max_concurrency: None,
            delay_ms: 0,
        };
        let status = pex
            .step_status
            .entry(step.to_string())
            .or_default()
            .entry(cmd.step_for_each.key.clone())
            .or_default();
        status.queue(id).unwrap();
        pex.step_executions.insert(id.to_string(), StepExecution::queued(&cmd));
    }

    fn finish(pex: &mut PipelineExecution, step: &str, key: &str, id: &str, data: Value) {
        let status = pex.step_status.get_mut(step).unwrap().get_mut(key).unwrap();
        status.finish(id, false, false).unwrap();
        status.record_execution(id);
        let mut output_data = Input::new();
        output_data.insert("value".to_string(), data);
        pex.step_executions.get_mut(id).unwrap().output = Some(Output::finished(output_data));
    }

    #[test]
    fn test_completion_queries() {
        let mut pex = PipelineExecution::new("pexec_1", "deploy", Input::new());
        assert!(pex.is_complete());

        pex.initialize_step("http.a");
        assert!(pex.is_step_initialized("http.a"));
        assert!(!pex.is_complete());

        queue(&mut pex, "http.a", "sexec_1", StepForEach::single());
        assert!(pex.is_step_queued("http.a"));
        assert!(!pex.is_step_complete("http.a"));

        finish(&mut pex, "http.a", "0", "sexec_1", json!(1));
        assert!(pex.is_step_complete("http.a"));
        assert!(pex.is_complete());
        assert!(!pex.is_step_fail("http.a"));
    }

    #[test]
    fn test_eval_context_outputs() {
        let mut pex = PipelineExecution::new("pexec_1", "deploy", Input::new());
        queue(&mut pex, "echo.a", "sexec_1", StepForEach::single());
        finish(&mut pex, "echo.a", "0", "sexec_1", json!("one"));
        queue(&mut pex, "echo.b", "sexec_2", StepForEach::branch("0", 2, json!("x")));
        queue(&mut pex, "echo.b", "sexec_3", StepForEach::branch("1", 2, json!("y")));
        finish(&mut pex, "echo.b", "1", "sexec_3", json!("two"));

        let ctx = pex.eval_context();
        assert_eq!(ctx.steps["echo.a"]["value"], json!("one"));
        assert_eq!(ctx.steps["echo.b"]["1"]["value"], json!("two"));
        assert!(ctx.steps["echo.b"].get("0").is_none());
    }

    #[test]
    fn test_merge_errors_dedupes_by_instance() {
        let mut pex = PipelineExecution::new("pexec_1", "deploy", Input::new());
        let err = StepError::new(ErrorModel::internal("boom"));
        let other = StepError::new(ErrorModel::internal("boom"));
        pex.merge_errors([&err, &err, &other]);
        assert_eq!(pex.errors.len(), 2);
        assert!(pex.should_fail());
    }

    #[test]
    fn test_held_and_queued_executions() {
        let mut pex = PipelineExecution::new("pexec_1", "deploy", Input::new());
        queue(&mut pex, "http.a", "sexec_1", StepForEach::single());
        {
            let status = pex.step_status.get_mut("http.a").unwrap().get_mut("0").unwrap();
            status.finish("sexec_1", false, true).unwrap();
            status.record_execution("sexec_1");
        }
        queue(&mut pex, "http.b", "sexec_2", StepForEach::single());

        let held: Vec<_> = pex.held_step_executions().iter().map(|se| se.id.clone()).collect();
        assert_eq!(held, vec!["sexec_1"]);
        let queued: Vec<_> = pex.queued_step_executions().iter().map(|se| se.id.clone()).collect();
        assert_eq!(queued, vec!["sexec_2"]);
    }
}
