//! The execution aggregate and its reducer.

use super::pipeline::merge_errors;
use super::{PipelineExecution, StepExecution, StepStatus, TriggerExecution};
use crate::core::{ExecutionStatus, NextStepAction, PipelineStatus, StepForEach};
use crate::errors::{PipeflowError, StepError};
use crate::events::{Command, Event, LogEntry, StepFinished, StepForEachPlanned, StepQueue};
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Projection of one execution's log.
///
/// Mutated only through [`Execution::apply`], one log entry at a time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Execution identifier.
    pub id: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// Pipeline executions keyed by id.
    pub pipeline_executions: BTreeMap<String, PipelineExecution>,
    /// Root pipeline executions in queue order.
    pub root_pipelines: Vec<String>,
    /// Errors of failed root pipelines.
    pub errors: Vec<StepError>,
    /// When the execution started.
    pub start_time: Option<Timestamp>,
    /// When the execution reached a terminal status.
    pub end_time: Option<Timestamp>,
    /// The trigger that started the execution, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_execution: Option<TriggerExecution>,
}

impl Execution {
    /// Creates an empty execution.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Folds a log into a fresh execution.
    pub fn replay<'a>(
        id: impl Into<String>,
        entries: impl IntoIterator<Item = &'a LogEntry>,
    ) -> Result<Self, PipeflowError> {
        let mut execution = Self::new(id);
        for entry in entries {
            execution.apply(entry)?;
        }
        Ok(execution)
    }

    /// Returns true if finished or failed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Looks up a pipeline execution.
    pub fn pipeline_execution(&self, id: &str) -> Result<&PipelineExecution, PipeflowError> {
        self.pipeline_executions
            .get(id)
            .ok_or_else(|| PipeflowError::bad_request(format!("unknown pipeline execution {id}")))
    }

    fn pipeline_execution_mut(&mut self, id: &str) -> Result<&mut PipelineExecution, PipeflowError> {
        self.pipeline_executions
            .get_mut(id)
            .ok_or_else(|| PipeflowError::bad_request(format!("unknown pipeline execution {id}")))
    }

    /// Looks up a step execution.
    pub fn step_execution(
        &self,
        pipeline_execution_id: &str,
        step_execution_id: &str,
    ) -> Result<&StepExecution, PipeflowError> {
        self.pipeline_execution(pipeline_execution_id)?
            .step_executions
            .get(step_execution_id)
            .ok_or_else(|| {
                PipeflowError::bad_request(format!("unknown step execution {step_execution_id}"))
            })
    }

    /// Full name of the step definition a step execution runs.
    pub fn step_definition_name(
        &self,
        pipeline_execution_id: &str,
        step_execution_id: &str,
    ) -> Result<&str, PipeflowError> {
        Ok(&self
            .step_execution(pipeline_execution_id, step_execution_id)?
            .name)
    }

    /// The step execution that launched a child pipeline execution.
    #[must_use]
    pub fn parent_step_execution(&self, pipeline_execution_id: &str) -> Option<&StepExecution> {
        let pex = self.pipeline_executions.get(pipeline_execution_id)?;
        let parent = self
            .pipeline_executions
            .get(pex.parent_pipeline_execution_id.as_deref()?)?;
        parent
            .step_executions
            .get(pex.parent_step_execution_id.as_deref()?)
    }

    /// Returns true once every root pipeline is terminal.
    #[must_use]
    pub fn roots_terminal(&self) -> bool {
        !self.root_pipelines.is_empty()
            && self.root_pipelines.iter().all(|id| {
                self.pipeline_executions
                    .get(id)
                    .is_some_and(PipelineExecution::is_terminal)
            })
    }

    /// Folds one log entry.
    pub fn apply(&mut self, entry: &LogEntry) -> Result<(), PipeflowError> {
        if self.id.is_empty() {
            self.id = entry.execution_id().to_string();
        }
        let at = entry.envelope().created_at;

        match entry {
            LogEntry::Command(command) => self.apply_command(command, at),
            LogEntry::Event(event) => self.apply_event(event, at),
        }
    }

    fn apply_command(&mut self, command: &Command, at: Timestamp) -> Result<(), PipeflowError> {
        match command {
            Command::ExecutionQueue(_) | Command::TriggerStart(_) => {
                self.status = ExecutionStatus::Queued;
            }
            Command::PipelineFinish(cmd) => {
                self.pipeline_execution_mut(&cmd.pipeline_execution_id)?.status =
                    PipelineStatus::Finishing;
            }
            Command::StepQueue(cmd) => self.apply_step_queue(cmd)?,
            Command::StepStart(cmd) => {
                let pex = self.pipeline_execution_mut(&cmd.pipeline_execution_id)?;
                let step_execution = pex
                    .step_executions
                    .get_mut(&cmd.step_execution_id)
                    .ok_or_else(|| {
                        PipeflowError::bad_request(format!(
                            "unknown step execution {}",
                            cmd.step_execution_id
                        ))
                    })?;
                step_execution.status = crate::core::StepExecutionStatus::Started;
                step_execution.start_time = Some(at);
                let (name, key) = (step_execution.name.clone(), step_execution.key().to_string());
                status_entry(pex, &name, &key)?.start(&cmd.step_execution_id)?;
            }
            Command::ExecutionStart(_)
            | Command::ExecutionFinish(_)
            | Command::ExecutionFail(_)
            | Command::PipelineQueue(_)
            | Command::PipelineStart(_)
            | Command::PipelinePlan(_)
            | Command::PipelineFail(_)
            | Command::PipelineCancel(_)
            | Command::PipelinePause(_)
            | Command::PipelineResume(_)
            | Command::StepForEachPlan(_)
            | Command::StepPipelineFinish(_) => {}
        }
        Ok(())
    }

    fn apply_event(&mut self, event: &Event, at: Timestamp) -> Result<(), PipeflowError> {
        match event {
            Event::ExecutionQueued(_) => self.status = ExecutionStatus::Queued,
            Event::ExecutionStarted(_) => {
                self.status = ExecutionStatus::Started;
                self.start_time = Some(at);
            }
            Event::TriggerStarted(event) => {
                self.status = ExecutionStatus::Started;
                self.start_time = Some(at);
                self.trigger_execution = Some(TriggerExecution::started(event));
            }
            Event::ExecutionFinished(_) => {
                self.status = ExecutionStatus::Finished;
                self.end_time = Some(at);
            }
            Event::ExecutionFailed(event) => {
                self.status = ExecutionStatus::Failed;
                self.end_time = Some(at);
                merge_errors(&mut self.errors, &event.errors);
            }
            Event::PipelineQueued(event) => {
                let mut pex = PipelineExecution::new(
                    event.pipeline_execution_id.clone(),
                    event.name.clone(),
                    event.args.clone(),
                );
                pex.parent_pipeline_execution_id = event.parent_pipeline_execution_id.clone();
                pex.parent_step_execution_id = event.parent_step_execution_id.clone();
                if !pex.is_child() && !self.root_pipelines.contains(&pex.id) {
                    self.root_pipelines.push(pex.id.clone());
                }
                self.pipeline_executions.insert(pex.id.clone(), pex);
            }
            Event::PipelineStarted(event) => {
                let pex = self.pipeline_execution_mut(&event.pipeline_execution_id)?;
                pex.status = PipelineStatus::Started;
                pex.start_time = Some(at);
            }
            Event::PipelineResumed(event) => {
                self.pipeline_execution_mut(&event.pipeline_execution_id)?.status =
                    PipelineStatus::Started;
            }
            Event::PipelinePlanned(event) => {
                let pex = self.pipeline_execution_mut(&event.pipeline_execution_id)?;
                for next_step in &event.next_steps {
                    if next_step.action != NextStepAction::Inaccessible {
                        pex.initialize_step(&next_step.step_name);
                    }
                }
            }
            Event::PipelineCanceled(event) => {
                let pex = self.pipeline_execution_mut(&event.pipeline_execution_id)?;
                pex.status = PipelineStatus::Canceled;
                pex.end_time = Some(at);
            }
            Event::PipelinePaused(event) => {
                self.pipeline_execution_mut(&event.pipeline_execution_id)?.status =
                    PipelineStatus::Paused;
            }
            Event::PipelineFinished(event) => {
                let pex = self.pipeline_execution_mut(&event.pipeline_execution_id)?;
                pex.status = PipelineStatus::Finished;
                pex.output = event.output.clone();
                pex.end_time = Some(at);
            }
            Event::PipelineFailed(event) => {
                let pex = self.pipeline_execution_mut(&event.pipeline_execution_id)?;
                pex.status = PipelineStatus::Failed;
                pex.merge_errors(&event.errors);
                pex.output = event.output.clone();
                pex.output.insert(
                    "errors".to_string(),
                    Value::Array(pex.errors.iter().map(|err| serde_json::json!(err)).collect()),
                );
                pex.end_time = Some(at);
            }
            Event::StepForEachPlanned(event) => self.apply_for_each_planned(event)?,
            Event::StepPipelineStarted(event) => {
                let pex = self.pipeline_execution_mut(&event.pipeline_execution_id)?;
                let step_execution = pex
                    .step_executions
                    .get_mut(&event.step_execution_id)
                    .ok_or_else(|| {
                        PipeflowError::bad_request(format!(
                            "unknown step execution {}",
                            event.step_execution_id
                        ))
                    })?;
                step_execution.status = crate::core::StepExecutionStatus::Started;
                step_execution.child_pipeline_execution_id =
                    Some(event.child_pipeline_execution_id.clone());
            }
            Event::StepFinished(event) => self.apply_step_finished(event, at)?,
            Event::StepQueued(_) => {}
        }
        Ok(())
    }

    fn apply_step_queue(&mut self, cmd: &StepQueue) -> Result<(), PipeflowError> {
        let pex = self.pipeline_execution_mut(&cmd.pipeline_execution_id)?;
        pex.step_status
            .entry(cmd.step_name.clone())
            .or_default()
            .entry(cmd.step_for_each.key.clone())
            .or_default()
            .queue(&cmd.step_execution_id)?;
        pex.step_executions
            .insert(cmd.step_execution_id.clone(), StepExecution::queued(cmd));
        Ok(())
    }

    fn apply_for_each_planned(&mut self, event: &StepForEachPlanned) -> Result<(), PipeflowError> {
        let pex = self.pipeline_execution_mut(&event.pipeline_execution_id)?;
        let statuses = pex.step_status.entry(event.step_name.clone()).or_default();

        if event.next_steps.is_empty() {
            // An empty fan-out is complete as soon as it is planned.
            if statuses.is_empty() {
                statuses.insert(StepForEach::SINGLE_KEY.to_string(), StepStatus::default());
            }
            return Ok(());
        }

        for next_step in &event.next_steps {
            let key = next_step
                .step_for_each
                .as_ref()
                .map_or(StepForEach::SINGLE_KEY, |for_each| for_each.key.as_str());
            statuses
                .entry(key.to_string())
                .or_insert_with(StepStatus::initializing);
        }
        Ok(())
    }

    fn apply_step_finished(&mut self, event: &StepFinished, at: Timestamp) -> Result<(), PipeflowError> {
        let pex = self.pipeline_execution_mut(&event.pipeline_execution_id)?;
        let step_execution = pex
            .step_executions
            .get_mut(&event.step_execution_id)
            .ok_or_else(|| {
                PipeflowError::bad_request(format!(
                    "unknown step execution {}",
                    event.step_execution_id
                ))
            })?;

        step_execution.status = event.output.status;
        step_execution.output = Some(event.output.clone());
        step_execution.step_output = event.step_output.clone();
        step_execution.step_retry = event.step_retry.clone();
        step_execution.step_loop = event.step_loop.clone();
        step_execution.end_time = Some(at);
        let (name, key) = (step_execution.name.clone(), step_execution.key().to_string());

        let error_hold = event
            .step_retry
            .as_ref()
            .is_some_and(|retry| !retry.retry_completed);
        let loop_hold = event
            .step_loop
            .as_ref()
            .is_some_and(|step_loop| !step_loop.loop_completed);

        let output = &event.output;
        let failed = output.is_failed() && !error_hold && !output.is_ignored();

        let status = status_entry(pex, &name, &key)?;
        if failed {
            status.fail(&event.step_execution_id)?;
        } else {
            status.finish(&event.step_execution_id, loop_hold, error_hold)?;
        }
        status.record_execution(&event.step_execution_id);

        if failed {
            pex.merge_errors(&output.errors);
        }
        Ok(())
    }
}

fn status_entry<'a>(
    pex: &'a mut PipelineExecution,
    step_name: &str,
    key: &str,
) -> Result<&'a mut StepStatus, PipeflowError> {
    pex.step_status
        .get_mut(step_name)
        .and_then(|statuses| statuses.get_mut(key))
        .ok_or_else(|| {
            PipeflowError::bad_request(format!("no status for step {step_name} key {key}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Input, NextStep, Output, StepRetry};
    use crate::errors::ErrorModel;
    use crate::events::{
        Envelope, PipelineFailed, PipelineFinish, PipelinePlanned, PipelineQueued,
        PipelineStarted, StepStart, TriggerStart, TriggerStarted,
    };
    use pretty_assertions::assert_eq;

    const EXEC: &str = "exec_1";
    const PEX: &str = "pexec_1";

    fn env() -> Envelope {
        Envelope::new(EXEC)
    }

    fn queued() -> LogEntry {
        Event::from(PipelineQueued {
            event: env(),
            name: "deploy".to_string(),
            args: Input::new(),
            pipeline_execution_id: PEX.to_string(),
            parent_pipeline_execution_id: None,
            parent_step_execution_id: None,
        })
        .into()
    }

    fn step_queue(step: &str, id: &str, for_each: StepForEach) -> LogEntry {
        Command::from(StepQueue {
            event: env(),
            pipeline_execution_id: PEX.to_string(),
            step_execution_id: id.to_string(),
            step_name: step.to_string(),
            action: NextStepAction::Start,
            input: Input::new(),
            step_for_each: for_each,
            step_loop: None,
            step_retry: None,
            max_concurrency: None,
            delay_ms: 0,
        })
        .into()
    }

    fn step_start(id: &str) -> LogEntry {
        Command::from(StepStart {
            event: env(),
            pipeline_execution_id: PEX.to_string(),
            step_execution_id: id.to_string(),
        })
        .into()
    }

    fn step_finished(id: &str, output: Output, step_retry: Option<StepRetry>) -> LogEntry {
        Event::from(StepFinished {
            event: env(),
            pipeline_execution_id: PEX.to_string(),
            step_execution_id: id.to_string(),
            output,
            step_output: Input::new(),
            step_retry,
            step_loop: None,
        })
        .into()
    }

    fn failed_output() -> Output {
        let mut output = Output::failed(ErrorModel::internal("boom"));
        output.failure_mode = Some(crate::core::FailureMode::Standard);
        output
    }

    fn log() -> Vec<LogEntry> {
        vec![
            queued(),
            Event::from(PipelineStarted {
                event: env(),
                pipeline_execution_id: PEX.to_string(),
            })
            .into(),
            Event::from(PipelinePlanned {
                event: env(),
                pipeline_execution_id: PEX.to_string(),
                next_steps: vec![NextStep::new("http.a", NextStepAction::Start)],
            })
            .into(),
            step_queue("http.a", "sexec_1", StepForEach::single()),
            step_start("sexec_1"),
            step_finished("sexec_1", Output::default(), None),
        ]
    }

    #[test]
    fn test_replay_builds_pipeline() {
        let execution = Execution::replay(EXEC, &log()).unwrap();
        let pex = execution.pipeline_execution(PEX).unwrap();

        assert_eq!(execution.root_pipelines, vec![PEX.to_string()]);
        assert_eq!(pex.status, PipelineStatus::Started);
        assert!(pex.is_step_complete("http.a"));
        assert!(pex.is_complete());
        assert_eq!(execution.step_definition_name(PEX, "sexec_1").unwrap(), "http.a");
        assert!(execution.step_definition_name(PEX, "sexec_9").is_err());
        assert!(pex.step_executions["sexec_1"].start_time.is_some());
    }

    #[test]
    fn test_replay_is_idempotent() {
        let entries = log();
        let first = Execution::replay(EXEC, &entries).unwrap();
        let second = Execution::replay(EXEC, &entries).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_retry_pending_is_error_held() {
        let mut entries = log();
        entries.truncate(5);
        entries.push(step_finished(
            "sexec_1",
            failed_output(),
            Some(StepRetry {
                count: 1,
                input: None,
                retry_completed: false,
            }),
        ));
        let execution = Execution::replay(EXEC, &entries).unwrap();
        let pex = execution.pipeline_execution(PEX).unwrap();
        let status = pex.step_status_for("http.a", "0").unwrap();

        assert!(status.error_hold);
        assert!(status.finished.contains("sexec_1"));
        assert!(!pex.is_step_complete("http.a"));
        assert!(pex.errors.is_empty());
    }

    #[test]
    fn test_failure_records_pipeline_error() {
        let mut entries = log();
        entries.truncate(5);
        entries.push(step_finished("sexec_1", failed_output(), None));
        let execution = Execution::replay(EXEC, &entries).unwrap();
        let pex = execution.pipeline_execution(PEX).unwrap();

        assert!(pex.is_step_fail("http.a"));
        assert!(pex.is_step_complete("http.a"));
        assert_eq!(pex.errors.len(), 1);
    }

    #[test]
    fn test_ignored_failure_finishes() {
        let mut entries = log();
        entries.truncate(5);
        let mut output = failed_output();
        output.failure_mode = Some(crate::core::FailureMode::Ignored);
        entries.push(step_finished("sexec_1", output, None));
        let execution = Execution::replay(EXEC, &entries).unwrap();
        let pex = execution.pipeline_execution(PEX).unwrap();

        assert!(!pex.is_step_fail("http.a"));
        assert!(pex.errors.is_empty());
    }

    #[test]
    fn test_double_finish_is_fatal() {
        let mut entries = log();
        entries.push(step_finished("sexec_1", Output::default(), None));
        let err = Execution::replay(EXEC, &entries).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_pipeline_execution_is_bad_request() {
        let err = Execution::replay(EXEC, &[step_start("sexec_1")]).unwrap_err();
        assert!(matches!(err, PipeflowError::BadRequest(_)));
    }

    #[test]
    fn test_for_each_planned() {
        let mut entries = vec![queued()];
        entries.push(
            Event::from(StepForEachPlanned {
                event: env(),
                pipeline_execution_id: PEX.to_string(),
                step_name: "echo.empty".to_string(),
                next_steps: Vec::new(),
            })
            .into(),
        );
        entries.push(
            Event::from(StepForEachPlanned {
                event: env(),
                pipeline_execution_id: PEX.to_string(),
                step_name: "echo.each".to_string(),
                next_steps: vec![
                    NextStep::new("echo.each", NextStepAction::Start)
                        .with_for_each(StepForEach::branch("0", 2, Value::from("a"))),
                    NextStep::new("echo.each", NextStepAction::Start)
                        .with_for_each(StepForEach::branch("1", 2, Value::from("b"))),
                ],
            })
            .into(),
        );
        entries.push(step_queue("echo.each", "sexec_1", StepForEach::branch("0", 2, Value::from("a"))));
        entries.push(step_queue("echo.each", "sexec_2", StepForEach::branch("1", 2, Value::from("b"))));
        entries.push(step_start("sexec_1"));
        entries.push(step_start("sexec_2"));
        entries.push(step_finished("sexec_1", failed_output(), None));

        let execution = Execution::replay(EXEC, &entries).unwrap();
        let pex = execution.pipeline_execution(PEX).unwrap();

        assert!(pex.is_step_complete("echo.empty"));
        let each = &pex.step_status["echo.each"];
        assert_eq!(each.len(), 2);
        assert!(each["0"].is_fail());
        assert!(!each["1"].is_fail());
        assert!(each["1"].is_started());
        assert!(!pex.is_step_complete("echo.each"));
    }

    #[test]
    fn test_pipeline_finish_marks_finishing() {
        let mut entries = log();
        entries.push(
            Command::from(PipelineFinish {
                event: env(),
                pipeline_execution_id: PEX.to_string(),
            })
            .into(),
        );
        let execution = Execution::replay(EXEC, &entries).unwrap();
        let pex = execution.pipeline_execution(PEX).unwrap();

        assert!(pex.is_finishing());
        assert!(pex.blocks_planning());
        assert!(!pex.is_terminal());
    }

    #[test]
    fn test_pipeline_failed_merges_errors() {
        let err = StepError::new(ErrorModel::internal("boom"));
        let failed = |errors: Vec<StepError>| -> LogEntry {
            Event::from(PipelineFailed {
                event: env(),
                pipeline_execution_id: PEX.to_string(),
                errors,
                output: Input::new(),
            })
            .into()
        };
        let entries = vec![queued(), failed(vec![err.clone()]), failed(vec![err.clone()])];
        let execution = Execution::replay(EXEC, &entries).unwrap();
        let pex = execution.pipeline_execution(PEX).unwrap();

        assert!(pex.is_failed());
        assert_eq!(pex.errors, vec![err]);
        assert_eq!(pex.output["errors"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_trigger_starts_execution() {
        let mut args = Input::new();
        args.insert("env".to_string(), serde_json::json!("prod"));
        let entries: Vec<LogEntry> = vec![
            Command::from(TriggerStart {
                event: env(),
                name: "nightly".to_string(),
                trigger_execution_id: "texec_1".to_string(),
                args: Input::new(),
            })
            .into(),
            Event::from(TriggerStarted {
                event: env(),
                name: "nightly".to_string(),
                trigger_execution_id: "texec_1".to_string(),
                pipeline: "deploy".to_string(),
                args: args.clone(),
                pipeline_execution_id: PEX.to_string(),
            })
            .into(),
        ];

        let queued_only = Execution::replay(EXEC, &entries[..1]).unwrap();
        assert_eq!(queued_only.status, ExecutionStatus::Queued);
        assert!(queued_only.trigger_execution.is_none());

        let execution = Execution::replay(EXEC, &entries).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Started);
        assert!(execution.start_time.is_some());
        let trigger = execution.trigger_execution.unwrap();
        assert_eq!(trigger.id, "texec_1");
        assert_eq!(trigger.pipeline, "deploy");
        assert_eq!(trigger.args, args);
        assert_eq!(trigger.pipeline_execution_id, PEX);
    }
}
