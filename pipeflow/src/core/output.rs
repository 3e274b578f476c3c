//! Primitive output and per-execution control records.

use super::{FailureMode, NextStepAction, StepExecutionStatus};
use crate::errors::{ErrorModel, StepError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A resolved input or argument map.
pub type Input = serde_json::Map<String, Value>;

/// The native output of a step primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    /// Outcome of the primitive.
    pub status: StepExecutionStatus,

    /// How a failure should be treated. Unset until the error config is applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_mode: Option<FailureMode>,

    /// Primitive result values.
    #[serde(default)]
    pub data: Input,

    /// Errors raised while running or ending the step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StepError>,
}

impl Default for Output {
    fn default() -> Self {
        Self::finished(Input::new())
    }
}

impl Output {
    /// Creates a successful output.
    #[must_use]
    pub fn finished(data: Input) -> Self {
        Self {
            status: StepExecutionStatus::Finished,
            failure_mode: None,
            data,
            errors: Vec::new(),
        }
    }

    /// Creates a failed output carrying a single error.
    #[must_use]
    pub fn failed(error: ErrorModel) -> Self {
        Self {
            status: StepExecutionStatus::Failed,
            failure_mode: None,
            data: Input::new(),
            errors: vec![StepError::new(error)],
        }
    }

    /// Creates the output recorded for a step whose `if` condition was false.
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            status: StepExecutionStatus::Skipped,
            failure_mode: None,
            data: Input::new(),
            errors: Vec::new(),
        }
    }

    /// Returns true if any error is attached.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns true if the primitive failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == StepExecutionStatus::Failed
    }

    /// Returns true if the failure was marked as ignored.
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        self.failure_mode == Some(FailureMode::Ignored)
    }

    /// Returns true if the failure can not be retried.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.failure_mode == Some(FailureMode::Fatal)
    }

    /// Renders the output as seen by expressions: primitive data at the top
    /// level plus `status`, `errors` and the configured `output` values.
    #[must_use]
    pub fn eval_value(&self, step_output: &Input) -> Value {
        let mut value = self.data.clone();
        value.insert("status".to_string(), json!(self.status));
        value.insert(
            "errors".to_string(),
            Value::Array(self.errors.iter().map(|err| json!(err.error)).collect()),
        );
        value.insert("output".to_string(), Value::Object(step_output.clone()));
        Value::Object(value)
    }

    /// Marks the output failed with the given mode and appends an error.
    pub fn fail_with(&mut self, mode: FailureMode, error: StepError) {
        self.status = StepExecutionStatus::Failed;
        self.failure_mode = Some(mode);
        self.errors.push(error);
    }
}

/// Fan-out control for one branch of a `for_each` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepForEach {
    /// True when the step declares `for_each`.
    pub for_each_step: bool,
    /// Fan-out key: list index as a string, or map key.
    pub key: String,
    /// Number of branches in this fan-out.
    pub total_count: usize,
    /// `each.key` as seen by expressions: the list index or the map key.
    #[serde(default)]
    pub each_key: Value,
    /// The branch value.
    #[serde(default)]
    pub each: Value,
}

impl Default for StepForEach {
    fn default() -> Self {
        Self::single()
    }
}

impl StepForEach {
    /// Key used for steps without `for_each`.
    pub const SINGLE_KEY: &'static str = "0";

    /// Control record for a step without `for_each`.
    #[must_use]
    pub fn single() -> Self {
        Self {
            for_each_step: false,
            key: Self::SINGLE_KEY.to_string(),
            total_count: 1,
            each_key: Value::Null,
            each: Value::Null,
        }
    }

    /// Control record for one fan-out branch.
    #[must_use]
    pub fn branch(key: impl Into<String>, total_count: usize, each: Value) -> Self {
        let key = key.into();
        Self {
            for_each_step: true,
            each_key: Value::String(key.clone()),
            key,
            total_count,
            each,
        }
    }

    /// Sets the `each.key` value; list branches use their numeric index.
    #[must_use]
    pub fn with_each_key(mut self, each_key: Value) -> Self {
        self.each_key = each_key;
        self
    }
}

/// Loop control for a step with a `loop` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepLoop {
    /// Index of the iteration this record belongs to.
    pub index: usize,
    /// Input for the next iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Input>,
    /// True once the `until` condition was reached.
    pub loop_completed: bool,
}

impl StepLoop {
    /// Loop record for the first iteration.
    #[must_use]
    pub fn first() -> Self {
        Self::default()
    }
}

/// Retry control for a step with a `retry` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRetry {
    /// Number of retries performed so far.
    pub count: u32,
    /// Input to re-run the step with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Input>,
    /// True once retries are exhausted.
    pub retry_completed: bool,
}

/// A step the planner decided on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextStep {
    /// Full name of the step.
    pub step_name: String,
    /// What to do with it.
    pub action: NextStepAction,
    /// Resolved input.
    #[serde(default)]
    pub input: Input,
    /// Fan-out branch, for `for_each` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_for_each: Option<StepForEach>,
    /// Loop record, for steps with a `loop` block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_loop: Option<StepLoop>,
    /// Per-pipeline-execution limit on concurrent instances of this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

impl NextStep {
    /// Creates a next step with an empty input.
    #[must_use]
    pub fn new(step_name: impl Into<String>, action: NextStepAction) -> Self {
        Self {
            step_name: step_name.into(),
            action,
            input: Input::new(),
            step_for_each: None,
            step_loop: None,
            max_concurrency: None,
        }
    }

    /// Sets the resolved input.
    #[must_use]
    pub fn with_input(mut self, input: Input) -> Self {
        self.input = input;
        self
    }

    /// Sets the fan-out branch.
    #[must_use]
    pub fn with_for_each(mut self, step_for_each: StepForEach) -> Self {
        self.step_for_each = Some(step_for_each);
        self
    }

    /// Sets the loop record.
    #[must_use]
    pub fn with_loop(mut self, step_loop: StepLoop) -> Self {
        self.step_loop = Some(step_loop);
        self
    }

    /// Sets the per-step concurrency limit.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: Option<usize>) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_failed_has_errors() {
        let output = Output::failed(ErrorModel::internal("boom"));
        assert!(output.is_failed());
        assert!(output.has_errors());
        assert!(!output.is_ignored());
    }

    #[test]
    fn test_fail_with_sets_mode() {
        let mut output = Output::default();
        output.fail_with(
            FailureMode::Fatal,
            StepError::new(ErrorModel::internal("bad output")),
        );
        assert!(output.is_failed());
        assert!(output.is_fatal());
        assert_eq!(output.errors.len(), 1);
    }

    #[test]
    fn test_eval_value_spreads_data() {
        let mut data = Input::new();
        data.insert("body".to_string(), json!("ok"));
        let mut step_output = Input::new();
        step_output.insert("size".to_string(), json!(2));

        let value = Output::finished(data).eval_value(&step_output);
        assert_eq!(value["body"], "ok");
        assert_eq!(value["status"], "finished");
        assert_eq!(value["errors"], json!([]));
        assert_eq!(value["output"]["size"], 2);
    }

    #[test]
    fn test_for_each_single_key() {
        let single = StepForEach::single();
        assert_eq!(single.key, "0");
        assert!(!single.for_each_step);

        let branch = StepForEach::branch("b", 2, json!("bar"));
        assert!(branch.for_each_step);
        assert_eq!(branch.each, json!("bar"));
        assert_eq!(branch.each_key, json!("b"));

        let indexed = StepForEach::branch("1", 2, json!("x")).with_each_key(json!(1));
        assert_eq!(indexed.each_key, json!(1));
    }

    #[test]
    fn test_output_wire_format() {
        let value = serde_json::to_value(Output::skipped()).unwrap();
        assert_eq!(value, json!({"status": "skipped", "data": {}}));
    }

    #[test]
    fn test_next_step_builder() {
        let step = NextStep::new("http.a", NextStepAction::Start)
            .with_for_each(StepForEach::branch("0", 1, json!(1)))
            .with_max_concurrency(Some(2));
        assert_eq!(step.max_concurrency, Some(2));
        assert_eq!(step.step_for_each.unwrap().key, "0");
    }
}
