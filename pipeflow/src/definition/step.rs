//! Step definitions.

use crate::core::StepType;
use crate::eval::Expr;
use crate::lifecycle::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The `error` block of a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorConfig {
    /// Failures of this step do not fail the pipeline.
    #[serde(default)]
    pub ignore: bool,
}

/// One `throw` clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrowConfig {
    /// Raises an error when true.
    #[serde(rename = "if")]
    pub if_condition: Expr,
    /// Error message; defaults to "User defined error".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Expr>,
}

impl ThrowConfig {
    /// Creates a throw clause without a message.
    pub fn new(if_condition: impl Into<Expr>) -> Self {
        Self {
            if_condition: if_condition.into(),
            message: None,
        }
    }

    /// Sets the message expression.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<Expr>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// The `loop` block of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Loop stops once this is true. Evaluated with the index of the
    /// iteration that just ran.
    pub until: Expr,
    /// Input overrides for the next iteration.
    #[serde(default)]
    pub inputs: BTreeMap<String, Expr>,
}

impl LoopConfig {
    /// Creates a loop block.
    pub fn new(until: impl Into<Expr>) -> Self {
        Self {
            until: until.into(),
            inputs: BTreeMap::new(),
        }
    }

    /// Adds an input override.
    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Expr>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }
}

/// A user-configured `output` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output name.
    pub name: String,
    /// Value expression.
    pub value: Expr,
}

impl OutputConfig {
    /// Creates an output.
    pub fn new(name: impl Into<String>, value: impl Into<Expr>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Definition of a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    name: String,
    #[serde(rename = "type")]
    step_type: StepType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    if_condition: Option<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    for_each: Option<Expr>,
    #[serde(default)]
    inputs: BTreeMap<String, Expr>,
    #[serde(default, rename = "error", skip_serializing_if = "Option::is_none")]
    error_config: Option<ErrorConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<RetryConfig>,
    #[serde(default, rename = "throw", skip_serializing_if = "Vec::is_empty")]
    throws: Vec<ThrowConfig>,
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    loop_config: Option<LoopConfig>,
    #[serde(default, rename = "output", skip_serializing_if = "Vec::is_empty")]
    outputs: Vec<OutputConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pipeline: Option<String>,
}

impl StepDefinition {
    /// Creates a step with no dependencies and no inputs.
    pub fn new(step_type: StepType, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type,
            depends_on: Vec::new(),
            if_condition: None,
            for_each: None,
            inputs: BTreeMap::new(),
            error_config: None,
            retry: None,
            throws: Vec::new(),
            loop_config: None,
            outputs: Vec::new(),
            max_concurrency: None,
            pipeline: None,
        }
    }

    /// Adds a dependency by full name (`"<type>.<name>"`).
    #[must_use]
    pub fn with_depends_on(mut self, full_name: impl Into<String>) -> Self {
        self.depends_on.push(full_name.into());
        self
    }

    /// Sets the `if` condition.
    #[must_use]
    pub fn with_if(mut self, condition: impl Into<Expr>) -> Self {
        self.if_condition = Some(condition.into());
        self
    }

    /// Sets the `for_each` expression.
    #[must_use]
    pub fn with_for_each(mut self, for_each: impl Into<Expr>) -> Self {
        self.for_each = Some(for_each.into());
        self
    }

    /// Adds an input.
    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Expr>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    /// Marks failures of this step as ignored.
    #[must_use]
    pub fn with_ignore_errors(mut self) -> Self {
        self.error_config = Some(ErrorConfig { ignore: true });
        self
    }

    /// Sets the retry block.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Adds a throw clause.
    #[must_use]
    pub fn with_throw(mut self, throw: ThrowConfig) -> Self {
        self.throws.push(throw);
        self
    }

    /// Sets the loop block.
    #[must_use]
    pub fn with_loop(mut self, loop_config: LoopConfig) -> Self {
        self.loop_config = Some(loop_config);
        self
    }

    /// Adds a configured output.
    #[must_use]
    pub fn with_output(mut self, output: OutputConfig) -> Self {
        self.outputs.push(output);
        self
    }

    /// Limits concurrent instances of this step within one pipeline execution.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    /// Sets the child pipeline launched by a `pipeline` step.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = Some(pipeline.into());
        self
    }

    /// Short name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primitive type.
    #[must_use]
    pub const fn step_type(&self) -> StepType {
        self.step_type
    }

    /// `"<type>.<name>"`, the key used for step statuses and dependencies.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.step_type, self.name)
    }

    /// Dependencies by full name.
    #[must_use]
    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    /// The `if` condition.
    #[must_use]
    pub fn if_condition(&self) -> Option<&Expr> {
        self.if_condition.as_ref()
    }

    /// The `for_each` expression.
    #[must_use]
    pub fn for_each(&self) -> Option<&Expr> {
        self.for_each.as_ref()
    }

    /// Input expressions by name.
    #[must_use]
    pub fn inputs(&self) -> &BTreeMap<String, Expr> {
        &self.inputs
    }

    /// The `error` block.
    #[must_use]
    pub fn error_config(&self) -> Option<&ErrorConfig> {
        self.error_config.as_ref()
    }

    /// Returns true if failures of this step are ignored.
    #[must_use]
    pub fn ignores_errors(&self) -> bool {
        self.error_config.as_ref().is_some_and(|config| config.ignore)
    }

    /// The `retry` block.
    #[must_use]
    pub fn retry_config(&self) -> Option<&RetryConfig> {
        self.retry.as_ref()
    }

    /// Throw clauses in declaration order.
    #[must_use]
    pub fn throw_config(&self) -> &[ThrowConfig] {
        &self.throws
    }

    /// The `loop` block.
    #[must_use]
    pub fn loop_config(&self) -> Option<&LoopConfig> {
        self.loop_config.as_ref()
    }

    /// Configured outputs.
    #[must_use]
    pub fn output_config(&self) -> &[OutputConfig] {
        &self.outputs
    }

    /// Concurrency limit, if any.
    #[must_use]
    pub const fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    /// Child pipeline name, for `pipeline` steps.
    #[must_use]
    pub fn pipeline(&self) -> Option<&str> {
        self.pipeline.as_deref()
    }
}
