//! Pipeline definitions.

use super::{OutputConfig, StepDefinition};
use crate::errors::PipeflowError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// An ordered set of steps plus pipeline-level limits and outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    name: String,
    #[serde(default)]
    steps: Vec<StepDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_concurrency: Option<usize>,
    #[serde(default, rename = "output", skip_serializing_if = "Vec::is_empty")]
    outputs: Vec<OutputConfig>,
}

impl PipelineDefinition {
    /// Creates an empty pipeline.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            max_concurrency: None,
            outputs: Vec::new(),
        }
    }

    /// Appends a step. Declaration order is planning order.
    #[must_use]
    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Limits concurrently running steps across all executions of this pipeline.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    /// Adds a pipeline output.
    #[must_use]
    pub fn with_output(mut self, output: OutputConfig) -> Self {
        self.outputs.push(output);
        self
    }

    /// Pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in declaration order.
    #[must_use]
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Looks up a step by full name.
    #[must_use]
    pub fn step(&self, full_name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| step.full_name() == full_name)
    }

    /// Concurrency limit, if any.
    #[must_use]
    pub const fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    /// Configured outputs.
    #[must_use]
    pub fn output_config(&self) -> &[OutputConfig] {
        &self.outputs
    }

    /// Rejects duplicate step names and zero concurrency limits.
    pub fn validate(&self) -> Result<(), PipeflowError> {
        if self.max_concurrency == Some(0) {
            return Err(PipeflowError::bad_request(format!(
                "pipeline '{}' has max_concurrency 0",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            let full_name = step.full_name();
            if step.max_concurrency() == Some(0) {
                return Err(PipeflowError::bad_request(format!(
                    "step '{full_name}' in pipeline '{}' has max_concurrency 0",
                    self.name
                )));
            }
            if !seen.insert(full_name.clone()) {
                return Err(PipeflowError::bad_request(format!(
                    "duplicate step '{full_name}' in pipeline '{}'",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StepType;

    #[test]
    fn test_step_lookup_by_full_name() {
        let pipeline = PipelineDefinition::new("deploy")
            .with_step(StepDefinition::new(StepType::Http, "a"))
            .with_step(StepDefinition::new(StepType::Echo, "a"));

        assert_eq!(pipeline.step("echo.a").unwrap().step_type(), StepType::Echo);
        assert!(pipeline.step("query.a").is_none());
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let pipeline = PipelineDefinition::new("deploy")
            .with_step(StepDefinition::new(StepType::Http, "a"))
            .with_step(StepDefinition::new(StepType::Http, "a"));
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let pipeline = PipelineDefinition::new("deploy").with_max_concurrency(0);
        assert!(pipeline.validate().is_err());

        let pipeline = PipelineDefinition::new("deploy")
            .with_step(StepDefinition::new(StepType::Http, "a").with_max_concurrency(0));
        assert!(pipeline.validate().is_err());
    }
}
