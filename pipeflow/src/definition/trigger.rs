//! Trigger definitions.

use crate::errors::PipeflowError;
use crate::eval::Expr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Starts a pipeline when something outside the engine fires.
///
/// The arguments a trigger fires with are visible to `args` expressions as
/// `param.*`. A trigger without `args` hands them to the pipeline as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    name: String,
    pipeline: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    args: BTreeMap<String, Expr>,
}

impl TriggerDefinition {
    /// Creates a trigger starting `pipeline`.
    pub fn new(name: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipeline: pipeline.into(),
            args: BTreeMap::new(),
        }
    }

    /// Adds a pipeline argument computed from the firing arguments.
    #[must_use]
    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<Expr>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    /// Trigger name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the pipeline it starts.
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Pipeline argument expressions.
    #[must_use]
    pub const fn args(&self) -> &BTreeMap<String, Expr> {
        &self.args
    }

    /// Rejects a trigger that names no pipeline.
    pub fn validate(&self) -> Result<(), PipeflowError> {
        if self.pipeline.is_empty() {
            return Err(PipeflowError::bad_request(format!(
                "trigger '{}' names no pipeline",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_validation() {
        let trigger = TriggerDefinition::new("nightly", "deploy").with_arg("env", "param.env");
        assert_eq!(trigger.name(), "nightly");
        assert_eq!(trigger.pipeline(), "deploy");
        assert_eq!(trigger.args()["env"], Expr::new("param.env"));
        assert!(trigger.validate().is_ok());

        assert!(TriggerDefinition::new("orphan", "").validate().is_err());
    }
}
