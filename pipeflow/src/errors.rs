//! Error types for the pipeflow engine.
//!
//! Three layers are distinguished:
//!
//! - [`ErrorModel`]: the serializable error record attached to step outputs,
//!   pipeline failures and log entries. Its `instance` field is a stable
//!   identity used to de-duplicate errors when they are merged.
//! - [`FatalError`]: a violated state-machine guard. These are bugs upstream
//!   and must abort the current handler rather than be folded into state.
//! - [`PipeflowError`]: the crate-wide error enum returned by fallible
//!   operations.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for pipeflow operations.
#[derive(Debug, Error)]
pub enum PipeflowError {
    /// A state-machine guard was violated.
    #[error("{0}")]
    Fatal(#[from] FatalError),

    /// A command or event was missing required data or referenced unknown state.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A definition or execution could not be found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An expression failed to evaluate.
    #[error("{0}")]
    Evaluation(ErrorModel),

    /// The event log store failed.
    #[error("Event store error: {0}")]
    Store(String),

    /// The operation was cancelled before it completed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipeflowError {
    /// Creates a bad request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Returns true if this error is a guard violation.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Converts the error into the model attached to failure events.
    #[must_use]
    pub fn into_error_model(self) -> ErrorModel {
        match self {
            Self::Evaluation(model) => model,
            Self::BadRequest(message) => ErrorModel::bad_request(message),
            Self::NotFound(message) => ErrorModel::not_found(message),
            other => ErrorModel::internal(other.to_string()),
        }
    }
}

impl From<ErrorModel> for PipeflowError {
    fn from(model: ErrorModel) -> Self {
        Self::Evaluation(model)
    }
}

/// Serializable error record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{title}: {detail}")]
pub struct ErrorModel {
    /// Stable unique identity of this error occurrence.
    pub instance: String,
    /// Machine readable error type.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Short human readable title.
    pub title: String,
    /// HTTP-like status code.
    pub status: u16,
    /// Detailed message.
    pub detail: String,
}

impl ErrorModel {
    /// Creates a new error model with a fresh instance id.
    #[must_use]
    pub fn new(
        status: u16,
        error_type: impl Into<String>,
        title: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            instance: format!("pipeflow-{}", uuid::Uuid::new_v4().simple()),
            error_type: error_type.into(),
            title: title.into(),
            status,
            detail: detail.into(),
        }
    }

    /// A malformed or invalid request.
    #[must_use]
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(400, "error_bad_request", "Bad Request", detail)
    }

    /// A missing resource.
    #[must_use]
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(404, "error_not_found", "Not Found", detail)
    }

    /// An unexpected internal failure.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(500, "error_internal", "Internal Error", detail)
    }

    /// An error raised by a `throw` clause.
    #[must_use]
    pub fn user_defined(detail: impl Into<String>) -> Self {
        Self::new(500, "error_user_defined", "User Defined Error", detail)
    }

    /// A pipeline execution that was canceled before it ended.
    #[must_use]
    pub fn canceled(detail: impl Into<String>) -> Self {
        Self::new(409, "error_canceled", "Canceled", detail)
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("instance".to_string(), serde_json::Value::String(self.instance.clone()));
        map.insert("type".to_string(), serde_json::Value::String(self.error_type.clone()));
        map.insert("title".to_string(), serde_json::Value::String(self.title.clone()));
        map.insert("status".to_string(), serde_json::Value::from(self.status));
        map.insert("detail".to_string(), serde_json::Value::String(self.detail.clone()));
        map
    }
}

impl From<anyhow::Error> for ErrorModel {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Self>() {
            Ok(model) => model,
            Err(other) => Self::internal(format!("{other:#}")),
        }
    }
}

/// An error produced by a step, decorated with where it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    /// The pipeline execution the step ran in.
    #[serde(default)]
    pub pipeline_execution_id: String,
    /// The step execution that produced the error.
    #[serde(default)]
    pub step_execution_id: String,
    /// Pipeline name.
    #[serde(default)]
    pub pipeline: String,
    /// Step name.
    #[serde(default)]
    pub step: String,
    /// The error itself.
    pub error: ErrorModel,
}

impl StepError {
    /// Creates an undecorated step error.
    #[must_use]
    pub fn new(error: ErrorModel) -> Self {
        Self {
            pipeline_execution_id: String::new(),
            step_execution_id: String::new(),
            pipeline: String::new(),
            step: String::new(),
            error,
        }
    }

    /// Sets the pipeline and step names.
    #[must_use]
    pub fn with_step(mut self, pipeline: impl Into<String>, step: impl Into<String>) -> Self {
        self.pipeline = pipeline.into();
        self.step = step.into();
        self
    }

    /// Sets the execution identifiers.
    #[must_use]
    pub fn with_execution_ids(
        mut self,
        pipeline_execution_id: impl Into<String>,
        step_execution_id: impl Into<String>,
    ) -> Self {
        self.pipeline_execution_id = pipeline_execution_id.into();
        self.step_execution_id = step_execution_id.into();
        self
    }

    /// The identity used to de-duplicate merged errors.
    #[must_use]
    pub fn instance(&self) -> &str {
        &self.error.instance
    }
}

/// A state-machine guard violation on a step execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid '{transition}' transition for step execution {step_execution_id}: {reason}")]
pub struct FatalError {
    /// The step execution the transition was attempted on.
    pub step_execution_id: String,
    /// The attempted transition.
    pub transition: &'static str,
    /// What made the transition illegal.
    pub reason: String,
}

impl FatalError {
    /// Creates a new fatal error.
    #[must_use]
    pub fn new(
        step_execution_id: impl Into<String>,
        transition: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            step_execution_id: step_execution_id.into(),
            transition,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_model_instances_are_unique() {
        let a = ErrorModel::internal("boom");
        let b = ErrorModel::internal("boom");
        assert_ne!(a.instance, b.instance);
        assert!(a.instance.starts_with("pipeflow-"));
    }

    #[test]
    fn test_error_model_serializes_type_field() {
        let err = ErrorModel::bad_request("missing pipeline execution id");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["type"], "error_bad_request");
        assert_eq!(value["status"], 400);

        let dict = err.to_dict();
        assert_eq!(dict.get("detail").unwrap(), "missing pipeline execution id");
    }

    #[test]
    fn test_into_error_model_keeps_evaluation_model() {
        let model = ErrorModel::user_defined("nope");
        let instance = model.instance.clone();
        let err = PipeflowError::from(model);
        assert_eq!(err.into_error_model().instance, instance);
    }

    #[test]
    fn test_into_error_model_maps_kinds() {
        assert_eq!(PipeflowError::bad_request("x").into_error_model().status, 400);
        assert_eq!(PipeflowError::not_found("x").into_error_model().status, 404);
        assert_eq!(PipeflowError::Internal("x".into()).into_error_model().status, 500);
    }

    #[test]
    fn test_fatal_error_display() {
        let err = FatalError::new("sexec_1", "queue", "already finished");
        assert!(err.to_string().contains("sexec_1"));
        assert!(PipeflowError::from(err).is_fatal());
    }

    #[test]
    fn test_anyhow_downcasts_error_model() {
        let model = ErrorModel::not_found("gone");
        let instance = model.instance.clone();
        let converted = ErrorModel::from(anyhow::Error::new(model));
        assert_eq!(converted.instance, instance);

        let converted = ErrorModel::from(anyhow::anyhow!("plain failure"));
        assert_eq!(converted.status, 500);
        assert_eq!(converted.detail, "plain failure");
    }

    #[test]
    fn test_step_error_builder() {
        let err = StepError::new(ErrorModel::internal("x"))
            .with_step("deploy", "http.fetch")
            .with_execution_ids("pexec_1", "sexec_1");
        assert_eq!(err.pipeline, "deploy");
        assert_eq!(err.step_execution_id, "sexec_1");
        assert_eq!(err.instance(), err.error.instance);
    }
}
