//! Step primitive seam.
//!
//! Primitives (HTTP calls, container runs, queries, ...) are implemented
//! outside the engine. The engine hands each one a [`PrimitiveRequest`] and
//! a cancellation token and records the [`Output`] it returns. An `Err` is
//! folded into a failed output, so runners may use `?` freely.

use crate::cancellation::{self, CancellationToken};
use crate::core::{Input, Output, StepType};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Everything a primitive needs to run once.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimitiveRequest {
    /// Primitive kind.
    pub step_type: StepType,
    /// Step full name.
    pub step_name: String,
    /// Pipeline name.
    pub pipeline: String,
    /// Execution identifier.
    pub execution_id: String,
    /// Pipeline execution identifier.
    pub pipeline_execution_id: String,
    /// Step execution identifier.
    pub step_execution_id: String,
    /// Resolved input.
    pub input: Input,
}

/// Runs step primitives.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PrimitiveRunner: Send + Sync {
    /// Runs one primitive to completion.
    async fn run(
        &self,
        request: PrimitiveRequest,
        cancel: Arc<CancellationToken>,
    ) -> anyhow::Result<Output>;
}

/// Runs the primitives that need no external system: `echo`, `transform`
/// and `sleep`.
///
/// - `echo` returns its input as data.
/// - `transform` returns `{"value": input.value}`.
/// - `sleep` waits `input.duration` milliseconds, cancellably.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinRunner;

#[async_trait]
impl PrimitiveRunner for BuiltinRunner {
    async fn run(
        &self,
        request: PrimitiveRequest,
        cancel: Arc<CancellationToken>,
    ) -> anyhow::Result<Output> {
        match request.step_type {
            StepType::Echo => Ok(Output::finished(request.input)),
            StepType::Transform => {
                let mut data = Input::new();
                data.insert(
                    "value".to_string(),
                    request.input.get("value").cloned().unwrap_or(Value::Null),
                );
                Ok(Output::finished(data))
            }
            StepType::Sleep => {
                let millis = match request.input.get("duration") {
                    Some(Value::Number(millis)) => millis.as_u64().unwrap_or_default(),
                    Some(other) => anyhow::bail!("sleep duration must be a number, got {other}"),
                    None => 0,
                };
                cancellation::sleep(Duration::from_millis(millis), &cancel).await?;
                Ok(Output::finished(request.input))
            }
            other => anyhow::bail!("no builtin primitive for step type '{other}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(step_type: StepType, input: Input) -> PrimitiveRequest {
        PrimitiveRequest {
            step_type,
            step_name: format!("{step_type}.a"),
            pipeline: "deploy".to_string(),
            execution_id: "exec_1".to_string(),
            pipeline_execution_id: "pexec_1".to_string(),
            step_execution_id: "sexec_1".to_string(),
            input,
        }
    }

    #[tokio::test]
    async fn test_echo_returns_input() {
        let mut input = Input::new();
        input.insert("text".to_string(), json!("hello"));
        let output = BuiltinRunner
            .run(request(StepType::Echo, input), Arc::new(CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(output.data["text"], json!("hello"));
    }

    #[tokio::test]
    async fn test_sleep_is_cancellable() {
        let mut input = Input::new();
        input.insert("duration".to_string(), json!(60_000));
        let token = Arc::new(CancellationToken::new());
        token.cancel("pipeline canceled");

        let result = BuiltinRunner.run(request(StepType::Sleep, input), token).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_type() {
        let result = BuiltinRunner
            .run(request(StepType::Http, Input::new()), Arc::new(CancellationToken::new()))
            .await;
        assert!(result.unwrap_err().to_string().contains("http"));
    }

    #[tokio::test]
    async fn test_mock_runner() {
        let mut runner = MockPrimitiveRunner::new();
        runner
            .expect_run()
            .times(1)
            .returning(|_, _| Ok(Output::skipped()));
        let output = runner
            .run(request(StepType::Http, Input::new()), Arc::new(CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(output, Output::skipped());
    }
}
