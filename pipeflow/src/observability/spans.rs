//! Span helpers carrying execution identifiers.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::field::Empty;
use tracing::Span;

/// Span for work done on behalf of one execution.
#[must_use]
pub fn execution_span(execution_id: &str, handler: &'static str) -> Span {
    tracing::debug_span!("pipeflow.handler", execution_id, handler)
}

/// Span for one step execution's primitive.
///
/// `status` and `duration_ms` stay empty until
/// [`StepSpanAttributes::record`] fills them in.
#[must_use]
pub fn step_span(attributes: &StepSpanAttributes) -> Span {
    tracing::info_span!(
        "pipeflow.step",
        execution_id = %attributes.execution_id,
        pipeline_execution_id = %attributes.pipeline_execution_id,
        step_execution_id = %attributes.step_execution_id,
        step = %attributes.step,
        status = Empty,
        duration_ms = Empty,
    )
}

/// Identifiers attached to step spans and step log lines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSpanAttributes {
    /// Execution identifier.
    pub execution_id: String,
    /// Pipeline execution identifier.
    pub pipeline_execution_id: String,
    /// Step execution identifier.
    pub step_execution_id: String,
    /// Step full name.
    pub step: String,
    /// Step outcome, once known.
    pub status: Option<String>,
    /// Primitive duration, once known.
    pub duration_ms: Option<f64>,
}

impl StepSpanAttributes {
    /// Creates attributes for a step execution.
    #[must_use]
    pub fn new(
        execution_id: impl Into<String>,
        pipeline_execution_id: impl Into<String>,
        step_execution_id: impl Into<String>,
        step: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            pipeline_execution_id: pipeline_execution_id.into(),
            step_execution_id: step_execution_id.into(),
            step: step.into(),
            status: None,
            duration_ms: None,
        }
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Sets the duration.
    #[must_use]
    pub const fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Records the outcome fields that are set on `span`.
    pub fn record(&self, span: &Span) {
        if let Some(status) = &self.status {
            span.record("status", status.as_str());
        }
        if let Some(duration_ms) = self.duration_ms {
            span.record("duration_ms", duration_ms);
        }
    }
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span and returns the duration.
    #[must_use]
    pub fn finish(self) -> f64 {
        self.elapsed_ms()
    }
}
