//! Observability utilities.

mod logging;
mod spans;

pub use logging::{init_logging, LogFormat};
pub use spans::{execution_span, step_span, SpanTimer, StepSpanAttributes};
