//! Testing utilities for pipeflow engines.
//!
//! This module provides:
//! - A scripted expression evaluator
//! - A recording primitive runner
//! - Definition and engine fixtures

mod evaluator;
mod fixtures;
mod mocks;

pub use evaluator::ScriptedEvaluator;
pub use fixtures::{echo_step, linear_pipeline, TestEngine, TestEngineBuilder};
pub use mocks::MockRunner;
