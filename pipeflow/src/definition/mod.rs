//! Pipeline, step and trigger definitions.
//!
//! Definitions are produced by an external parser and handed to the engine
//! through a [`DefinitionProvider`]. Expressions inside them stay opaque
//! [`Expr`](crate::eval::Expr) values until the engine evaluates them.

mod pipeline;
mod provider;
mod step;
mod trigger;

pub use pipeline::PipelineDefinition;
pub use provider::{DefinitionProvider, InMemoryDefinitionProvider};
#[cfg(test)]
pub use provider::MockDefinitionProvider;
pub use step::{ErrorConfig, LoopConfig, OutputConfig, StepDefinition, ThrowConfig};
pub use trigger::TriggerDefinition;
