//! Definition lookup.

use super::{PipelineDefinition, TriggerDefinition};
use crate::errors::PipeflowError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Supplies pipeline and trigger definitions by name.
#[cfg_attr(test, mockall::automock)]
pub trait DefinitionProvider: Send + Sync {
    /// Returns the named pipeline.
    fn pipeline(&self, name: &str) -> Result<Arc<PipelineDefinition>, PipeflowError>;

    /// Returns the named trigger.
    fn trigger(&self, name: &str) -> Result<Arc<TriggerDefinition>, PipeflowError>;
}

/// Definitions held in memory.
#[derive(Debug, Default)]
pub struct InMemoryDefinitionProvider {
    pipelines: RwLock<HashMap<String, Arc<PipelineDefinition>>>,
    triggers: RwLock<HashMap<String, Arc<TriggerDefinition>>>,
}

impl InMemoryDefinitionProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a pipeline, replacing any previous one with
    /// the same name.
    pub fn register(&self, pipeline: PipelineDefinition) -> Result<(), PipeflowError> {
        pipeline.validate()?;
        tracing::debug!(pipeline = pipeline.name(), "Registered pipeline definition");
        self.pipelines
            .write()
            .insert(pipeline.name().to_string(), Arc::new(pipeline));
        Ok(())
    }

    /// Validates and registers a trigger, replacing any previous one with
    /// the same name.
    pub fn register_trigger(&self, trigger: TriggerDefinition) -> Result<(), PipeflowError> {
        trigger.validate()?;
        tracing::debug!(
            trigger = trigger.name(),
            pipeline = trigger.pipeline(),
            "Registered trigger definition"
        );
        self.triggers
            .write()
            .insert(trigger.name().to_string(), Arc::new(trigger));
        Ok(())
    }

    /// Number of registered pipelines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pipelines.read().len()
    }

    /// Returns true if no pipeline is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pipelines.read().is_empty()
    }
}

impl DefinitionProvider for InMemoryDefinitionProvider {
    fn pipeline(&self, name: &str) -> Result<Arc<PipelineDefinition>, PipeflowError> {
        self.pipelines
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PipeflowError::not_found(format!("pipeline '{name}'")))
    }

    fn trigger(&self, name: &str) -> Result<Arc<TriggerDefinition>, PipeflowError> {
        self.triggers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PipeflowError::not_found(format!("trigger '{name}'")))
    }
}
