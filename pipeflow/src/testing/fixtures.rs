//! Definition and engine fixtures.

use std::sync::Arc;

use super::{MockRunner, ScriptedEvaluator};
use crate::config::EngineConfig;
use crate::core::{Input, StepType};
use crate::definition::{
    InMemoryDefinitionProvider, PipelineDefinition, StepDefinition, TriggerDefinition,
};
use crate::engine::Engine;
use crate::errors::PipeflowError;
use crate::events::LogEntry;
use crate::execution::Execution;
use crate::store::{EventLogStore, InMemoryEventStore};

/// An `echo` step.
#[must_use]
pub fn echo_step(name: impl Into<String>) -> StepDefinition {
    StepDefinition::new(StepType::Echo, name)
}

/// A pipeline of `count` echo steps named `step_0..`, each depending on the
/// one before it.
#[must_use]
pub fn linear_pipeline(name: impl Into<String>, count: usize) -> PipelineDefinition {
    let mut pipeline = PipelineDefinition::new(name);
    for i in 0..count {
        let mut step = echo_step(format!("step_{i}"));
        if i > 0 {
            step = step.with_depends_on(format!("echo.step_{}", i - 1));
        }
        pipeline = pipeline.with_step(step);
    }
    pipeline
}

/// An engine wired to in-memory collaborators the test can inspect.
pub struct TestEngine {
    /// The engine under test.
    pub engine: Engine,
    /// Its event log.
    pub store: Arc<InMemoryEventStore>,
    /// Its primitive runner.
    pub runner: Arc<MockRunner>,
    /// Its definitions.
    pub definitions: Arc<InMemoryDefinitionProvider>,
}

impl TestEngine {
    /// Starts building a test engine.
    #[must_use]
    pub fn builder() -> TestEngineBuilder {
        TestEngineBuilder::default()
    }

    /// Runs pipeline `name` to completion.
    pub async fn run(&self, name: &str, args: Input) -> Result<Arc<Execution>, PipeflowError> {
        let execution_id = self.engine.start_pipeline(name, args)?;
        self.engine.wait_for_execution(&execution_id).await
    }

    /// The persisted log of an execution.
    pub async fn log(&self, execution_id: &str) -> Result<Vec<LogEntry>, PipeflowError> {
        self.store.read_all(execution_id).await
    }

    /// Handler names of an execution's log, in order.
    pub fn handler_names(&self, execution_id: &str) -> Result<Vec<&'static str>, PipeflowError> {
        self.store.handler_names(execution_id)
    }

    /// Rebuilds an execution from its persisted log.
    pub async fn replay(&self, execution_id: &str) -> Result<Execution, PipeflowError> {
        let entries = self.log(execution_id).await?;
        Execution::replay(execution_id, &entries)
    }
}

/// Builds a [`TestEngine`].
#[derive(Debug, Default)]
pub struct TestEngineBuilder {
    config: EngineConfig,
    pipelines: Vec<PipelineDefinition>,
    triggers: Vec<TriggerDefinition>,
    runner: Option<MockRunner>,
    evaluator: Option<ScriptedEvaluator>,
}

impl TestEngineBuilder {
    /// Registers a pipeline definition.
    #[must_use]
    pub fn pipeline(mut self, pipeline: PipelineDefinition) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    /// Registers a trigger definition.
    #[must_use]
    pub fn trigger(mut self, trigger: TriggerDefinition) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Uses `runner` instead of an echoing [`MockRunner`].
    #[must_use]
    pub fn runner(mut self, runner: MockRunner) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Uses `evaluator` instead of an empty [`ScriptedEvaluator`].
    #[must_use]
    pub fn evaluator(mut self, evaluator: ScriptedEvaluator) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Uses `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers the definitions and starts the engine.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<TestEngine, PipeflowError> {
        let definitions = Arc::new(InMemoryDefinitionProvider::new());
        for pipeline in self.pipelines {
            definitions.register(pipeline)?;
        }
        for trigger in self.triggers {
            definitions.register_trigger(trigger)?;
        }
        let store = Arc::new(InMemoryEventStore::new());
        let runner = Arc::new(self.runner.unwrap_or_default());
        let evaluator = Arc::new(self.evaluator.unwrap_or_default());

        let engine = Engine::new(
            self.config,
            store.clone(),
            definitions.clone(),
            evaluator,
            runner.clone(),
        );
        Ok(TestEngine {
            engine,
            store,
            runner,
            definitions,
        })
    }
}
