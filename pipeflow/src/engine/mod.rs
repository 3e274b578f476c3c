//! The engine: command handlers, event handlers and the run loop.
//!
//! Every message is handled on its own task. A command handler takes the
//! execution lock, appends the command and the event it produces, and
//! returns follow-up messages which are dispatched once the lock is
//! released. Event handlers read the aggregate under the same lock and
//! return the commands the event calls for.
//!
//! ```text
//! execution_queue | trigger_start -> pipeline_queue -> pipeline_start -> pipeline_plan
//!   -> step_queue -> step_start -> step_finished -> pipeline_plan ...
//!   -> pipeline_finish | pipeline_fail -> execution_finish | execution_fail
//! ```

mod commands;
mod dispatcher;
mod reactions;
mod repository;
mod steps;


pub use dispatcher::{Dispatcher, MessageReceiver, MessageSender};

use repository::{ExecutionGuard, ExecutionRepository};

use crate::cancellation::CancellationToken;
use crate::concurrency::ConcurrencyLimiter;
use crate::config::EngineConfig;
use crate::core::Input;
use crate::definition::DefinitionProvider;
use crate::errors::{FatalError, PipeflowError, StepError};
use crate::eval::ExpressionEvaluator;
use crate::events::{
    Command, Envelope, Event, ExecutionFail, ExecutionQueue, LogEntry, PipelineCancel,
    PipelineFail, PipelinePause, PipelineQueue, PipelineResume, TriggerStart,
};
use crate::execution::Execution;
use crate::observability::execution_span;
use crate::registry::Registry;
use crate::runner::PrimitiveRunner;
use crate::store::{EventLogStore, InMemoryEventStore, JsonlEventStore};
use crate::utils::{new_execution_id, new_pipeline_execution_id, new_trigger_execution_id};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Drives executions to completion.
///
/// Must be created inside a tokio runtime. Dropping the engine stops its
/// run loop and aborts in-flight handlers.
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    definitions: Arc<dyn DefinitionProvider>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    runner: Arc<dyn PrimitiveRunner>,
    repository: ExecutionRepository,
    limiter: ConcurrencyLimiter,
    /// Cancellation tokens keyed by pipeline execution id.
    tokens: Registry<CancellationToken>,
    /// Step executions whose start handler is running.
    starting: Mutex<HashSet<String>>,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    fatal: Mutex<Option<FatalError>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("active_executions", &self.inner.repository.active_count())
            .field("stopped", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl Engine {
    /// Creates an engine and spawns its run loop.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn EventLogStore>,
        definitions: Arc<dyn DefinitionProvider>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        runner: Arc<dyn PrimitiveRunner>,
    ) -> Self {
        let (dispatcher, receiver) = Dispatcher::channel();
        let inner = Arc::new(EngineInner {
            repository: ExecutionRepository::new(store, config.execution_cache_ttl()),
            limiter: ConcurrencyLimiter::new(config.concurrency.clone()),
            config,
            definitions,
            evaluator,
            runner,
            tokens: Registry::new(),
            starting: Mutex::new(HashSet::new()),
            dispatcher,
            shutdown: CancellationToken::new(),
            fatal: Mutex::new(None),
        });
        tokio::spawn(run(Arc::clone(&inner), receiver));
        tracing::info!("Pipeflow engine started");
        Self { inner }
    }

    /// Creates an engine whose store follows `config.event_store_dir`: JSONL
    /// files when set, memory otherwise.
    pub async fn open(
        config: EngineConfig,
        definitions: Arc<dyn DefinitionProvider>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        runner: Arc<dyn PrimitiveRunner>,
    ) -> Result<Self, PipeflowError> {
        let store: Arc<dyn EventLogStore> = match &config.event_store_dir {
            Some(dir) => Arc::new(JsonlEventStore::open(dir.clone()).await?),
            None => Arc::new(InMemoryEventStore::new()),
        };
        Ok(Self::new(config, store, definitions, evaluator, runner))
    }

    /// The configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The engine's concurrency limiter.
    #[must_use]
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.inner.limiter
    }

    /// Number of executions currently running.
    #[must_use]
    pub fn active_executions(&self) -> usize {
        self.inner.repository.active_count()
    }

    /// Starts a new execution running pipeline `name` and returns its id.
    pub fn start_pipeline(&self, name: &str, args: Input) -> Result<String, PipeflowError> {
        self.inner.check_running()?;
        self.inner.definitions.pipeline(name)?;

        let execution_id = new_execution_id();
        let event = Envelope::new(execution_id.clone());
        let pipeline_queue = PipelineQueue {
            event: event.clone(),
            name: name.to_string(),
            args,
            pipeline_execution_id: new_pipeline_execution_id(),
            parent_pipeline_execution_id: None,
            parent_step_execution_id: None,
        };

        self.inner.repository.watch(&execution_id);
        self.inner.send(Command::from(ExecutionQueue {
            event,
            pipeline_queue,
        }))?;
        tracing::info!(execution_id = %execution_id, pipeline = name, "Queued execution");
        Ok(execution_id)
    }

    /// Fires trigger `name` with `args` in a new execution and returns its id.
    pub fn start_trigger(&self, name: &str, args: Input) -> Result<String, PipeflowError> {
        self.inner.check_running()?;
        self.inner.definitions.trigger(name)?;

        let execution_id = new_execution_id();
        self.inner.repository.watch(&execution_id);
        self.inner.send(Command::from(TriggerStart {
            event: Envelope::new(execution_id.clone()),
            name: name.to_string(),
            trigger_execution_id: new_trigger_execution_id(),
            args,
        }))?;
        tracing::info!(execution_id = %execution_id, trigger = name, "Fired trigger");
        Ok(execution_id)
    }

    /// Waits until the execution is finished or failed.
    ///
    /// Fails if the engine stopped on an invariant violation first.
    pub async fn wait_for_execution(&self, execution_id: &str) -> Result<Arc<Execution>, PipeflowError> {
        let receiver = self.inner.repository.subscribe(execution_id);
        if let Some(execution) = self.inner.repository.cached(execution_id) {
            return Ok(execution);
        }
        let Some(mut receiver) = receiver else {
            return self.load_terminal(execution_id).await;
        };

        loop {
            let current = receiver.borrow_and_update().clone();
            if let Some(execution) = current {
                return Ok(execution);
            }
            self.inner.check_running()?;

            tokio::select! {
                changed = receiver.changed() => {
                    if changed.is_err() {
                        let current = receiver.borrow().clone();
                        return match current {
                            Some(execution) => Ok(execution),
                            None => self.load_terminal(execution_id).await,
                        };
                    }
                }
                () = self.inner.shutdown.cancelled() => self.inner.check_running()?,
            }
        }
    }

    /// Rebuilds an execution from its log, or returns the cached copy of a
    /// recently ended one.
    pub async fn load_execution(&self, execution_id: &str) -> Result<Execution, PipeflowError> {
        if let Some(execution) = self.inner.repository.cached(execution_id) {
            return Ok(execution.as_ref().clone());
        }
        let entries = self.inner.repository.store().read_all(execution_id).await?;
        if entries.is_empty() {
            return Err(PipeflowError::not_found(format!("execution {execution_id}")));
        }
        Execution::replay(execution_id, &entries)
    }

    /// Cancels a pipeline execution and any child pipelines it launched.
    pub fn cancel_pipeline(
        &self,
        execution_id: &str,
        pipeline_execution_id: &str,
        reason: impl Into<String>,
    ) -> Result<(), PipeflowError> {
        self.inner.send(Command::from(PipelineCancel {
            event: Envelope::new(execution_id),
            pipeline_execution_id: pipeline_execution_id.to_string(),
            reason: reason.into(),
        }))
    }

    /// Pauses a pipeline execution. Running steps complete; nothing new
    /// starts until it is resumed.
    pub fn pause_pipeline(&self, execution_id: &str, pipeline_execution_id: &str) -> Result<(), PipeflowError> {
        self.inner.send(Command::from(PipelinePause {
            event: Envelope::new(execution_id),
            pipeline_execution_id: pipeline_execution_id.to_string(),
        }))
    }

    /// Resumes a paused pipeline execution.
    pub fn resume_pipeline(&self, execution_id: &str, pipeline_execution_id: &str) -> Result<(), PipeflowError> {
        self.inner.send(Command::from(PipelineResume {
            event: Envelope::new(execution_id),
            pipeline_execution_id: pipeline_execution_id.to_string(),
        }))
    }

    /// Stops the run loop. In-flight handlers are aborted.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel("engine shut down");
    }

    async fn load_terminal(&self, execution_id: &str) -> Result<Arc<Execution>, PipeflowError> {
        let execution = self.load_execution(execution_id).await?;
        if execution.is_terminal() {
            Ok(Arc::new(execution))
        } else {
            Err(PipeflowError::bad_request(format!(
                "execution {execution_id} is not running in this engine"
            )))
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run(inner: Arc<EngineInner>, mut receiver: MessageReceiver) {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            message = receiver.recv() => {
                let Some(entry) = message else { break };
                let inner = Arc::clone(&inner);
                tasks.spawn(async move { inner.handle(entry).await });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = joined {
                    if err.is_panic() {
                        tracing::error!(error = %err, "Handler task panicked");
                    }
                }
            }
        }
    }
    tracing::info!(
        in_flight = tasks.len(),
        reason = ?inner.shutdown.reason(),
        "Pipeflow engine stopped"
    );
}

impl EngineInner {
    fn send(&self, command: Command) -> Result<(), PipeflowError> {
        self.check_running()?;
        if self.dispatcher.dispatch(command) {
            Ok(())
        } else {
            Err(PipeflowError::Cancelled("engine stopped".to_string()))
        }
    }

    fn check_running(&self) -> Result<(), PipeflowError> {
        if let Some(fatal) = self.fatal.lock().clone() {
            return Err(fatal.into());
        }
        if self.shutdown.is_cancelled() {
            return Err(PipeflowError::Cancelled(
                self.shutdown.reason().unwrap_or_default(),
            ));
        }
        Ok(())
    }

    async fn handle(&self, entry: LogEntry) {
        let span = execution_span(entry.execution_id(), entry.handler_name());
        let result = async {
            match &entry {
                LogEntry::Command(command) => self.on_command(command.clone()).await,
                LogEntry::Event(event) => self.on_event(event).await,
            }
        }
        .instrument(span)
        .await;

        match result {
            Ok(follow_ups) => self.dispatcher.dispatch_all(follow_ups),
            Err(err) => self.on_handler_error(&entry, err),
        }
    }

    /// Turns a handler failure into a failure event so the state machine
    /// still reaches a terminal state.
    fn on_handler_error(&self, entry: &LogEntry, err: PipeflowError) {
        let execution_id = entry.execution_id();
        let handler = entry.handler_name();
        match err {
            PipeflowError::Fatal(fatal) => {
                tracing::error!(execution_id, handler, error = %fatal, "Invariant violated, stopping engine");
                self.fatal.lock().get_or_insert(fatal);
                self.shutdown.cancel("invariant violated");
            }
            PipeflowError::Cancelled(reason) => {
                tracing::debug!(execution_id, handler, reason = %reason, "Handler cancelled");
            }
            other => {
                tracing::error!(execution_id, handler, error = %other, "Handler failed");
                let error = other.into_error_model();
                let event = entry.envelope().child();
                let escalate = matches!(entry, LogEntry::Command(Command::PipelineFail(_)));
                match entry.pipeline_execution_id() {
                    Some(pipeline_execution_id) if !escalate => {
                        self.dispatcher.dispatch(Command::from(PipelineFail {
                            event,
                            pipeline_execution_id: pipeline_execution_id.to_string(),
                            error: Some(error),
                        }));
                    }
                    _ if is_execution_terminal_message(entry) => {}
                    _ => {
                        self.dispatcher.dispatch(Command::from(ExecutionFail {
                            event,
                            errors: vec![StepError::new(error)],
                        }));
                    }
                }
            }
        }
    }
}

const fn is_execution_terminal_message(entry: &LogEntry) -> bool {
    matches!(
        entry,
        LogEntry::Command(Command::ExecutionFail(_) | Command::ExecutionFinish(_))
            | LogEntry::Event(Event::ExecutionFailed(_) | Event::ExecutionFinished(_))
    )
}

type Handled = Result<Vec<LogEntry>, PipeflowError>;

impl EngineInner {
    /// Locks an execution that is still running.
    ///
    /// A terminal execution is retired instead and `None` returned, so late
    /// messages never pin a finished aggregate in memory.
    async fn lock_running(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionGuard>, PipeflowError> {
        let guard = self.repository.lock(execution_id).await?;
        if guard.execution().is_terminal() {
            tracing::debug!(execution_id, "Ignoring message for ended execution");
            self.repository.retire(guard);
            return Ok(None);
        }
        Ok(Some(guard))
    }

    /// Cancellation token shared by every primitive of a pipeline execution.
    fn token(&self, pipeline_execution_id: &str) -> Arc<CancellationToken> {
        self.tokens.get_or_create(pipeline_execution_id)
    }
}
