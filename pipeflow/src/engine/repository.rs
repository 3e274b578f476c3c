//! Per-execution locking and lazy replay.

use crate::errors::PipeflowError;
use crate::events::LogEntry;
use crate::execution::{Execution, ExecutionCache};
use crate::registry::Registry;
use crate::store::EventLogStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};

type Slot = Mutex<Option<Execution>>;
type Waiter = watch::Sender<Option<Arc<Execution>>>;

/// Serializes all work on one execution and keeps its aggregate in memory
/// while it runs.
pub(crate) struct ExecutionRepository {
    store: Arc<dyn EventLogStore>,
    locks: Registry<Slot>,
    waiters: Registry<Waiter>,
    cache: ExecutionCache,
}

impl ExecutionRepository {
    pub(crate) fn new(store: Arc<dyn EventLogStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            locks: Registry::new(),
            waiters: Registry::new(),
            cache: ExecutionCache::new(cache_ttl),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn EventLogStore> {
        &self.store
    }

    /// Takes the execution lock, replaying the log on first use.
    pub(crate) async fn lock(&self, execution_id: &str) -> Result<ExecutionGuard, PipeflowError> {
        let slot = self
            .locks
            .get_or_insert_with(execution_id, || Mutex::new(None));
        let mut slot = slot.lock_owned().await;

        let execution = match slot.take() {
            Some(execution) => execution,
            None => {
                let entries = self.store.read_all(execution_id).await?;
                tracing::debug!(execution_id, entries = entries.len(), "Replaying execution log");
                Execution::replay(execution_id, &entries)?
            }
        };

        Ok(ExecutionGuard {
            store: Arc::clone(&self.store),
            slot,
            execution,
            discard: false,
        })
    }

    /// Registers interest in an execution before its first command is
    /// handled.
    pub(crate) fn watch(&self, execution_id: &str) {
        self.waiters
            .get_or_insert_with(execution_id, || watch::channel(None).0);
    }

    /// Moves a terminal execution out of the lock registry into the cache
    /// and wakes its waiters.
    pub(crate) fn retire(&self, guard: ExecutionGuard) -> Arc<Execution> {
        let execution = guard.into_execution();
        let execution_id = execution.id.clone();
        self.locks.release(&execution_id);

        let evicted = self.cache.sweep();
        let execution = self.cache.insert(execution);
        if let Some(waiter) = self.waiters.release(&execution_id) {
            waiter.send_replace(Some(Arc::clone(&execution)));
        }
        tracing::debug!(execution_id = %execution_id, evicted, "Retired execution");
        execution
    }

    pub(crate) fn cached(&self, execution_id: &str) -> Option<Arc<Execution>> {
        self.cache.get(execution_id)
    }

    pub(crate) fn subscribe(
        &self,
        execution_id: &str,
    ) -> Option<watch::Receiver<Option<Arc<Execution>>>> {
        self.waiters
            .get(execution_id)
            .map(|waiter| waiter.subscribe())
    }

    /// Number of executions currently holding a lock entry.
    pub(crate) fn active_count(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive access to one execution's aggregate.
///
/// Dropping the guard hands the aggregate back to the lock. If folding or
/// persisting an entry failed the aggregate is discarded instead, so the
/// next holder replays it from the log.
pub(crate) struct ExecutionGuard {
    store: Arc<dyn EventLogStore>,
    slot: OwnedMutexGuard<Option<Execution>>,
    execution: Execution,
    discard: bool,
}

impl ExecutionGuard {
    pub(crate) const fn execution(&self) -> &Execution {
        &self.execution
    }

    /// Folds `entry` into the aggregate, then appends it to the log.
    ///
    /// Guard violations are detected before anything is persisted.
    pub(crate) async fn append(&mut self, entry: impl Into<LogEntry>) -> Result<LogEntry, PipeflowError> {
        let entry = entry.into();
        if let Err(err) = self.execution.apply(&entry) {
            self.discard = true;
            return Err(err);
        }
        if let Err(err) = self.store.append(&self.execution.id, &entry).await {
            self.discard = true;
            return Err(err);
        }
        tracing::trace!(
            execution_id = %self.execution.id,
            handler = entry.handler_name(),
            "Appended"
        );
        Ok(entry)
    }

    fn into_execution(mut self) -> Execution {
        self.discard = true;
        std::mem::take(&mut self.execution)
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if !self.discard {
            *self.slot = Some(std::mem::take(&mut self.execution));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Input;
    use crate::events::{Command, Envelope, Event, ExecutionFinished, PipelineQueued, StepStart};
    use crate::store::InMemoryEventStore;

    fn repository() -> (Arc<InMemoryEventStore>, ExecutionRepository) {
        let store = Arc::new(InMemoryEventStore::new());
        let repository = ExecutionRepository::new(store.clone(), Duration::from_secs(60));
        (store, repository)
    }

    fn pipeline_queued() -> LogEntry {
        Event::from(PipelineQueued {
            event: Envelope::new("exec_1"),
            name: "deploy".to_string(),
            args: Input::new(),
            pipeline_execution_id: "pexec_1".to_string(),
            parent_pipeline_execution_id: None,
            parent_step_execution_id: None,
        })
        .into()
    }

    #[tokio::test]
    async fn test_append_persists_and_folds() {
        let (store, repository) = repository();
        {
            let mut guard = repository.lock("exec_1").await.unwrap();
            guard.append(pipeline_queued()).await.unwrap();
            assert!(guard.execution().pipeline_executions.contains_key("pexec_1"));
        }
        assert_eq!(store.len("exec_1"), 1);

        // The aggregate is kept in memory between holders.
        let guard = repository.lock("exec_1").await.unwrap();
        assert_eq!(guard.execution().root_pipelines, vec!["pexec_1".to_string()]);
    }

    #[tokio::test]
    async fn test_rejected_entry_is_not_persisted() {
        let (store, repository) = repository();
        let mut guard = repository.lock("exec_1").await.unwrap();
        let bad = Command::from(StepStart {
            event: Envelope::new("exec_1"),
            pipeline_execution_id: "pexec_missing".to_string(),
            step_execution_id: "sexec_1".to_string(),
        });
        assert!(guard.append(bad).await.is_err());
        drop(guard);

        assert_eq!(store.len("exec_1"), 0);
        let guard = repository.lock("exec_1").await.unwrap();
        assert!(guard.execution().pipeline_executions.is_empty());
    }

    #[tokio::test]
    async fn test_retire_wakes_waiters() {
        let (_store, repository) = repository();
        repository.watch("exec_1");
        let mut receiver = repository.subscribe("exec_1").unwrap();

        let mut guard = repository.lock("exec_1").await.unwrap();
        guard
            .append(Event::from(ExecutionFinished {
                event: Envelope::new("exec_1"),
            }))
            .await
            .unwrap();
        repository.retire(guard);

        receiver.changed().await.unwrap();
        let execution = receiver.borrow().clone().unwrap();
        assert!(execution.is_terminal());
        assert!(repository.cached("exec_1").is_some());
        assert_eq!(repository.active_count(), 0);
    }

    #[tokio::test]
    async fn test_lock_serializes_holders() {
        let (_store, repository) = repository();
        let repository = Arc::new(repository);
        let guard = repository.lock("exec_1").await.unwrap();

        let other = {
            let repository = Arc::clone(&repository);
            tokio::spawn(async move { repository.lock("exec_1").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!other.is_finished());

        drop(guard);
        other.await.unwrap().unwrap();

        // A different execution never waits.
        let _a = repository.lock("exec_a").await.unwrap();
        let _b = repository.lock("exec_b").await.unwrap();
    }
}
