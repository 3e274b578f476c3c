//! Grace-period cache of terminal executions.

use super::Execution;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Keeps terminal executions readable for a while after they end.
#[derive(Debug)]
pub struct ExecutionCache {
    ttl: Duration,
    entries: DashMap<String, (Instant, Arc<Execution>)>,
}

impl ExecutionCache {
    /// Creates a cache whose entries expire `ttl` after insertion.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Inserts or replaces an execution.
    pub fn insert(&self, execution: Execution) -> Arc<Execution> {
        let execution = Arc::new(execution);
        self.entries.insert(
            execution.id.clone(),
            (Instant::now() + self.ttl, Arc::clone(&execution)),
        );
        execution
    }

    /// Returns an unexpired execution.
    #[must_use]
    pub fn get(&self, execution_id: &str) -> Option<Arc<Execution>> {
        let entry = self.entries.get(execution_id)?;
        let (expires_at, execution) = entry.value();
        (Instant::now() < *expires_at).then(|| Arc::clone(execution))
    }

    /// Removes expired entries and returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (expires_at, _)| now < *expires_at);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "Evicted expired executions");
        }
        removed
    }

    /// Number of cached executions, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
