//! Lazily created, keyed semaphores.

use super::ConcurrencyConfig;
use crate::cancellation::{self, CancellationToken};
use crate::core::StepType;
use crate::errors::PipeflowError;
use crate::registry::Registry;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// The limits that apply to one step execution.
#[derive(Debug, Clone, Copy)]
pub struct PermitRequest<'a> {
    /// Primitive kind, for the global tier.
    pub step_type: StepType,
    /// Pipeline definition name.
    pub pipeline: &'a str,
    /// Pipeline definition `max_concurrency`.
    pub pipeline_max_concurrency: Option<usize>,
    /// Pipeline execution the step runs in.
    pub pipeline_execution_id: &'a str,
    /// Step full name.
    pub step_name: &'a str,
    /// Step definition `max_concurrency`.
    pub step_max_concurrency: Option<usize>,
}

impl PermitRequest<'_> {
    fn pipeline_key(&self) -> String {
        format!("{}-pipeline-semaphore", self.pipeline)
    }

    fn step_key(&self) -> String {
        format!("{}-{}", self.pipeline_execution_id, self.step_name)
    }
}

/// Permits held by one running step. Dropping releases all of them.
#[derive(Debug, Default)]
pub struct StepPermits {
    permits: Vec<OwnedSemaphorePermit>,
}

impl StepPermits {
    /// Number of tiers this step holds a permit of.
    #[must_use]
    pub fn len(&self) -> usize {
        self.permits.len()
    }

    /// Returns true if no tier applied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.permits.is_empty()
    }
}

/// Owns the three semaphore tiers.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    config: ConcurrencyConfig,
    global: Registry<Semaphore>,
    pipelines: Registry<Semaphore>,
    steps: Registry<Semaphore>,
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(ConcurrencyConfig::default())
    }
}

impl ConcurrencyLimiter {
    /// Creates a limiter with the given global limits.
    #[must_use]
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            config,
            global: Registry::new(),
            pipelines: Registry::new(),
            steps: Registry::new(),
        }
    }

    /// The global limits.
    #[must_use]
    pub const fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    /// Semaphores of `request`, narrowest scope first.
    fn semaphores(&self, request: &PermitRequest<'_>) -> Vec<Arc<Semaphore>> {
        let mut semaphores = Vec::with_capacity(3);
        if let Some(limit) = request.step_max_concurrency {
            semaphores.push(
                self.steps
                    .get_or_insert_with(&request.step_key(), || Semaphore::new(limit.max(1))),
            );
        }
        if let Some(limit) = request.pipeline_max_concurrency {
            semaphores.push(
                self.pipelines
                    .get_or_insert_with(&request.pipeline_key(), || Semaphore::new(limit.max(1))),
            );
        }
        if let Some(limit) = self.config.limit_for(request.step_type) {
            semaphores.push(
                self.global
                    .get_or_insert_with(request.step_type.as_str(), || Semaphore::new(limit)),
            );
        }
        semaphores
    }

    /// Waits for a permit of every applicable tier.
    ///
    /// Fails with [`PipeflowError::Cancelled`] if `cancel` trips first; any
    /// permits already taken are released.
    pub async fn acquire(
        &self,
        request: &PermitRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<StepPermits, PipeflowError> {
        let mut permits = StepPermits::default();
        for semaphore in self.semaphores(request) {
            cancellation::check(cancel)?;
            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit
                    .map_err(|_| PipeflowError::Internal("semaphore closed".to_string()))?,
                () = cancel.cancelled() => {
                    return Err(PipeflowError::Cancelled(cancel.reason().unwrap_or_default()));
                }
            };
            permits.permits.push(permit);
        }
        tracing::trace!(
            step = request.step_name,
            pipeline_execution_id = request.pipeline_execution_id,
            tiers = permits.len(),
            "Acquired step permits"
        );
        Ok(permits)
    }

    /// Takes a permit of every applicable tier without waiting.
    ///
    /// Returns `None`, holding nothing, if any tier is at capacity.
    #[must_use]
    pub fn try_acquire(&self, request: &PermitRequest<'_>) -> Option<StepPermits> {
        let mut permits = StepPermits::default();
        for semaphore in self.semaphores(request) {
            match semaphore.try_acquire_owned() {
                Ok(permit) => permits.permits.push(permit),
                Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => return None,
            }
        }
        Some(permits)
    }

    /// Drops the per-step semaphores of a terminal pipeline execution and
    /// returns how many were removed.
    pub fn complete_pipeline_execution(&self, pipeline_execution_id: &str) -> usize {
        let prefix = format!("{pipeline_execution_id}-");
        let removed = self.steps.release_matching(|key| key.starts_with(&prefix));
        if removed > 0 {
            tracing::debug!(pipeline_execution_id, removed, "Swept step semaphores");
        }
        removed
    }

    /// Number of cached per-step semaphores.
    #[must_use]
    pub fn step_semaphore_count(&self) -> usize {
        self.steps.len()
    }
}
