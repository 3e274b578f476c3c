//! Mock primitive runner for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::{self, CancellationToken};
use crate::core::{Input, Output};
use crate::errors::ErrorModel;
use crate::runner::{PrimitiveRequest, PrimitiveRunner};

/// A runner that records calls and returns scripted outputs.
///
/// Outputs are scripted per step full name and consumed in order; once a
/// script is exhausted its last output repeats. Steps without a script
/// echo their input.
#[derive(Debug, Default)]
pub struct MockRunner {
    scripts: Mutex<HashMap<String, VecDeque<Output>>>,
    last: Mutex<HashMap<String, Output>>,
    requests: Mutex<Vec<PrimitiveRequest>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockRunner {
    /// Creates a runner that echoes every input.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call take `delay` before returning.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Appends an output to the script of `step_name`.
    #[must_use]
    pub fn with_output(self, step_name: impl Into<String>, output: Output) -> Self {
        self.scripts
            .lock()
            .entry(step_name.into())
            .or_default()
            .push_back(output);
        self
    }

    /// Makes `step_name` fail on every call.
    #[must_use]
    pub fn failing(self, step_name: impl Into<String>, detail: impl Into<String>) -> Self {
        self.with_output(step_name, Output::failed(ErrorModel::internal(detail)))
    }

    /// Number of calls made for `step_name`.
    #[must_use]
    pub fn call_count(&self, step_name: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.step_name == step_name)
            .count()
    }

    /// Total number of calls.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Inputs of every call made for `step_name`, in call order.
    #[must_use]
    pub fn inputs(&self, step_name: &str) -> Vec<Input> {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.step_name == step_name)
            .map(|request| request.input.clone())
            .collect()
    }

    /// Highest number of calls observed running at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_output(&self, request: &PrimitiveRequest) -> Output {
        let scripted = self
            .scripts
            .lock()
            .get_mut(&request.step_name)
            .and_then(VecDeque::pop_front);
        let mut last = self.last.lock();
        match scripted {
            Some(output) => {
                last.insert(request.step_name.clone(), output.clone());
                output
            }
            None => last
                .get(&request.step_name)
                .cloned()
                .unwrap_or_else(|| Output::finished(request.input.clone())),
        }
    }
}

#[async_trait]
impl PrimitiveRunner for MockRunner {
    async fn run(
        &self,
        request: PrimitiveRequest,
        cancel: Arc<CancellationToken>,
    ) -> anyhow::Result<Output> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let slept = match self.delay {
            Some(delay) => cancellation::sleep(delay, &cancel).await,
            None => Ok(()),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        slept?;

        Ok(self.next_output(&request))
    }
}
