//! Engine configuration.

use crate::concurrency::ConcurrencyConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration read once when an engine is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global per-step-type limits.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// Directory of the JSONL event store. `None` keeps logs in memory.
    #[serde(default)]
    pub event_store_dir: Option<PathBuf>,
    /// How long a terminal execution stays readable from memory.
    #[serde(default = "default_cache_ttl_secs")]
    pub execution_cache_ttl_secs: u64,
}

const fn default_cache_ttl_secs() -> u64 {
    600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyConfig::default(),
            event_store_dir: None,
            execution_cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl EngineConfig {
    /// Environment variable for the event store directory.
    pub const EVENT_STORE_DIR_ENV: &'static str = "PIPEFLOW_EVENT_STORE_DIR";
    /// Environment variable for the execution cache TTL in seconds.
    pub const CACHE_TTL_ENV: &'static str = "PIPEFLOW_EXECUTION_CACHE_TTL_SECS";

    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the configuration from `PIPEFLOW_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let execution_cache_ttl_secs = lookup(Self::CACHE_TTL_ENV)
            .and_then(|value| parse_positive(Self::CACHE_TTL_ENV, &value))
            .map_or_else(default_cache_ttl_secs, |secs| secs as u64);
        Self {
            concurrency: ConcurrencyConfig::from_lookup(&lookup),
            event_store_dir: lookup(Self::EVENT_STORE_DIR_ENV)
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
            execution_cache_ttl_secs,
        }
    }

    /// Sets the global limits.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: ConcurrencyConfig) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Persists logs as JSONL files under `dir`.
    #[must_use]
    pub fn with_event_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.event_store_dir = Some(dir.into());
        self
    }

    /// Sets the execution cache TTL.
    #[must_use]
    pub const fn with_execution_cache_ttl(mut self, ttl: Duration) -> Self {
        self.execution_cache_ttl_secs = ttl.as_secs();
        self
    }

    /// The execution cache TTL.
    #[must_use]
    pub const fn execution_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.execution_cache_ttl_secs)
    }
}

/// Parses a strictly positive integer setting; anything else is logged and
/// ignored.
pub(crate) fn parse_positive(name: &str, value: &str) -> Option<usize> {
    match value.trim().parse::<usize>() {
        Ok(0) => None,
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::warn!(setting = name, value, error = %err, "Ignoring invalid setting");
            None
        }
    }
}
