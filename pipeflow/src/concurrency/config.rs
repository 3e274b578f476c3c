//! Global concurrency limits.

use crate::config::parse_positive;
use crate::core::StepType;
use serde::{Deserialize, Serialize};

/// Capacities of the global per-step-type semaphores.
///
/// Zero means "use the default".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// In-flight `http` steps across all executions.
    #[serde(default = "default_http")]
    pub http: usize,
    /// In-flight `query` steps across all executions.
    #[serde(default = "default_query")]
    pub query: usize,
    /// In-flight `container` steps across all executions.
    #[serde(default = "default_container")]
    pub container: usize,
    /// In-flight `function` steps across all executions.
    #[serde(default = "default_function")]
    pub function: usize,
}

const fn default_http() -> usize {
    500
}

const fn default_query() -> usize {
    50
}

const fn default_container() -> usize {
    25
}

const fn default_function() -> usize {
    50
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            http: default_http(),
            query: default_query(),
            container: default_container(),
            function: default_function(),
        }
    }
}

impl ConcurrencyConfig {
    /// Environment variable for the `http` limit.
    pub const HTTP_ENV: &'static str = "PIPEFLOW_MAX_CONCURRENCY_HTTP";
    /// Environment variable for the `query` limit.
    pub const QUERY_ENV: &'static str = "PIPEFLOW_MAX_CONCURRENCY_QUERY";
    /// Environment variable for the `container` limit.
    pub const CONTAINER_ENV: &'static str = "PIPEFLOW_MAX_CONCURRENCY_CONTAINER";
    /// Environment variable for the `function` limit.
    pub const FUNCTION_ENV: &'static str = "PIPEFLOW_MAX_CONCURRENCY_FUNCTION";

    /// Creates the default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads limits from `PIPEFLOW_MAX_CONCURRENCY_*`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads limits through `lookup`; missing, zero or invalid values keep
    /// their default.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str, default: usize| {
            lookup(name)
                .and_then(|value| parse_positive(name, &value))
                .unwrap_or(default)
        };
        Self {
            http: read(Self::HTTP_ENV, default_http()),
            query: read(Self::QUERY_ENV, default_query()),
            container: read(Self::CONTAINER_ENV, default_container()),
            function: read(Self::FUNCTION_ENV, default_function()),
        }
    }

    /// Sets the `http` limit.
    #[must_use]
    pub const fn with_http(mut self, limit: usize) -> Self {
        self.http = limit;
        self
    }

    /// Sets the `query` limit.
    #[must_use]
    pub const fn with_query(mut self, limit: usize) -> Self {
        self.query = limit;
        self
    }

    /// Sets the `container` limit.
    #[must_use]
    pub const fn with_container(mut self, limit: usize) -> Self {
        self.container = limit;
        self
    }

    /// Sets the `function` limit.
    #[must_use]
    pub const fn with_function(mut self, limit: usize) -> Self {
        self.function = limit;
        self
    }

    /// Global limit for `step_type`, or `None` if the type is not limited.
    #[must_use]
    pub const fn limit_for(&self, step_type: StepType) -> Option<usize> {
        let (configured, default) = match step_type {
            StepType::Http => (self.http, default_http()),
            StepType::Query => (self.query, default_query()),
            StepType::Container => (self.container, default_container()),
            StepType::Function => (self.function, default_function()),
            _ => return None,
        };
        Some(if configured == 0 { default } else { configured })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ConcurrencyConfig::default();
        assert_eq!(config.limit_for(StepType::Http), Some(500));
        assert_eq!(config.limit_for(StepType::Query), Some(50));
        assert_eq!(config.limit_for(StepType::Container), Some(25));
        assert_eq!(config.limit_for(StepType::Function), Some(50));
        assert_eq!(config.limit_for(StepType::Echo), None);
    }

    #[test]
    fn test_zero_falls_back_to_default() {
        let config = ConcurrencyConfig::new()
            .with_http(0)
            .with_query(3)
            .with_container(0)
            .with_function(7);
        assert_eq!(config.limit_for(StepType::Http), Some(500));
        assert_eq!(config.limit_for(StepType::Query), Some(3));
        assert_eq!(config.limit_for(StepType::Container), Some(25));
        assert_eq!(config.limit_for(StepType::Function), Some(7));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ConcurrencyConfig::HTTP_ENV, "10"),
            (ConcurrencyConfig::QUERY_ENV, "0"),
            (ConcurrencyConfig::CONTAINER_ENV, "lots"),
        ]
        .into_iter()
        .collect();
        let config =
            ConcurrencyConfig::from_lookup(|name| vars.get(name).map(ToString::to_string));

        assert_eq!(config.http, 10);
        assert_eq!(config.query, 50);
        assert_eq!(config.container, 25);
        assert_eq!(config.function, 50);
    }

    #[test]
    fn test_serde_defaults() {
        let config: ConcurrencyConfig = serde_json::from_str(r#"{"http": 8}"#).unwrap();
        assert_eq!(config.http, 8);
        assert_eq!(config.container, 25);
    }
}
