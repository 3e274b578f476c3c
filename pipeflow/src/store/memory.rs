//! In-memory execution logs.

use super::{decode_lines, EventLogStore};
use crate::errors::PipeflowError;
use crate::events::LogEntry;
use async_trait::async_trait;
use dashmap::DashMap;

/// Keeps encoded log lines in memory.
///
/// Lines are stored encoded so reads exercise the same codec as the file
/// store.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    logs: DashMap<String, Vec<String>>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw line, bypassing encoding.
    pub fn append_raw(&self, execution_id: &str, line: impl Into<String>) {
        self.logs
            .entry(execution_id.to_string())
            .or_default()
            .push(line.into());
    }

    /// Number of lines in the execution's log.
    #[must_use]
    pub fn len(&self, execution_id: &str) -> usize {
        self.logs.get(execution_id).map_or(0, |log| log.len())
    }

    /// Handler names of the execution's log, in order.
    pub fn handler_names(&self, execution_id: &str) -> Result<Vec<&'static str>, PipeflowError> {
        let lines = self
            .logs
            .get(execution_id)
            .map(|log| log.clone())
            .unwrap_or_default();
        Ok(decode_lines(execution_id, lines.iter().map(String::as_str))?
            .iter()
            .map(LogEntry::handler_name)
            .collect())
    }
}

#[async_trait]
impl EventLogStore for InMemoryEventStore {
    async fn append(&self, execution_id: &str, entry: &LogEntry) -> Result<(), PipeflowError> {
        let line = entry.encode()?;
        self.append_raw(execution_id, line);
        Ok(())
    }

    async fn read_all(&self, execution_id: &str) -> Result<Vec<LogEntry>, PipeflowError> {
        let lines = self
            .logs
            .get(execution_id)
            .map(|log| log.clone())
            .unwrap_or_default();
        decode_lines(execution_id, lines.iter().map(String::as_str))
    }

    async fn execution_ids(&self) -> Result<Vec<String>, PipeflowError> {
        let mut ids: Vec<String> = self.logs.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}
