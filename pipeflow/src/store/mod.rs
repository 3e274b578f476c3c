//! Durable storage for execution logs.
//!
//! A store appends encoded [`LogEntry`] lines per execution and reads them
//! back in append order. `append` must not return before the entry is
//! durable.

mod jsonl;
mod memory;

pub use jsonl::JsonlEventStore;
pub use memory::InMemoryEventStore;

use crate::errors::PipeflowError;
use crate::events::LogEntry;
use async_trait::async_trait;

/// Append-only per-execution log storage.
#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Appends one entry to the execution's log.
    async fn append(&self, execution_id: &str, entry: &LogEntry) -> Result<(), PipeflowError>;

    /// Reads every known entry of the execution's log in append order.
    ///
    /// Entries with unknown tags are skipped. An execution with no log reads
    /// as empty.
    async fn read_all(&self, execution_id: &str) -> Result<Vec<LogEntry>, PipeflowError>;

    /// Identifiers of every execution with a log.
    async fn execution_ids(&self) -> Result<Vec<String>, PipeflowError>;
}

/// Decodes log lines, skipping blank lines and unknown tags.
pub(crate) fn decode_lines<'a>(
    execution_id: &str,
    lines: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<LogEntry>, PipeflowError> {
    let mut entries = Vec::new();
    for (number, line) in lines.into_iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match LogEntry::decode(line) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {}
            Err(err) => {
                return Err(PipeflowError::Store(format!(
                    "execution {execution_id}, line {}: {err}",
                    number + 1
                )))
            }
        }
    }
    Ok(entries)
}
