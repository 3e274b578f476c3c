//! One JSON-lines file per execution.

use super::{decode_lines, EventLogStore};
use crate::errors::PipeflowError;
use crate::events::LogEntry;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const EXTENSION: &str = "jsonl";

/// Writes `<dir>/<execution_id>.jsonl`.
///
/// Appends for one execution are serialized by the engine's execution lock,
/// so the store does no locking of its own.
#[derive(Debug, Clone)]
pub struct JsonlEventStore {
    dir: PathBuf,
}

impl JsonlEventStore {
    /// Creates a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PipeflowError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        tracing::debug!(dir = %dir.display(), "Opened event store");
        Ok(Self { dir })
    }

    /// The store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, execution_id: &str) -> Result<PathBuf, PipeflowError> {
        if execution_id.is_empty()
            || execution_id.contains(|c| c == '/' || c == '\\')
            || execution_id.starts_with('.')
        {
            return Err(PipeflowError::bad_request(format!(
                "invalid execution id '{execution_id}'"
            )));
        }
        Ok(self.dir.join(format!("{execution_id}.{EXTENSION}")))
    }
}

#[async_trait]
impl EventLogStore for JsonlEventStore {
    async fn append(&self, execution_id: &str, entry: &LogEntry) -> Result<(), PipeflowError> {
        let path = self.path(execution_id)?;
        let mut line = entry.encode()?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn read_all(&self, execution_id: &str) -> Result<Vec<LogEntry>, PipeflowError> {
        let path = self.path(execution_id)?;
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        decode_lines(execution_id, contents.lines())
    }

    async fn execution_ids(&self) -> Result<Vec<String>, PipeflowError> {
        let mut ids = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Envelope, Event, PipelineStarted};

    fn entry(execution_id: &str) -> LogEntry {
        LogEntry::from(Event::from(PipelineStarted {
            event: Envelope::new(execution_id),
            pipeline_execution_id: "pexec_1".to_string(),
        }))
    }

    #[tokio::test]
    async fn test_append_writes_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlEventStore::open(dir.path()).await.unwrap();

        store.append("exec_1", &entry("exec_1")).await.unwrap();
        store.append("exec_1", &entry("exec_1")).await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join("exec_1.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.starts_with("{\"event_type\":\"handler.pipeline_started\""));

        let entries = store.read_all("exec_1").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].handler_name(), "handler.pipeline_started");
        assert_eq!(entries[0].pipeline_execution_id(), Some("pexec_1"));
        assert!(entries[0].envelope().created_at <= entries[1].envelope().created_at);
    }

    #[tokio::test]
    async fn test_execution_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlEventStore::open(dir.path()).await.unwrap();
        store.append("exec_b", &entry("exec_b")).await.unwrap();
        store.append("exec_a", &entry("exec_a")).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(store.execution_ids().await.unwrap(), vec!["exec_a", "exec_b"]);
    }

    #[tokio::test]
    async fn test_missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlEventStore::open(dir.path()).await.unwrap();
        assert!(store.read_all("exec_none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlEventStore::open(dir.path()).await.unwrap();
        assert!(store.append("../escape", &entry("x")).await.is_err());
    }
}
