//! Append-only JSONL audit log on the local filesystem

use super::storage::traits::AuditSink;
use crate::domain::{AuditEntry, CarelinkError, CorrelationId, Result};
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// One JSON object per line; every append is flushed with `sync_data`
pub struct FileAuditLog {
    path: PathBuf,
    // Serializes appends and caches the tail of the chain
    last: Mutex<Option<AuditEntry>>,
}

impl FileAuditLog {
    /// Open (or create) the log and load its last entry
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CarelinkError::AuditWriteFailure(format!(
                    "Failed to create audit log directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let entries = read_entries(&path)?;
        tracing::debug!(path = %path.display(), entries = entries.len(), "Audit log opened");

        Ok(Self {
            path,
            last: Mutex::new(entries.last().cloned()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_entries(path: &Path) -> Result<Vec<AuditEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(path)?;
    let mut entries = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = serde_json::from_str(&line).map_err(|e| {
            CarelinkError::Serialization(format!(
                "Corrupt audit log {} at line {}: {e}",
                path.display(),
                index + 1
            ))
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

fn write_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    file.sync_data()
}

#[async_trait]
impl AuditSink for FileAuditLog {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut last = self.last.lock().await;

        let line = serde_json::to_string(entry)
            .map_err(|e| CarelinkError::AuditWriteFailure(format!("serialize: {e}")))?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_line(&path, &line))
            .await
            .map_err(|e| CarelinkError::AuditWriteFailure(format!("writer task failed: {e}")))?
            .map_err(|e| {
                CarelinkError::AuditWriteFailure(format!(
                    "Failed to write audit log {}: {e}",
                    self.path.display()
                ))
            })?;

        *last = Some(entry.clone());
        Ok(())
    }

    async fn last_entry(&self) -> Result<Option<AuditEntry>> {
        Ok(self.last.lock().await.clone())
    }

    async fn entries_for(&self, correlation_id: &CorrelationId) -> Result<Vec<AuditEntry>> {
        Ok(self
            .all_entries()
            .await?
            .into_iter()
            .filter(|e| &e.correlation_id == correlation_id)
            .collect())
    }

    async fn all_entries(&self) -> Result<Vec<AuditEntry>> {
        let _guard = self.last.lock().await;
        read_entries(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AuditAction, AuditOutcome, GENESIS_HASH};
    use tempfile::tempdir;

    fn entry(sequence: u64, correlation_id: CorrelationId) -> AuditEntry {
        AuditEntry {
            sequence,
            correlation_id,
            actor: "carelink".into(),
            action: AuditAction::TransferAttempt,
            target: "transfer:abc".into(),
            outcome: AuditOutcome::Attempted,
            detail: serde_json::json!({"attempt": 1}),
            timestamp: chrono::Utc::now(),
            prev_hash: GENESIS_HASH.into(),
            entry_hash: format!("hash-{sequence}"),
        }
    }

    #[tokio::test]
    async fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit").join("log.jsonl");
        let correlation = CorrelationId::new();

        let log = FileAuditLog::open(&path).unwrap();
        log.append(&entry(1, correlation)).await.unwrap();
        log.append(&entry(2, CorrelationId::new())).await.unwrap();

        let reopened = FileAuditLog::open(&path).unwrap();
        assert_eq!(reopened.last_entry().await.unwrap().unwrap().sequence, 2);
        assert_eq!(reopened.all_entries().await.unwrap().len(), 2);
        assert_eq!(reopened.entries_for(&correlation).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_line_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();
        assert!(matches!(
            FileAuditLog::open(&path),
            Err(CarelinkError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_unwritable_path_fails_closed() {
        let dir = tempdir().unwrap();
        let log = FileAuditLog::open(dir.path().join("log.jsonl")).unwrap();
        // A directory at the log path makes the open fail
        std::fs::create_dir(dir.path().join("log.jsonl")).unwrap();
        let err = log.append(&entry(1, CorrelationId::new())).await.unwrap_err();
        assert!(matches!(err, CarelinkError::AuditWriteFailure(_)));
    }
}
