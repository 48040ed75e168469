//! Hash-chained audit recording

use crate::adapters::storage::AuditSink;
use crate::core::checksum::chained_checksum;
use crate::domain::{
    AuditAction, AuditEntry, AuditEvent, AuditOutcome, CarelinkError, CorrelationId, Result,
    GENESIS_HASH,
};
use chrono::{SubsecRound, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Writes audit entries and keeps the hash chain linear
///
/// Appends are serialized; an entry is only acknowledged once the sink has
/// persisted it. Any sink failure surfaces as
/// [`CarelinkError::AuditWriteFailure`] so callers fail closed.
pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
    actor: String,
    // (sequence, entry_hash) of the last appended entry; loaded lazily
    tail: Mutex<Option<(u64, String)>>,
}

impl AuditRecorder {
    pub fn new(sink: Arc<dyn AuditSink>, actor: impl Into<String>) -> Self {
        Self {
            sink,
            actor: actor.into(),
            tail: Mutex::new(None),
        }
    }

    /// Append one event to the log
    pub async fn record(&self, event: AuditEvent) -> Result<AuditEntry> {
        let mut tail = self.tail.lock().await;

        let (last_sequence, prev_hash) = match tail.as_ref() {
            Some(t) => t.clone(),
            None => match self.sink.last_entry().await.map_err(as_audit_failure)? {
                Some(last) => (last.sequence, last.entry_hash),
                None => (0, GENESIS_HASH.to_string()),
            },
        };

        let mut entry = AuditEntry {
            sequence: last_sequence + 1,
            correlation_id: event.correlation_id,
            actor: self.actor.clone(),
            action: event.action,
            target: event.target,
            outcome: event.outcome,
            detail: event.detail,
            timestamp: Utc::now().trunc_subsecs(6),
            prev_hash,
            entry_hash: String::new(),
        };
        entry.entry_hash =
            chained_checksum(&entry.prev_hash, &entry.hash_input()).map_err(as_audit_failure)?;

        self.sink.append(&entry).await.map_err(|e| {
            tracing::error!(
                action = %entry.action,
                target = %entry.target,
                correlation_id = %entry.correlation_id,
                error = %e,
                "Audit write failed"
            );
            as_audit_failure(e)
        })?;

        *tail = Some((entry.sequence, entry.entry_hash.clone()));
        tracing::debug!(
            sequence = entry.sequence,
            action = %entry.action,
            outcome = %entry.outcome,
            correlation_id = %entry.correlation_id,
            "Audit entry recorded"
        );
        Ok(entry)
    }

    /// Shorthand for an event without detail
    pub async fn record_simple(
        &self,
        correlation_id: CorrelationId,
        action: AuditAction,
        target: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Result<AuditEntry> {
        self.record(AuditEvent::new(correlation_id, action, target, outcome))
            .await
    }

    /// Record a failed action with the error classification as detail
    pub async fn record_failure(
        &self,
        correlation_id: CorrelationId,
        action: AuditAction,
        target: impl Into<String>,
        error: &CarelinkError,
    ) -> Result<AuditEntry> {
        self.record(
            AuditEvent::new(correlation_id, action, target, AuditOutcome::Failed).with_detail(
                serde_json::json!({
                    "error_kind": error.kind(),
                    "error": error.to_string(),
                }),
            ),
        )
        .await
    }

    /// Verify the whole stored chain
    pub async fn verify(&self) -> Result<ChainReport> {
        let entries = self.sink.all_entries().await?;
        Ok(verify_chain(&entries))
    }

    /// Entries sharing a correlation id, in append order
    pub async fn trail(&self, correlation_id: &CorrelationId) -> Result<Vec<AuditEntry>> {
        self.sink.entries_for(correlation_id).await
    }
}

fn as_audit_failure(error: CarelinkError) -> CarelinkError {
    match error {
        CarelinkError::AuditWriteFailure(_) => error,
        other => CarelinkError::AuditWriteFailure(other.to_string()),
    }
}

/// First inconsistency found in a chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainBreak {
    pub sequence: u64,
    pub reason: String,
}

/// Result of [`verify_chain`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainReport {
    pub entries_checked: usize,
    pub first_break: Option<ChainBreak>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

impl fmt::Display for ChainReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.first_break {
            None => write!(f, "{} entries verified, chain intact", self.entries_checked),
            Some(b) => write!(
                f,
                "chain broken at sequence {} after {} entries: {}",
                b.sequence, self.entries_checked, b.reason
            ),
        }
    }
}

/// Check sequence continuity, `prev_hash` links and every `entry_hash`
pub fn verify_chain(entries: &[AuditEntry]) -> ChainReport {
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut expected_sequence = entries.first().map(|e| e.sequence).unwrap_or(1);

    for (checked, entry) in entries.iter().enumerate() {
        let broken = |reason: String| ChainReport {
            entries_checked: checked,
            first_break: Some(ChainBreak {
                sequence: entry.sequence,
                reason,
            }),
        };

        if entry.sequence != expected_sequence {
            return broken(format!(
                "expected sequence {expected_sequence}, found {}",
                entry.sequence
            ));
        }
        if checked > 0 && entry.prev_hash != expected_prev {
            return broken("prev_hash does not match preceding entry".to_string());
        }
        if checked == 0 && entry.sequence == 1 && entry.prev_hash != GENESIS_HASH {
            return broken("first entry does not start from the genesis hash".to_string());
        }

        let recomputed = match chained_checksum(&entry.prev_hash, &entry.hash_input()) {
            Ok(hash) => hash,
            Err(e) => return broken(format!("cannot hash entry: {e}")),
        };
        if recomputed != entry.entry_hash {
            return broken("entry_hash does not match content".to_string());
        }

        expected_prev = entry.entry_hash.clone();
        expected_sequence = entry.sequence + 1;
    }

    ChainReport {
        entries_checked: entries.len(),
        first_break: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::storage::MemoryStore;

    async fn recorder_with(n: usize) -> (Arc<MemoryStore>, AuditRecorder) {
        let store = Arc::new(MemoryStore::new());
        let recorder = AuditRecorder::new(store.clone(), "carelink");
        for i in 0..n {
            recorder
                .record(
                    AuditEvent::new(
                        CorrelationId::new(),
                        AuditAction::RecordFetch,
                        format!("patient:{i}"),
                        AuditOutcome::Succeeded,
                    )
                    .with_detail(serde_json::json!({"page": i})),
                )
                .await
                .unwrap();
        }
        (store, recorder)
    }

    #[tokio::test]
    async fn test_chain_links_entries() {
        let (store, recorder) = recorder_with(3).await;
        let entries = store.all_entries().await.unwrap();
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, entries[0].entry_hash);
        assert_eq!(entries[2].sequence, 3);
        assert!(recorder.verify().await.unwrap().is_intact());
    }

    #[tokio::test]
    async fn test_tampering_detected() {
        let (store, recorder) = recorder_with(3).await;
        let mut entries = store.all_entries().await.unwrap();
        entries[1].target = "patient:someone-else".into();
        store.tamper_audit_entry(1, entries[1].clone()).await;

        let report = recorder.verify().await.unwrap();
        let brk = report.first_break.unwrap();
        assert_eq!(brk.sequence, 2);
        assert!(brk.reason.contains("entry_hash"));
    }

    #[tokio::test]
    async fn test_recorder_resumes_chain_from_sink() {
        let (store, _) = recorder_with(2).await;
        let resumed = AuditRecorder::new(store.clone(), "carelink");
        let entry = resumed
            .record_simple(
                CorrelationId::new(),
                AuditAction::ComplianceSubmit,
                "period:2026-10",
                AuditOutcome::Attempted,
            )
            .await
            .unwrap();
        assert_eq!(entry.sequence, 3);
        assert!(resumed.verify().await.unwrap().is_intact());
    }

    #[tokio::test]
    async fn test_sink_failure_is_audit_failure() {
        let (store, recorder) = recorder_with(1).await;
        store.fail_audit_writes(true);
        let err = recorder
            .record_simple(
                CorrelationId::new(),
                AuditAction::TransferAttempt,
                "transfer:x",
                AuditOutcome::Attempted,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CarelinkError::AuditWriteFailure(_)));

        // The chain tail is unchanged after a failed write
        store.fail_audit_writes(false);
        let next = recorder
            .record_simple(
                CorrelationId::new(),
                AuditAction::TransferAttempt,
                "transfer:x",
                AuditOutcome::Attempted,
            )
            .await
            .unwrap();
        assert_eq!(next.sequence, 2);
        assert!(recorder.verify().await.unwrap().is_intact());
    }

    #[test]
    fn test_empty_chain_is_intact() {
        assert!(verify_chain(&[]).is_intact());
    }
}
