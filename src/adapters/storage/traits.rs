//! Persistence traits
//!
//! Each store is a seam with an in-memory and a PostgreSQL implementation.
//! Nothing here exposes a delete: mappings are deactivated, transfers and
//! batches only change status, audit entries are append-only.

use crate::domain::{
    AuditEntry, CanonicalRecord, ComplianceItem, ComplianceSubmissionBatch, ConnectionId,
    ConnectionStatus, CorrelationId, IdempotencyKey, MedicationTransferRequest, PatientId,
    PatientRecordMapping, ReportingPeriod, Result, SyncStatus, TransferStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

/// Field values to overwrite in the local record
///
/// Only externally-owned fields ever appear in a patch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldPatch {
    pub fields: BTreeMap<String, Value>,
}

impl FieldPatch {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

/// Persisted lifecycle state of a connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateRecord {
    pub connection_id: ConnectionId,
    pub status: ConnectionStatus,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Patient ↔ national identifier mappings
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn load_mapping(&self, patient_id: &PatientId) -> Result<Option<PatientRecordMapping>>;

    async fn list_mappings(&self) -> Result<Vec<PatientRecordMapping>>;

    /// Insert the mapping unless one exists; returns whichever mapping is stored
    async fn create_mapping(&self, mapping: &PatientRecordMapping) -> Result<PatientRecordMapping>;

    async fn mark_mapping_status(&self, patient_id: &PatientId, status: SyncStatus) -> Result<()>;

    async fn deactivate_mapping(&self, patient_id: &PatientId) -> Result<()>;
}

/// The local canonical clinical-record store
#[async_trait]
pub trait ClinicalRecordStore: Send + Sync {
    /// National identifier recorded locally for the patient, unvalidated
    async fn national_identifier(&self, patient_id: &PatientId) -> Result<Option<String>>;

    /// Current canonical field values
    async fn load_fields(&self, patient_id: &PatientId) -> Result<CanonicalRecord>;

    /// Apply `patch` and store `mapping` in one atomic step
    ///
    /// # Errors
    ///
    /// Returns [`CarelinkError::StaleMapping`](crate::domain::CarelinkError::StaleMapping)
    /// when the stored mapping version is no longer `expected_version`; nothing
    /// is written in that case.
    async fn commit_reconciliation(
        &self,
        patient_id: &PatientId,
        patch: &FieldPatch,
        mapping: &PatientRecordMapping,
        expected_version: u64,
    ) -> Result<()>;
}

/// Medication-transfer requests indexed by idempotency key
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Insert the request unless its key exists; returns the existing request if so
    async fn insert_if_absent(
        &self,
        request: &MedicationTransferRequest,
    ) -> Result<Option<MedicationTransferRequest>>;

    async fn load_transfer(&self, key: &IdempotencyKey) -> Result<Option<MedicationTransferRequest>>;

    async fn update_transfer(&self, request: &MedicationTransferRequest) -> Result<()>;

    /// All requests, optionally filtered by status, oldest first
    async fn list_transfers(
        &self,
        status: Option<TransferStatus>,
    ) -> Result<Vec<MedicationTransferRequest>>;
}

/// Compliance batches per reporting period
#[async_trait]
pub trait ComplianceStore: Send + Sync {
    async fn load_batch(&self, period: &ReportingPeriod) -> Result<Option<ComplianceSubmissionBatch>>;

    async fn save_batch(&self, batch: &ComplianceSubmissionBatch) -> Result<()>;

    /// Persist a single item's status without rewriting the batch
    async fn update_item(&self, period: &ReportingPeriod, item: &ComplianceItem) -> Result<()>;
}

/// Connection lifecycle persistence
#[async_trait]
pub trait ConnectionStateStore: Send + Sync {
    async fn load_connection_state(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<ConnectionStateRecord>>;

    async fn save_connection_state(&self, state: &ConnectionStateRecord) -> Result<()>;
}

/// Append-only audit log
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Durably append one entry; returns only once the entry is persisted
    async fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// Most recent entry, used to continue the hash chain
    async fn last_entry(&self) -> Result<Option<AuditEntry>>;

    async fn entries_for(&self, correlation_id: &CorrelationId) -> Result<Vec<AuditEntry>>;

    /// Every entry in append order
    async fn all_entries(&self) -> Result<Vec<AuditEntry>>;
}
