//! In-process store
//!
//! Implements every storage trait behind one lock, which makes
//! [`ClinicalRecordStore::commit_reconciliation`] trivially atomic. Used in
//! development and tests; production configuration rejects it.

use super::traits::{
    AuditSink, ClinicalRecordStore, ComplianceStore, ConnectionStateRecord, ConnectionStateStore,
    FieldPatch, MappingStore, TransferStore,
};
use crate::domain::{
    AuditEntry, CanonicalRecord, CarelinkError, ComplianceItem, ComplianceSubmissionBatch,
    ConnectionId, CorrelationId, IdempotencyKey, MedicationTransferRequest, PatientId,
    PatientRecordMapping, ReportingPeriod, Result, SyncStatus, TransferStatus,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct LocalPatient {
    nhs_number: Option<String>,
    fields: CanonicalRecord,
}

#[derive(Debug, Default)]
struct MemoryState {
    patients: BTreeMap<PatientId, LocalPatient>,
    mappings: BTreeMap<PatientId, PatientRecordMapping>,
    transfers: Vec<MedicationTransferRequest>,
    batches: HashMap<ReportingPeriod, ComplianceSubmissionBatch>,
    connections: HashMap<ConnectionId, ConnectionStateRecord>,
    audit: Vec<AuditEntry>,
}

/// Store holding everything in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    record_writes: AtomicUsize,
    fail_audit: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local patient with their recorded national identifier
    pub async fn insert_patient(
        &self,
        patient_id: PatientId,
        nhs_number: Option<&str>,
        fields: CanonicalRecord,
    ) {
        let mut state = self.state.lock().await;
        state.patients.insert(
            patient_id,
            LocalPatient {
                nhs_number: nhs_number.map(str::to_string),
                fields,
            },
        );
    }

    /// Local edit to one field, as the clinical system would make it
    pub async fn set_local_field(&self, patient_id: &PatientId, field: &str, value: Value) {
        let mut state = self.state.lock().await;
        state
            .patients
            .entry(patient_id.clone())
            .or_default()
            .fields
            .insert(field.to_string(), value);
    }

    /// Number of reconciliation commits applied so far
    pub fn record_write_count(&self) -> usize {
        self.record_writes.load(Ordering::SeqCst)
    }

    /// Make subsequent audit appends fail
    pub fn fail_audit_writes(&self, fail: bool) {
        self.fail_audit.store(fail, Ordering::SeqCst);
    }

    /// Overwrite an audit entry in place, simulating tampering
    #[doc(hidden)]
    pub async fn tamper_audit_entry(&self, index: usize, entry: AuditEntry) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.audit.get_mut(index) {
            *slot = entry;
        }
    }
}

#[async_trait]
impl MappingStore for MemoryStore {
    async fn load_mapping(&self, patient_id: &PatientId) -> Result<Option<PatientRecordMapping>> {
        Ok(self.state.lock().await.mappings.get(patient_id).cloned())
    }

    async fn list_mappings(&self) -> Result<Vec<PatientRecordMapping>> {
        Ok(self.state.lock().await.mappings.values().cloned().collect())
    }

    async fn create_mapping(&self, mapping: &PatientRecordMapping) -> Result<PatientRecordMapping> {
        let mut state = self.state.lock().await;
        let stored = state
            .mappings
            .entry(mapping.patient_id.clone())
            .or_insert_with(|| mapping.clone());
        Ok(stored.clone())
    }

    async fn mark_mapping_status(&self, patient_id: &PatientId, status: SyncStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let mapping = state
            .mappings
            .get_mut(patient_id)
            .ok_or_else(|| CarelinkError::NotFound(format!("mapping for patient {patient_id}")))?;
        mapping.sync_status = status;
        Ok(())
    }

    async fn deactivate_mapping(&self, patient_id: &PatientId) -> Result<()> {
        let mut state = self.state.lock().await;
        let mapping = state
            .mappings
            .get_mut(patient_id)
            .ok_or_else(|| CarelinkError::NotFound(format!("mapping for patient {patient_id}")))?;
        mapping.active = false;
        Ok(())
    }
}

#[async_trait]
impl ClinicalRecordStore for MemoryStore {
    async fn national_identifier(&self, patient_id: &PatientId) -> Result<Option<String>> {
        let state = self.state.lock().await;
        Ok(state
            .patients
            .get(patient_id)
            .and_then(|p| p.nhs_number.clone()))
    }

    async fn load_fields(&self, patient_id: &PatientId) -> Result<CanonicalRecord> {
        let state = self.state.lock().await;
        Ok(state
            .patients
            .get(patient_id)
            .map(|p| p.fields.clone())
            .unwrap_or_default())
    }

    async fn commit_reconciliation(
        &self,
        patient_id: &PatientId,
        patch: &FieldPatch,
        mapping: &PatientRecordMapping,
        expected_version: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        let found = state
            .mappings
            .get(patient_id)
            .map(|m| m.version)
            .unwrap_or(0);
        if found != expected_version {
            return Err(CarelinkError::StaleMapping {
                patient_id: patient_id.to_string(),
                expected: expected_version,
                found,
            });
        }

        let patient = state.patients.entry(patient_id.clone()).or_default();
        for (field, value) in &patch.fields {
            patient.fields.insert(field.clone(), value.clone());
        }
        state.mappings.insert(patient_id.clone(), mapping.clone());
        self.record_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn insert_if_absent(
        &self,
        request: &MedicationTransferRequest,
    ) -> Result<Option<MedicationTransferRequest>> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.transfers.iter().find(|t| t.key == request.key) {
            return Ok(Some(existing.clone()));
        }
        state.transfers.push(request.clone());
        Ok(None)
    }

    async fn load_transfer(&self, key: &IdempotencyKey) -> Result<Option<MedicationTransferRequest>> {
        let state = self.state.lock().await;
        Ok(state.transfers.iter().find(|t| &t.key == key).cloned())
    }

    async fn update_transfer(&self, request: &MedicationTransferRequest) -> Result<()> {
        let mut state = self.state.lock().await;
        let slot = state
            .transfers
            .iter_mut()
            .find(|t| t.key == request.key)
            .ok_or_else(|| CarelinkError::NotFound(format!("transfer {}", request.key)))?;
        *slot = request.clone();
        Ok(())
    }

    async fn list_transfers(
        &self,
        status: Option<TransferStatus>,
    ) -> Result<Vec<MedicationTransferRequest>> {
        let state = self.state.lock().await;
        Ok(state
            .transfers
            .iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ComplianceStore for MemoryStore {
    async fn load_batch(&self, period: &ReportingPeriod) -> Result<Option<ComplianceSubmissionBatch>> {
        Ok(self.state.lock().await.batches.get(period).cloned())
    }

    async fn save_batch(&self, batch: &ComplianceSubmissionBatch) -> Result<()> {
        let mut state = self.state.lock().await;
        state.batches.insert(batch.period.clone(), batch.clone());
        Ok(())
    }

    async fn update_item(&self, period: &ReportingPeriod, item: &ComplianceItem) -> Result<()> {
        let mut state = self.state.lock().await;
        let batch = state
            .batches
            .get_mut(period)
            .ok_or_else(|| CarelinkError::NotFound(format!("compliance batch {period}")))?;
        match batch.item_mut(&item.item_id) {
            Some(slot) => *slot = item.clone(),
            None => batch.items.push(item.clone()),
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionStateStore for MemoryStore {
    async fn load_connection_state(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<ConnectionStateRecord>> {
        Ok(self.state.lock().await.connections.get(connection_id).cloned())
    }

    async fn save_connection_state(&self, record: &ConnectionStateRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .connections
            .insert(record.connection_id.clone(), record.clone());
        Ok(())
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(CarelinkError::AuditWriteFailure(
                "audit store unavailable".to_string(),
            ));
        }
        self.state.lock().await.audit.push(entry.clone());
        Ok(())
    }

    async fn last_entry(&self) -> Result<Option<AuditEntry>> {
        Ok(self.state.lock().await.audit.last().cloned())
    }

    async fn entries_for(&self, correlation_id: &CorrelationId) -> Result<Vec<AuditEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .audit
            .iter()
            .filter(|e| &e.correlation_id == correlation_id)
            .cloned()
            .collect())
    }

    async fn all_entries(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.state.lock().await.audit.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NhsNumber;
    use serde_json::json;

    fn patient() -> PatientId {
        PatientId::new("res-1").unwrap()
    }

    fn mapping() -> PatientRecordMapping {
        PatientRecordMapping::new(patient(), NhsNumber::parse("9434765919").unwrap())
    }

    #[tokio::test]
    async fn test_create_mapping_keeps_existing() {
        let store = MemoryStore::new();
        let first = store.create_mapping(&mapping()).await.unwrap();
        let advanced = first.advanced("h1", chrono::Utc::now());
        store
            .commit_reconciliation(&patient(), &FieldPatch::default(), &advanced, 0)
            .await
            .unwrap();

        let again = store.create_mapping(&mapping()).await.unwrap();
        assert_eq!(again.version, 1);
    }

    #[tokio::test]
    async fn test_commit_rejects_stale_version() {
        let store = MemoryStore::new();
        store.create_mapping(&mapping()).await.unwrap();

        let mut patch = FieldPatch::default();
        patch
            .fields
            .insert("demographics.family_name".into(), json!("Smith"));
        let next = mapping().advanced("h1", chrono::Utc::now());

        let err = store
            .commit_reconciliation(&patient(), &patch, &next, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, CarelinkError::StaleMapping { found: 0, .. }));
        assert!(store.load_fields(&patient()).await.unwrap().is_empty());
        assert_eq!(store.record_write_count(), 0);
    }

    #[tokio::test]
    async fn test_deactivate_keeps_row() {
        let store = MemoryStore::new();
        store.create_mapping(&mapping()).await.unwrap();
        store.deactivate_mapping(&patient()).await.unwrap();
        let m = store.load_mapping(&patient()).await.unwrap().unwrap();
        assert!(!m.active);
    }

    #[tokio::test]
    async fn test_audit_failure_injection() {
        let store = MemoryStore::new();
        store.fail_audit_writes(true);
        assert!(store.last_entry().await.unwrap().is_none());
        let entry = AuditEntry {
            sequence: 1,
            correlation_id: CorrelationId::new(),
            actor: "t".into(),
            action: crate::domain::AuditAction::RecordFetch,
            target: "x".into(),
            outcome: crate::domain::AuditOutcome::Succeeded,
            detail: Value::Null,
            timestamp: chrono::Utc::now(),
            prev_hash: crate::domain::GENESIS_HASH.into(),
            entry_hash: "h".into(),
        };
        assert!(matches!(
            store.append(&entry).await,
            Err(CarelinkError::AuditWriteFailure(_))
        ));
    }
}
