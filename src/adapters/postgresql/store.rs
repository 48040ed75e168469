//! PostgreSQL implementation of the storage traits

use super::client::PostgreSQLClient;
use super::models::{AuditRow, ComplianceItemRow, ConnectionStateRow, MappingRow, TransferRow};
use crate::adapters::storage::{
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
use std::sync::Arc;

fn db_error(context: &'static str) -> impl Fn(tokio_postgres::Error) -> CarelinkError {
    move |e| CarelinkError::Storage(format!("{context}: {e}"))
}

const MAPPING_COLUMNS: &str = "patient_id, nhs_number, version, content_hash, sync_status, \
                               active, created_at, last_synced_at";

const TRANSFER_COLUMNS: &str = "idempotency_key, connection_id, payload, status, retry_count, \
                                last_attempt_at, next_attempt_at, acknowledgement, \
                                failure_reason, created_at";

const AUDIT_COLUMNS: &str = "sequence, correlation_id, actor, action, target, outcome, detail, \
                             recorded_at, prev_hash, entry_hash";

/// Every store backed by one PostgreSQL pool
pub struct PostgresStore {
    client: Arc<PostgreSQLClient>,
}

impl PostgresStore {
    pub fn new(client: PostgreSQLClient) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    pub fn client(&self) -> &Arc<PostgreSQLClient> {
        &self.client
    }
}

#[async_trait]
impl MappingStore for PostgresStore {
    async fn load_mapping(&self, patient_id: &PatientId) -> Result<Option<PatientRecordMapping>> {
        let client = self.client.get_connection().await?;
        let row = client
            .query_opt(
                &format!("SELECT {MAPPING_COLUMNS} FROM patient_mappings WHERE patient_id = $1"),
                &[&patient_id.as_str()],
            )
            .await
            .map_err(db_error("Failed to load mapping"))?;
        row.map(|r| MappingRow::from_row(&r)?.into_domain())
            .transpose()
    }

    async fn list_mappings(&self) -> Result<Vec<PatientRecordMapping>> {
        let client = self.client.get_connection().await?;
        let rows = client
            .query(
                &format!("SELECT {MAPPING_COLUMNS} FROM patient_mappings ORDER BY patient_id"),
                &[],
            )
            .await
            .map_err(db_error("Failed to list mappings"))?;
        rows.iter()
            .map(|r| MappingRow::from_row(r)?.into_domain())
            .collect()
    }

    async fn create_mapping(&self, mapping: &PatientRecordMapping) -> Result<PatientRecordMapping> {
        let row = MappingRow::from_domain(mapping)?;
        let client = self.client.get_connection().await?;
        client
            .execute(
                &format!(
                    "INSERT INTO patient_mappings ({MAPPING_COLUMNS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                     ON CONFLICT (patient_id) DO NOTHING"
                ),
                &[
                    &row.patient_id,
                    &row.nhs_number,
                    &row.version,
                    &row.content_hash,
                    &row.sync_status,
                    &row.active,
                    &row.created_at,
                    &row.last_synced_at,
                ],
            )
            .await
            .map_err(db_error("Failed to create mapping"))?;

        let stored = client
            .query_one(
                &format!("SELECT {MAPPING_COLUMNS} FROM patient_mappings WHERE patient_id = $1"),
                &[&row.patient_id],
            )
            .await
            .map_err(db_error("Failed to reload mapping"))?;
        MappingRow::from_row(&stored)?.into_domain()
    }

    async fn mark_mapping_status(&self, patient_id: &PatientId, status: SyncStatus) -> Result<()> {
        let client = self.client.get_connection().await?;
        let updated = client
            .execute(
                "UPDATE patient_mappings SET sync_status = $2 WHERE patient_id = $1",
                &[&patient_id.as_str(), &status.to_string()],
            )
            .await
            .map_err(db_error("Failed to update mapping status"))?;
        if updated == 0 {
            return Err(CarelinkError::NotFound(format!(
                "mapping for patient {patient_id}"
            )));
        }
        Ok(())
    }

    async fn deactivate_mapping(&self, patient_id: &PatientId) -> Result<()> {
        let client = self.client.get_connection().await?;
        let updated = client
            .execute(
                "UPDATE patient_mappings SET active = FALSE WHERE patient_id = $1",
                &[&patient_id.as_str()],
            )
            .await
            .map_err(db_error("Failed to deactivate mapping"))?;
        if updated == 0 {
            return Err(CarelinkError::NotFound(format!(
                "mapping for patient {patient_id}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ClinicalRecordStore for PostgresStore {
    async fn national_identifier(&self, patient_id: &PatientId) -> Result<Option<String>> {
        let client = self.client.get_connection().await?;
        let row = client
            .query_opt(
                "SELECT nhs_number FROM clinical_records WHERE patient_id = $1",
                &[&patient_id.as_str()],
            )
            .await
            .map_err(db_error("Failed to load national identifier"))?;
        Ok(row.and_then(|r| r.get::<_, Option<String>>(0)))
    }

    async fn load_fields(&self, patient_id: &PatientId) -> Result<CanonicalRecord> {
        let client = self.client.get_connection().await?;
        let row = client
            .query_opt(
                "SELECT fields FROM clinical_records WHERE patient_id = $1",
                &[&patient_id.as_str()],
            )
            .await
            .map_err(db_error("Failed to load clinical record"))?;
        match row.map(|r| r.get::<_, Value>(0)) {
            Some(Value::Object(fields)) => Ok(fields.into_iter().collect()),
            Some(Value::Null) | None => Ok(CanonicalRecord::new()),
            Some(other) => Err(CarelinkError::Storage(format!(
                "clinical_records.fields for {patient_id} is not an object: {other}"
            ))),
        }
    }

    async fn commit_reconciliation(
        &self,
        patient_id: &PatientId,
        patch: &FieldPatch,
        mapping: &PatientRecordMapping,
        expected_version: u64,
    ) -> Result<()> {
        let row = MappingRow::from_domain(mapping)?;
        let patch_json = Value::Object(
            patch
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );

        let mut client = self.client.get_connection().await?;
        let tx = client
            .transaction()
            .await
            .map_err(db_error("Failed to begin reconciliation transaction"))?;

        let found = tx
            .query_opt(
                "SELECT version FROM patient_mappings WHERE patient_id = $1 FOR UPDATE",
                &[&patient_id.as_str()],
            )
            .await
            .map_err(db_error("Failed to lock mapping"))?
            .map(|r| r.get::<_, i64>(0))
            .unwrap_or(0);

        if u64::try_from(found).ok() != Some(expected_version) {
            // Dropping the transaction rolls it back
            return Err(CarelinkError::StaleMapping {
                patient_id: patient_id.to_string(),
                expected: expected_version,
                found: u64::try_from(found).unwrap_or(0),
            });
        }

        if !patch.is_empty() {
            tx.execute(
                "INSERT INTO clinical_records (patient_id, fields, updated_at) \
                 VALUES ($1, $2, now()) \
                 ON CONFLICT (patient_id) DO UPDATE \
                 SET fields = clinical_records.fields || EXCLUDED.fields, updated_at = now()",
                &[&patient_id.as_str(), &patch_json],
            )
            .await
            .map_err(db_error("Failed to apply field patch"))?;
        }

        tx.execute(
            &format!(
                "INSERT INTO patient_mappings ({MAPPING_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (patient_id) DO UPDATE SET \
                 nhs_number = EXCLUDED.nhs_number, version = EXCLUDED.version, \
                 content_hash = EXCLUDED.content_hash, sync_status = EXCLUDED.sync_status, \
                 active = EXCLUDED.active, last_synced_at = EXCLUDED.last_synced_at"
            ),
            &[
                &row.patient_id,
                &row.nhs_number,
                &row.version,
                &row.content_hash,
                &row.sync_status,
                &row.active,
                &row.created_at,
                &row.last_synced_at,
            ],
        )
        .await
        .map_err(db_error("Failed to advance mapping"))?;

        tx.commit()
            .await
            .map_err(db_error("Failed to commit reconciliation"))?;

        tracing::debug!(
            patient_id = %patient_id,
            fields = patch.len(),
            version = mapping.version,
            "Reconciliation committed"
        );
        Ok(())
    }
}

#[async_trait]
impl TransferStore for PostgresStore {
    async fn insert_if_absent(
        &self,
        request: &MedicationTransferRequest,
    ) -> Result<Option<MedicationTransferRequest>> {
        let row = TransferRow::from_domain(request)?;
        let client = self.client.get_connection().await?;
        let inserted = client
            .execute(
                &format!(
                    "INSERT INTO medication_transfers ({TRANSFER_COLUMNS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                     ON CONFLICT (idempotency_key) DO NOTHING"
                ),
                &[
                    &row.idempotency_key,
                    &row.connection_id,
                    &row.payload,
                    &row.status,
                    &row.retry_count,
                    &row.last_attempt_at,
                    &row.next_attempt_at,
                    &row.acknowledgement,
                    &row.failure_reason,
                    &row.created_at,
                ],
            )
            .await
            .map_err(db_error("Failed to insert transfer"))?;

        if inserted == 1 {
            return Ok(None);
        }
        self.load_transfer(&request.key).await
    }

    async fn load_transfer(&self, key: &IdempotencyKey) -> Result<Option<MedicationTransferRequest>> {
        let client = self.client.get_connection().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {TRANSFER_COLUMNS} FROM medication_transfers \
                     WHERE idempotency_key = $1"
                ),
                &[&key.as_str()],
            )
            .await
            .map_err(db_error("Failed to load transfer"))?;
        row.map(|r| TransferRow::from_row(&r)?.into_domain())
            .transpose()
    }

    async fn update_transfer(&self, request: &MedicationTransferRequest) -> Result<()> {
        let row = TransferRow::from_domain(request)?;
        let client = self.client.get_connection().await?;
        let updated = client
            .execute(
                "UPDATE medication_transfers SET status = $2, retry_count = $3, \
                 last_attempt_at = $4, next_attempt_at = $5, acknowledgement = $6, \
                 failure_reason = $7 WHERE idempotency_key = $1",
                &[
                    &row.idempotency_key,
                    &row.status,
                    &row.retry_count,
                    &row.last_attempt_at,
                    &row.next_attempt_at,
                    &row.acknowledgement,
                    &row.failure_reason,
                ],
            )
            .await
            .map_err(db_error("Failed to update transfer"))?;
        if updated == 0 {
            return Err(CarelinkError::NotFound(format!("transfer {}", request.key)));
        }
        Ok(())
    }

    async fn list_transfers(
        &self,
        status: Option<TransferStatus>,
    ) -> Result<Vec<MedicationTransferRequest>> {
        let client = self.client.get_connection().await?;
        let status = status.map(|s| s.to_string());
        let rows = client
            .query(
                &format!(
                    "SELECT {TRANSFER_COLUMNS} FROM medication_transfers \
                     WHERE $1::TEXT IS NULL OR status = $1 ORDER BY created_at"
                ),
                &[&status],
            )
            .await
            .map_err(db_error("Failed to list transfers"))?;
        rows.iter()
            .map(|r| TransferRow::from_row(r)?.into_domain())
            .collect()
    }
}

const UPSERT_ITEM: &str = "INSERT INTO compliance_items \
     (period, position, item_id, kind, payload, payload_hash, status, reason, submitted_at) \
     VALUES ($1, COALESCE($2, (SELECT COALESCE(MAX(position) + 1, 0) FROM compliance_items \
     WHERE period = $1)), $3, $4, $5, $6, $7, $8, $9) \
     ON CONFLICT (period, item_id) DO UPDATE SET kind = EXCLUDED.kind, \
     payload = EXCLUDED.payload, payload_hash = EXCLUDED.payload_hash, \
     status = EXCLUDED.status, reason = EXCLUDED.reason, submitted_at = EXCLUDED.submitted_at";

#[async_trait]
impl ComplianceStore for PostgresStore {
    async fn load_batch(&self, period: &ReportingPeriod) -> Result<Option<ComplianceSubmissionBatch>> {
        let client = self.client.get_connection().await?;
        let Some(batch_row) = client
            .query_opt(
                "SELECT submitted_at, created_at FROM compliance_batches WHERE period = $1",
                &[&period.as_str()],
            )
            .await
            .map_err(db_error("Failed to load compliance batch"))?
        else {
            return Ok(None);
        };

        let item_rows = client
            .query(
                "SELECT position, item_id, kind, payload, payload_hash, status, reason, \
                 submitted_at FROM compliance_items WHERE period = $1 ORDER BY position",
                &[&period.as_str()],
            )
            .await
            .map_err(db_error("Failed to load compliance items"))?;

        let items = item_rows
            .iter()
            .map(|r| ComplianceItemRow::from_row(r)?.into_domain())
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(ComplianceSubmissionBatch {
            period: period.clone(),
            items,
            submitted_at: batch_row.get("submitted_at"),
            created_at: batch_row.get("created_at"),
        }))
    }

    async fn save_batch(&self, batch: &ComplianceSubmissionBatch) -> Result<()> {
        let mut client = self.client.get_connection().await?;
        let tx = client
            .transaction()
            .await
            .map_err(db_error("Failed to begin batch transaction"))?;

        tx.execute(
            "INSERT INTO compliance_batches (period, submitted_at, created_at) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (period) DO UPDATE SET submitted_at = EXCLUDED.submitted_at",
            &[&batch.period.as_str(), &batch.submitted_at, &batch.created_at],
        )
        .await
        .map_err(db_error("Failed to save compliance batch"))?;

        for (position, item) in batch.items.iter().enumerate() {
            let row = ComplianceItemRow::from_domain(position, item)?;
            tx.execute(
                UPSERT_ITEM,
                &[
                    &batch.period.as_str(),
                    &Some(row.position),
                    &row.item_id,
                    &row.kind,
                    &row.payload,
                    &row.payload_hash,
                    &row.status,
                    &row.reason,
                    &row.submitted_at,
                ],
            )
            .await
            .map_err(db_error("Failed to save compliance item"))?;
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit compliance batch"))
    }

    async fn update_item(&self, period: &ReportingPeriod, item: &ComplianceItem) -> Result<()> {
        let row = ComplianceItemRow::from_domain(0, item)?;
        let client = self.client.get_connection().await?;
        client
            .execute(
                UPSERT_ITEM,
                &[
                    &period.as_str(),
                    &None::<i32>,
                    &row.item_id,
                    &row.kind,
                    &row.payload,
                    &row.payload_hash,
                    &row.status,
                    &row.reason,
                    &row.submitted_at,
                ],
            )
            .await
            .map_err(db_error("Failed to update compliance item"))?;
        Ok(())
    }
}

#[async_trait]
impl ConnectionStateStore for PostgresStore {
    async fn load_connection_state(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<ConnectionStateRecord>> {
        let client = self.client.get_connection().await?;
        let row = client
            .query_opt(
                "SELECT connection_id, status, reason, updated_at FROM connection_states \
                 WHERE connection_id = $1",
                &[&connection_id.as_str()],
            )
            .await
            .map_err(db_error("Failed to load connection state"))?;
        row.map(|r| ConnectionStateRow::from_row(&r)?.into_domain())
            .transpose()
    }

    async fn save_connection_state(&self, state: &ConnectionStateRecord) -> Result<()> {
        let row = ConnectionStateRow::from_domain(state)?;
        let client = self.client.get_connection().await?;
        client
            .execute(
                "INSERT INTO connection_states (connection_id, status, reason, updated_at) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (connection_id) DO UPDATE SET status = EXCLUDED.status, \
                 reason = EXCLUDED.reason, updated_at = EXCLUDED.updated_at",
                &[&row.connection_id, &row.status, &row.reason, &row.updated_at],
            )
            .await
            .map_err(db_error("Failed to save connection state"))?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for PostgresStore {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let row = AuditRow::from_domain(entry)?;
        let client = self
            .client
            .get_connection()
            .await
            .map_err(|e| CarelinkError::AuditWriteFailure(e.to_string()))?;
        client
            .execute(
                &format!(
                    "INSERT INTO audit_log ({AUDIT_COLUMNS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
                ),
                &[
                    &row.sequence,
                    &row.correlation_id,
                    &row.actor,
                    &row.action,
                    &row.target,
                    &row.outcome,
                    &row.detail,
                    &row.recorded_at,
                    &row.prev_hash,
                    &row.entry_hash,
                ],
            )
            .await
            .map_err(|e| CarelinkError::AuditWriteFailure(format!("audit_log insert: {e}")))?;
        Ok(())
    }

    async fn last_entry(&self) -> Result<Option<AuditEntry>> {
        let client = self.client.get_connection().await?;
        let row = client
            .query_opt(
                &format!("SELECT {AUDIT_COLUMNS} FROM audit_log ORDER BY sequence DESC LIMIT 1"),
                &[],
            )
            .await
            .map_err(db_error("Failed to load last audit entry"))?;
        row.map(|r| AuditRow::from_row(&r)?.into_domain())
            .transpose()
    }

    async fn entries_for(&self, correlation_id: &CorrelationId) -> Result<Vec<AuditEntry>> {
        let client = self.client.get_connection().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE correlation_id = $1 \
                     ORDER BY sequence"
                ),
                &[correlation_id.as_uuid()],
            )
            .await
            .map_err(db_error("Failed to load audit trail"))?;
        rows.iter()
            .map(|r| AuditRow::from_row(r)?.into_domain())
            .collect()
    }

    async fn all_entries(&self) -> Result<Vec<AuditEntry>> {
        let client = self.client.get_connection().await?;
        let rows = client
            .query(
                &format!("SELECT {AUDIT_COLUMNS} FROM audit_log ORDER BY sequence"),
                &[],
            )
            .await
            .map_err(db_error("Failed to load audit log"))?;
        rows.iter()
            .map(|r| AuditRow::from_row(r)?.into_domain())
            .collect()
    }
}
