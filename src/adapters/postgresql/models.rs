//! Row models for the PostgreSQL store
//!
//! Each struct mirrors one table. Conversions to and from domain types live
//! here so they can be tested without a server.

use crate::adapters::storage::ConnectionStateRecord;
use crate::domain::{
    Acknowledgement, AuditEntry, CarelinkError, ComplianceItem, ConnectionId, CorrelationId,
    IdempotencyKey, MedicationTransferPayload, MedicationTransferRequest, NhsNumber, PatientId,
    PatientRecordMapping, Result,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_postgres::Row;
use uuid::Uuid;

/// Store an enum by its serde name
pub(crate) fn enum_to_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        Value::String(s) => Ok(s),
        other => Err(CarelinkError::Serialization(format!(
            "expected a string-valued enum, got {other}"
        ))),
    }
}

pub(crate) fn enum_from_text<T: DeserializeOwned>(column: &str, text: &str) -> Result<T> {
    serde_json::from_value(Value::String(text.to_string())).map_err(|e| {
        CarelinkError::Serialization(format!("Unexpected value '{text}' in column {column}: {e}"))
    })
}

fn to_i64(column: &str, value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| CarelinkError::Storage(format!("{column} out of range: {value}")))
}

fn to_u64(column: &str, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| CarelinkError::Storage(format!("{column} is negative: {value}")))
}

fn get<'a, T: tokio_postgres::types::FromSql<'a>>(row: &'a Row, column: &str) -> Result<T> {
    row.try_get(column)
        .map_err(|e| CarelinkError::Storage(format!("Failed to read column {column}: {e}")))
}

/// `patient_mappings`
#[derive(Debug, Clone, PartialEq)]
pub struct MappingRow {
    pub patient_id: String,
    pub nhs_number: String,
    pub version: i64,
    pub content_hash: Option<String>,
    pub sync_status: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl MappingRow {
    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            patient_id: get(row, "patient_id")?,
            nhs_number: get(row, "nhs_number")?,
            version: get(row, "version")?,
            content_hash: get(row, "content_hash")?,
            sync_status: get(row, "sync_status")?,
            active: get(row, "active")?,
            created_at: get(row, "created_at")?,
            last_synced_at: get(row, "last_synced_at")?,
        })
    }

    pub fn from_domain(mapping: &PatientRecordMapping) -> Result<Self> {
        Ok(Self {
            patient_id: mapping.patient_id.to_string(),
            nhs_number: mapping.nhs_number.as_str().to_string(),
            version: to_i64("version", mapping.version)?,
            content_hash: mapping.content_hash.clone(),
            sync_status: mapping.sync_status.to_string(),
            active: mapping.active,
            created_at: mapping.created_at,
            last_synced_at: mapping.last_synced_at,
        })
    }

    pub fn into_domain(self) -> Result<PatientRecordMapping> {
        Ok(PatientRecordMapping {
            patient_id: PatientId::new(self.patient_id)?,
            // A stored identifier that no longer validates is a data error
            nhs_number: NhsNumber::parse(self.nhs_number.trim())?,
            version: to_u64("version", self.version)?,
            content_hash: self.content_hash.map(|h| h.trim().to_string()),
            sync_status: self.sync_status.parse().map_err(CarelinkError::Storage)?,
            active: self.active,
            created_at: self.created_at,
            last_synced_at: self.last_synced_at,
        })
    }
}

/// `medication_transfers`
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRow {
    pub idempotency_key: String,
    pub connection_id: String,
    pub payload: Value,
    pub status: String,
    pub retry_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub acknowledgement: Option<Value>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransferRow {
    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            idempotency_key: get(row, "idempotency_key")?,
            connection_id: get(row, "connection_id")?,
            payload: get(row, "payload")?,
            status: get(row, "status")?,
            retry_count: get(row, "retry_count")?,
            last_attempt_at: get(row, "last_attempt_at")?,
            next_attempt_at: get(row, "next_attempt_at")?,
            acknowledgement: get(row, "acknowledgement")?,
            failure_reason: get(row, "failure_reason")?,
            created_at: get(row, "created_at")?,
        })
    }

    pub fn from_domain(request: &MedicationTransferRequest) -> Result<Self> {
        Ok(Self {
            idempotency_key: request.key.as_str().to_string(),
            connection_id: request.connection_id.to_string(),
            payload: serde_json::to_value(&request.payload)?,
            status: request.status.to_string(),
            retry_count: i32::try_from(request.retry_count).map_err(|_| {
                CarelinkError::Storage(format!("retry_count out of range: {}", request.retry_count))
            })?,
            last_attempt_at: request.last_attempt_at,
            next_attempt_at: request.next_attempt_at,
            acknowledgement: request
                .acknowledgement
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
            failure_reason: request.failure_reason.clone(),
            created_at: request.created_at,
        })
    }

    pub fn into_domain(self) -> Result<MedicationTransferRequest> {
        let payload: MedicationTransferPayload = serde_json::from_value(self.payload)?;
        let acknowledgement: Option<Acknowledgement> = self
            .acknowledgement
            .map(serde_json::from_value)
            .transpose()?;
        Ok(MedicationTransferRequest {
            key: IdempotencyKey::from_existing(self.idempotency_key.trim())?,
            connection_id: ConnectionId::new(self.connection_id)?,
            payload,
            status: self.status.parse().map_err(CarelinkError::Storage)?,
            retry_count: u32::try_from(self.retry_count).map_err(|_| {
                CarelinkError::Storage(format!("retry_count is negative: {}", self.retry_count))
            })?,
            last_attempt_at: self.last_attempt_at,
            next_attempt_at: self.next_attempt_at,
            acknowledgement,
            failure_reason: self.failure_reason,
            created_at: self.created_at,
        })
    }
}

/// `compliance_items`
#[derive(Debug, Clone, PartialEq)]
pub struct ComplianceItemRow {
    pub position: i32,
    pub item_id: String,
    pub kind: String,
    pub payload: Value,
    pub payload_hash: String,
    pub status: String,
    pub reason: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl ComplianceItemRow {
    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            position: get(row, "position")?,
            item_id: get(row, "item_id")?,
            kind: get(row, "kind")?,
            payload: get(row, "payload")?,
            payload_hash: get(row, "payload_hash")?,
            status: get(row, "status")?,
            reason: get(row, "reason")?,
            submitted_at: get(row, "submitted_at")?,
        })
    }

    pub fn from_domain(position: usize, item: &ComplianceItem) -> Result<Self> {
        Ok(Self {
            position: i32::try_from(position)
                .map_err(|_| CarelinkError::Storage(format!("position out of range: {position}")))?,
            item_id: item.item_id.clone(),
            kind: item.kind.clone(),
            payload: item.payload.clone(),
            payload_hash: item.payload_hash.clone(),
            status: enum_to_text(&item.status)?,
            reason: item.reason.clone(),
            submitted_at: item.submitted_at,
        })
    }

    pub fn into_domain(self) -> Result<ComplianceItem> {
        Ok(ComplianceItem {
            item_id: self.item_id,
            kind: self.kind,
            payload: self.payload,
            payload_hash: self.payload_hash.trim().to_string(),
            status: enum_from_text("status", &self.status)?,
            reason: self.reason,
            submitted_at: self.submitted_at,
        })
    }
}

/// `connection_states`
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateRow {
    pub connection_id: String,
    pub status: String,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionStateRow {
    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            connection_id: get(row, "connection_id")?,
            status: get(row, "status")?,
            reason: get(row, "reason")?,
            updated_at: get(row, "updated_at")?,
        })
    }

    pub fn from_domain(record: &ConnectionStateRecord) -> Result<Self> {
        Ok(Self {
            connection_id: record.connection_id.to_string(),
            status: enum_to_text(&record.status)?,
            reason: record.reason.clone(),
            updated_at: record.updated_at,
        })
    }

    pub fn into_domain(self) -> Result<ConnectionStateRecord> {
        Ok(ConnectionStateRecord {
            connection_id: ConnectionId::new(self.connection_id)?,
            status: enum_from_text("status", &self.status)?,
            reason: self.reason,
            updated_at: self.updated_at,
        })
    }
}

/// `audit_log`
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRow {
    pub sequence: i64,
    pub correlation_id: Uuid,
    pub actor: String,
    pub action: String,
    pub target: String,
    pub outcome: String,
    pub detail: Value,
    pub recorded_at: DateTime<Utc>,
    pub prev_hash: String,
    pub entry_hash: String,
}

impl AuditRow {
    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            sequence: get(row, "sequence")?,
            correlation_id: get(row, "correlation_id")?,
            actor: get(row, "actor")?,
            action: get(row, "action")?,
            target: get(row, "target")?,
            outcome: get(row, "outcome")?,
            detail: get(row, "detail")?,
            recorded_at: get(row, "recorded_at")?,
            prev_hash: get(row, "prev_hash")?,
            entry_hash: get(row, "entry_hash")?,
        })
    }

    pub fn from_domain(entry: &AuditEntry) -> Result<Self> {
        Ok(Self {
            sequence: to_i64("sequence", entry.sequence)?,
            correlation_id: *entry.correlation_id.as_uuid(),
            actor: entry.actor.clone(),
            action: enum_to_text(&entry.action)?,
            target: entry.target.clone(),
            outcome: enum_to_text(&entry.outcome)?,
            detail: entry.detail.clone(),
            recorded_at: entry.timestamp,
            prev_hash: entry.prev_hash.clone(),
            entry_hash: entry.entry_hash.clone(),
        })
    }

    pub fn into_domain(self) -> Result<AuditEntry> {
        Ok(AuditEntry {
            sequence: to_u64("sequence", self.sequence)?,
            correlation_id: CorrelationId::from(self.correlation_id),
            actor: self.actor,
            action: enum_from_text("action", &self.action)?,
            target: self.target,
            outcome: enum_from_text("outcome", &self.outcome)?,
            detail: self.detail,
            timestamp: self.recorded_at,
            prev_hash: self.prev_hash.trim().to_string(),
            entry_hash: self.entry_hash.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AuditAction, AuditOutcome, ConnectionStatus, ItemStatus, SyncStatus, TransferStatus,
        GENESIS_HASH,
    };

    #[test]
    fn test_mapping_row_conversion() {
        let mut mapping = PatientRecordMapping::new(
            PatientId::new("p-1").unwrap(),
            NhsNumber::parse("9434765919").unwrap(),
        );
        mapping = mapping.advanced("a".repeat(64), Utc::now());

        let row = MappingRow::from_domain(&mapping).unwrap();
        assert_eq!(row.sync_status, "synced");
        assert_eq!(row.version, 1);

        let back = row.into_domain().unwrap();
        assert_eq!(back, mapping);
        assert_eq!(back.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_mapping_row_rejects_invalid_identifier() {
        let row = MappingRow {
            patient_id: "p-1".into(),
            nhs_number: "9434765918".into(),
            version: 0,
            content_hash: None,
            sync_status: "unsynced".into(),
            active: true,
            created_at: Utc::now(),
            last_synced_at: None,
        };
        assert!(matches!(
            row.into_domain(),
            Err(CarelinkError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_enum_text_uses_serde_names() {
        assert_eq!(enum_to_text(&ItemStatus::Submitted).unwrap(), "submitted");
        assert_eq!(enum_to_text(&ConnectionStatus::Degraded).unwrap(), "degraded");
        assert_eq!(
            enum_to_text(&AuditAction::ReconciliationApply).unwrap(),
            "reconciliation_apply"
        );
        let status: TransferStatus = enum_from_text("status", "failed_terminal").unwrap();
        assert_eq!(status, TransferStatus::FailedTerminal);
        assert!(enum_from_text::<ItemStatus>("status", "bogus").is_err());
    }

    #[test]
    fn test_audit_row_conversion_trims_char_padding() {
        let entry = AuditEntry {
            sequence: 7,
            correlation_id: CorrelationId::new(),
            actor: "carelink".into(),
            action: AuditAction::ComplianceSubmit,
            target: "period:2026-10".into(),
            outcome: AuditOutcome::Succeeded,
            detail: serde_json::json!({"items": 4}),
            timestamp: Utc::now(),
            prev_hash: GENESIS_HASH.into(),
            entry_hash: "f".repeat(64),
        };
        let mut row = AuditRow::from_domain(&entry).unwrap();
        row.entry_hash.push(' ');
        assert_eq!(row.into_domain().unwrap(), entry);
    }
}
