//! Local patient ↔ national identifier mapping

use super::ids::{NhsNumber, PatientId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Synchronisation status of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Created but never successfully reconciled
    #[default]
    Unsynced,
    /// Local store reflects the last fetched remote content
    Synced,
    /// Reconciliation could not be applied and needs operator attention
    Conflict,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Unsynced => "unsynced",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
        };
        f.write_str(s)
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsynced" => Ok(SyncStatus::Unsynced),
            "synced" => Ok(SyncStatus::Synced),
            "conflict" => Ok(SyncStatus::Conflict),
            other => Err(format!("Unknown sync status: {other}")),
        }
    }
}

/// Which side owns a canonical field during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldOwner {
    /// The remote national record is the source of truth; remote values overwrite local ones
    External,
    /// The local clinical system is the source of truth; never overwritten by reconciliation
    Local,
}

impl fmt::Display for FieldOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldOwner::External => f.write_str("external"),
            FieldOwner::Local => f.write_str("local"),
        }
    }
}

/// Mapping between a local patient and their national identifier
///
/// Created on first reconciliation and never deleted; `active = false` marks a
/// deactivated mapping. `version` only moves forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecordMapping {
    /// Local patient identifier
    pub patient_id: PatientId,

    /// Validated national identifier
    pub nhs_number: NhsNumber,

    /// Number of reconciliations applied to the local store
    pub version: u64,

    /// Content hash of the last applied remote bundle
    pub content_hash: Option<String>,

    /// Synchronisation status
    pub sync_status: SyncStatus,

    /// False once deactivated
    pub active: bool,

    /// When the mapping was first created
    pub created_at: DateTime<Utc>,

    /// When the last reconciliation was applied
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl PatientRecordMapping {
    /// Create a fresh, unsynced mapping at version 0
    pub fn new(patient_id: PatientId, nhs_number: NhsNumber) -> Self {
        Self {
            patient_id,
            nhs_number,
            version: 0,
            content_hash: None,
            sync_status: SyncStatus::Unsynced,
            active: true,
            created_at: Utc::now(),
            last_synced_at: None,
        }
    }

    /// Whether the stored hash matches the given content hash
    pub fn is_current(&self, content_hash: &str) -> bool {
        self.sync_status == SyncStatus::Synced
            && self.content_hash.as_deref() == Some(content_hash)
    }

    /// The mapping that results from applying a bundle with `content_hash`
    pub fn advanced(&self, content_hash: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            version: self.version + 1,
            content_hash: Some(content_hash.into()),
            sync_status: SyncStatus::Synced,
            last_synced_at: Some(at),
            ..self.clone()
        }
    }
}
