//! Medication-transfer requests and their delivery state machine
//!
//! ```text
//! Pending ──send──▶ Sent ──ack──▶ Acked
//!    ▲                │
//!    └──retryable─────┘
//! Pending ──budget exhausted──▶ FailedTerminal
//! Sent ──rejected──▶ Failed      Pending ──cancelled──▶ Failed
//! ```

use super::errors::CarelinkError;
use super::ids::{ConnectionId, NhsNumber};
use super::result::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Key collapsing logically identical transfers to one delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derive the key from patient, medication-list version and time bucket
    ///
    /// Two submissions for the same patient and list version whose timestamps fall
    /// in the same bucket produce the same key.
    pub fn derive(
        patient: &NhsNumber,
        medication_list_version: &str,
        at: DateTime<Utc>,
        bucket: Duration,
    ) -> Self {
        let bucket_secs = bucket.num_seconds().max(1);
        let ts = at.timestamp();
        let bucket_start = ts - ts.rem_euclid(bucket_secs);

        let mut hasher = Sha256::new();
        hasher.update(patient.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(medication_list_version.as_bytes());
        hasher.update(b"|");
        hasher.update(bucket_start.to_string().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wrap an existing key (e.g. loaded from storage)
    pub fn from_existing(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.len() != 64 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CarelinkError::Validation(format!(
                "Invalid idempotency key: {key}"
            )));
        }
        Ok(Self(key))
    }

    /// Returns the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery status of a transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Sent,
    Acked,
    /// Rejected by the receiver or cancelled; needs operator action
    Failed,
    /// Retry budget exhausted; needs operator action
    FailedTerminal,
}

impl TransferStatus {
    /// No further automatic processing happens from this status
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TransferStatus::Acked | TransferStatus::Failed | TransferStatus::FailedTerminal
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Sent => "sent",
            TransferStatus::Acked => "acked",
            TransferStatus::Failed => "failed",
            TransferStatus::FailedTerminal => "failed_terminal",
        };
        f.write_str(s)
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransferStatus::Pending),
            "sent" => Ok(TransferStatus::Sent),
            "acked" => Ok(TransferStatus::Acked),
            "failed" => Ok(TransferStatus::Failed),
            "failed_terminal" => Ok(TransferStatus::FailedTerminal),
            other => Err(format!("Unknown transfer status: {other}")),
        }
    }
}

/// One medication line in a transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferredMedication {
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub dosage: Option<String>,
    #[serde(default)]
    pub quantity: Option<String>,
}

/// Structured medication-transfer payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationTransferPayload {
    pub patient: NhsNumber,
    pub medication_list_version: String,
    pub source_organization: String,
    pub destination_organization: String,
    pub medications: Vec<TransferredMedication>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl MedicationTransferPayload {
    /// Local structural checks before anything is queued
    pub fn validate(&self) -> Result<()> {
        if self.medication_list_version.trim().is_empty() {
            return Err(CarelinkError::Validation(
                "medication_list_version cannot be empty".to_string(),
            ));
        }
        if self.destination_organization.trim().is_empty() {
            return Err(CarelinkError::Validation(
                "destination_organization cannot be empty".to_string(),
            ));
        }
        if self.medications.is_empty() {
            return Err(CarelinkError::Validation(
                "a transfer must list at least one medication".to_string(),
            ));
        }
        if let Some(m) = self.medications.iter().find(|m| m.name.trim().is_empty()) {
            return Err(CarelinkError::Validation(format!(
                "medication with empty name (code {:?})",
                m.code
            )));
        }
        Ok(())
    }
}

/// Receiver acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub acknowledgement_id: String,
    pub received_at: DateTime<Utc>,
}

/// A transfer request and its delivery state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationTransferRequest {
    pub key: IdempotencyKey,
    pub connection_id: ConnectionId,
    pub payload: MedicationTransferPayload,
    pub status: TransferStatus,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub acknowledgement: Option<Acknowledgement>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MedicationTransferRequest {
    /// New Pending request
    pub fn new(
        key: IdempotencyKey,
        connection_id: ConnectionId,
        payload: MedicationTransferPayload,
    ) -> Self {
        Self {
            key,
            connection_id,
            payload,
            status: TransferStatus::Pending,
            retry_count: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            acknowledgement: None,
            failure_reason: None,
            created_at: Utc::now(),
        }
    }

    fn transition(&mut self, from: &[TransferStatus], to: TransferStatus) -> Result<()> {
        if !from.contains(&self.status) {
            return Err(CarelinkError::Validation(format!(
                "illegal transfer transition {} -> {} for {}",
                self.status, to, self.key
            )));
        }
        self.status = to;
        Ok(())
    }

    /// Pending → Sent
    pub fn mark_sent(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(&[TransferStatus::Pending], TransferStatus::Sent)?;
        self.last_attempt_at = Some(at);
        self.next_attempt_at = None;
        Ok(())
    }

    /// Sent → Acked
    pub fn mark_acked(&mut self, ack: Acknowledgement) -> Result<()> {
        self.transition(&[TransferStatus::Sent], TransferStatus::Acked)?;
        self.acknowledgement = Some(ack);
        self.failure_reason = None;
        Ok(())
    }

    /// Sent → Pending after a retryable failure
    pub fn mark_retry(&mut self, reason: impl Into<String>, next_at: DateTime<Utc>) -> Result<()> {
        self.transition(&[TransferStatus::Sent], TransferStatus::Pending)?;
        self.retry_count += 1;
        self.failure_reason = Some(reason.into());
        self.next_attempt_at = Some(next_at);
        Ok(())
    }

    /// Pending → FailedTerminal when the retry budget is exhausted
    pub fn mark_failed_terminal(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(&[TransferStatus::Pending], TransferStatus::FailedTerminal)?;
        self.failure_reason = Some(reason.into());
        self.next_attempt_at = None;
        Ok(())
    }

    /// Sent → Failed (receiver rejection) or Pending → Failed (cancellation)
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(
            &[TransferStatus::Sent, TransferStatus::Pending],
            TransferStatus::Failed,
        )?;
        self.failure_reason = Some(reason.into());
        self.next_attempt_at = None;
        Ok(())
    }

    /// Snapshot returned to callers
    pub fn outcome(&self, duplicate: bool) -> TransferOutcome {
        TransferOutcome {
            key: self.key.clone(),
            status: self.status,
            retry_count: self.retry_count,
            acknowledgement: self.acknowledgement.clone(),
            failure_reason: self.failure_reason.clone(),
            duplicate,
        }
    }
}

/// Result of a submission as seen by the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferOutcome {
    pub key: IdempotencyKey,
    pub status: TransferStatus,
    pub retry_count: u32,
    pub acknowledgement: Option<Acknowledgement>,
    pub failure_reason: Option<String>,
    /// True when an existing request with the same key answered this submission
    pub duplicate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn nhs() -> NhsNumber {
        NhsNumber::parse("9434765919").unwrap()
    }

    pub(crate) fn payload() -> MedicationTransferPayload {
        MedicationTransferPayload {
            patient: nhs(),
            medication_list_version: "v7".to_string(),
            source_organization: "A81001".to_string(),
            destination_organization: "FA123".to_string(),
            medications: vec![TransferredMedication {
                name: "Amlodipine 5mg tablets".to_string(),
                code: Some("319283006".to_string()),
                dosage: Some("One daily".to_string()),
                quantity: Some("28".to_string()),
            }],
            notes: None,
        }
    }

    fn request() -> MedicationTransferRequest {
        let key = IdempotencyKey::derive(&nhs(), "v7", Utc::now(), Duration::hours(1));
        MedicationTransferRequest::new(key, ConnectionId::new("practice-a").unwrap(), payload())
    }

    #[test]
    fn test_key_same_bucket_collapses() {
        let a = Utc.with_ymd_and_hms(2026, 10, 19, 9, 5, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 10, 19, 9, 55, 0).unwrap();
        let c = Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap();
        let bucket = Duration::hours(1);

        assert_eq!(
            IdempotencyKey::derive(&nhs(), "v7", a, bucket),
            IdempotencyKey::derive(&nhs(), "v7", b, bucket)
        );
        assert_ne!(
            IdempotencyKey::derive(&nhs(), "v7", a, bucket),
            IdempotencyKey::derive(&nhs(), "v7", c, bucket)
        );
        assert_ne!(
            IdempotencyKey::derive(&nhs(), "v7", a, bucket),
            IdempotencyKey::derive(&nhs(), "v8", a, bucket)
        );
    }

    #[test]
    fn test_key_from_existing_validates() {
        let key = IdempotencyKey::derive(&nhs(), "v1", Utc::now(), Duration::hours(1));
        assert_eq!(
            IdempotencyKey::from_existing(key.as_str()).unwrap(),
            key
        );
        assert!(IdempotencyKey::from_existing("short").is_err());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut req = request();
        req.mark_sent(Utc::now()).unwrap();
        req.mark_acked(Acknowledgement {
            acknowledgement_id: "ack-1".into(),
            received_at: Utc::now(),
        })
        .unwrap();
        assert_eq!(req.status, TransferStatus::Acked);
        assert!(req.status.is_final());
    }

    #[test]
    fn test_retry_loop_then_terminal() {
        let mut req = request();
        for attempt in 1..=3 {
            req.mark_sent(Utc::now()).unwrap();
            req.mark_retry("503", Utc::now()).unwrap();
            assert_eq!(req.retry_count, attempt);
            assert_eq!(req.status, TransferStatus::Pending);
        }
        req.mark_failed_terminal("retry budget exhausted").unwrap();
        assert_eq!(req.status, TransferStatus::FailedTerminal);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut req = request();
        assert!(req
            .mark_acked(Acknowledgement {
                acknowledgement_id: "x".into(),
                received_at: Utc::now()
            })
            .is_err());
        req.mark_sent(Utc::now()).unwrap();
        assert!(req.mark_sent(Utc::now()).is_err());
        assert!(req.mark_failed_terminal("no").is_err());
    }

    #[test]
    fn test_payload_validation() {
        assert!(payload().validate().is_ok());
        let mut p = payload();
        p.medications.clear();
        assert!(p.validate().is_err());
    }
}
