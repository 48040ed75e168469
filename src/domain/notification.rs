//! Operator-facing events
//!
//! Failures that need a human (degraded connections, conflicts, terminal
//! transfer failures) are surfaced as [`Notification`]s rather than only logged.

use super::ids::{ConnectionId, PatientId};
use super::transfer::IdempotencyKey;
use serde::Serialize;
use std::fmt;

/// Something an operator should see
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    ConnectionDegraded {
        connection_id: ConnectionId,
        reason: String,
    },
    ConnectionRevoked {
        connection_id: ConnectionId,
        reason: String,
    },
    PatientNotFound {
        patient_id: PatientId,
    },
    ReconciliationConflict {
        patient_id: PatientId,
        reason: String,
    },
    AmbiguousFieldOwnership {
        patient_id: PatientId,
        fields: Vec<String>,
    },
    TransferFailed {
        key: IdempotencyKey,
        reason: String,
    },
    TransferFailedTerminal {
        key: IdempotencyKey,
        attempts: u32,
        reason: String,
    },
    ComplianceItemInvalid {
        period: String,
        item_id: String,
        reason: String,
    },
    ComplianceItemRejected {
        period: String,
        item_id: String,
        reason: String,
    },
}

/// Operator urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Notification {
    pub fn severity(&self) -> Severity {
        match self {
            Notification::ConnectionDegraded { .. }
            | Notification::TransferFailedTerminal { .. } => Severity::Critical,
            Notification::ConnectionRevoked { .. }
            | Notification::AmbiguousFieldOwnership { .. }
            | Notification::ComplianceItemInvalid { .. } => Severity::Info,
            _ => Severity::Warning,
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::ConnectionDegraded {
                connection_id,
                reason,
            } => write!(f, "connection {connection_id} degraded: {reason}"),
            Notification::ConnectionRevoked {
                connection_id,
                reason,
            } => write!(f, "connection {connection_id} revoked: {reason}"),
            Notification::PatientNotFound { patient_id } => {
                write!(f, "no remote record for patient {patient_id}")
            }
            Notification::ReconciliationConflict { patient_id, reason } => {
                write!(f, "reconciliation conflict for patient {patient_id}: {reason}")
            }
            Notification::AmbiguousFieldOwnership { patient_id, fields } => write!(
                f,
                "fields with unknown ownership kept local for patient {patient_id}: {}",
                fields.join(", ")
            ),
            Notification::TransferFailed { key, reason } => {
                write!(f, "transfer {key} failed: {reason}")
            }
            Notification::TransferFailedTerminal {
                key,
                attempts,
                reason,
            } => write!(
                f,
                "transfer {key} gave up after {attempts} attempt(s): {reason}"
            ),
            Notification::ComplianceItemInvalid {
                period,
                item_id,
                reason,
            } => write!(f, "compliance item {item_id} ({period}) invalid: {reason}"),
            Notification::ComplianceItemRejected {
                period,
                item_id,
                reason,
            } => write!(f, "compliance item {item_id} ({period}) rejected: {reason}"),
        }
    }
}
