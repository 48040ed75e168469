//! Append-only audit trail entries

use super::ids::CorrelationId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// `prev_hash` of the first entry in a chain
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    TokenExchange,
    ConnectionDegraded,
    ConnectionRevoked,
    ConnectionReconnected,
    RecordFetch,
    ReconciliationApply,
    ReconciliationConflict,
    MappingDeactivated,
    TransferAttempt,
    TransferAcknowledged,
    TransferFailed,
    ComplianceSubmit,
    ComplianceItemResult,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditAction::TokenExchange => "token_exchange",
            AuditAction::ConnectionDegraded => "connection_degraded",
            AuditAction::ConnectionRevoked => "connection_revoked",
            AuditAction::ConnectionReconnected => "connection_reconnected",
            AuditAction::RecordFetch => "record_fetch",
            AuditAction::ReconciliationApply => "reconciliation_apply",
            AuditAction::ReconciliationConflict => "reconciliation_conflict",
            AuditAction::MappingDeactivated => "mapping_deactivated",
            AuditAction::TransferAttempt => "transfer_attempt",
            AuditAction::TransferAcknowledged => "transfer_acknowledged",
            AuditAction::TransferFailed => "transfer_failed",
            AuditAction::ComplianceSubmit => "compliance_submit",
            AuditAction::ComplianceItemResult => "compliance_item_result",
        };
        f.write_str(s)
    }
}

/// Result of the audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Intent recorded before a mutating external call
    Attempted,
    Succeeded,
    Failed,
    /// Nothing to do (e.g. reconciliation with unchanged content)
    Skipped,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditOutcome::Attempted => "attempted",
            AuditOutcome::Succeeded => "succeeded",
            AuditOutcome::Failed => "failed",
            AuditOutcome::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Fields supplied by the caller; the recorder adds timestamp and hashes
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub correlation_id: CorrelationId,
    pub action: AuditAction,
    /// Entity the action applied to, e.g. `patient:res-1` or `transfer:<key>`
    pub target: String,
    pub outcome: AuditOutcome,
    pub detail: Value,
}

impl AuditEvent {
    pub fn new(
        correlation_id: CorrelationId,
        action: AuditAction,
        target: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            correlation_id,
            action,
            target: target.into(),
            outcome,
            detail: Value::Null,
        }
    }

    /// Attach structured detail
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// A persisted audit entry
///
/// Entries form a hash chain: `entry_hash` covers every other field including
/// `prev_hash`, so rewriting or dropping an entry breaks verification of every
/// entry after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub correlation_id: CorrelationId,
    pub actor: String,
    pub action: AuditAction,
    pub target: String,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub detail: Value,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub entry_hash: String,
}

impl AuditEntry {
    /// The entry as hashed: every field except `entry_hash`
    pub fn hash_input(&self) -> Value {
        serde_json::json!({
            "sequence": self.sequence,
            "correlation_id": self.correlation_id,
            "actor": self.actor,
            "action": self.action,
            "target": self.target,
            "outcome": self.outcome,
            "detail": self.detail,
            "timestamp": self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            "prev_hash": self.prev_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_display_matches_serde() {
        assert_eq!(AuditAction::TransferAttempt.to_string(), "transfer_attempt");
        assert_eq!(
            serde_json::to_value(AuditAction::ComplianceItemResult).unwrap(),
            "compliance_item_result"
        );
    }

    #[test]
    fn test_hash_input_excludes_entry_hash() {
        let entry = AuditEntry {
            sequence: 1,
            correlation_id: CorrelationId::new(),
            actor: "carelink".into(),
            action: AuditAction::RecordFetch,
            target: "patient:res-1".into(),
            outcome: AuditOutcome::Succeeded,
            detail: Value::Null,
            timestamp: Utc::now(),
            prev_hash: GENESIS_HASH.into(),
            entry_hash: "abc".into(),
        };
        let input = entry.hash_input();
        assert!(input.get("entry_hash").is_none());
        assert_eq!(input["prev_hash"], GENESIS_HASH);
    }
}
