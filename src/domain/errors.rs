//! Domain error types
//!
//! This module defines the error taxonomy for Carelink. Every failure that can
//! cross a protocol boundary is classified here, and the classification drives
//! retry decisions, audit outcomes and operator notifications.
//! Third-party error types (HTTP client, database driver) are converted at the
//! adapter boundary and never exposed through this enum.

use std::time::Duration;
use thiserror::Error;

/// Main Carelink error type
#[derive(Debug, Error)]
pub enum CarelinkError {
    /// National identifier failed format or checksum validation
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Credentials were rejected; the connection is degraded until an operator reconnects
    #[error("Authentication rejected for connection {connection_id}: {message}")]
    TerminalAuth {
        connection_id: String,
        message: String,
    },

    /// Token exchange failed for a transient reason (network, 5xx, timeout)
    #[error("Authentication temporarily unavailable for connection {connection_id}: {message}")]
    RetryableAuth {
        connection_id: String,
        message: String,
    },

    /// Network failure, timeout or 5xx from a remote endpoint
    #[error("Transient network error calling {target}: {message}")]
    TransientNetwork { target: String, message: String },

    /// Remote endpoint answered 429
    #[error("Rate limited by {target} (retry after {retry_after:?})")]
    RateLimited {
        target: String,
        retry_after: Option<Duration>,
    },

    /// Non-retryable 4xx from the remote protocol
    #[error("Request to {target} rejected with status {status}: {message}")]
    Rejected {
        target: String,
        status: u16,
        message: String,
    },

    /// No matching resource exists
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote payload did not match the expected schema
    #[error("Mapping error for {resource}: {message}")]
    Mapping { resource: String, message: String },

    /// Remote-side validation failure on a specific transfer or compliance item
    #[error("Submission of {item} rejected: {reason}")]
    SubmissionRejected { item: String, reason: String },

    /// The audit log could not be written; the triggering operation fails closed
    #[error("Audit write failed: {0}")]
    AuditWriteFailure(String),

    /// Connection is degraded or revoked and cannot issue tokens
    #[error("Connection {connection_id} is unavailable ({status})")]
    ConnectionUnavailable {
        connection_id: String,
        status: String,
    },

    /// Mapping version moved underneath a reconciliation commit
    #[error("Stale mapping for patient {patient_id}: expected version {expected}, found {found}")]
    StaleMapping {
        patient_id: String,
        expected: u64,
        found: u64,
    },

    /// A scheduled operation was cancelled (connection revoked, shutdown)
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// Local validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl CarelinkError {
    /// Whether the failure is transient and may be retried with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CarelinkError::RetryableAuth { .. }
                | CarelinkError::TransientNetwork { .. }
                | CarelinkError::RateLimited { .. }
        )
    }

    /// Server-supplied retry hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CarelinkError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short, stable label used as the audit outcome of a failed call
    pub fn kind(&self) -> &'static str {
        match self {
            CarelinkError::InvalidIdentifier(_) => "invalid_identifier",
            CarelinkError::TerminalAuth { .. } => "terminal_auth_error",
            CarelinkError::RetryableAuth { .. } => "retryable_auth_error",
            CarelinkError::TransientNetwork { .. } => "transient_network_error",
            CarelinkError::RateLimited { .. } => "rate_limited",
            CarelinkError::Rejected { .. } => "rejected",
            CarelinkError::NotFound(_) => "not_found",
            CarelinkError::Mapping { .. } => "mapping_error",
            CarelinkError::SubmissionRejected { .. } => "submission_rejected",
            CarelinkError::AuditWriteFailure(_) => "audit_write_failure",
            CarelinkError::ConnectionUnavailable { .. } => "connection_unavailable",
            CarelinkError::StaleMapping { .. } => "stale_mapping",
            CarelinkError::Cancelled(_) => "cancelled",
            CarelinkError::Configuration(_) => "configuration_error",
            CarelinkError::Storage(_) => "storage_error",
            CarelinkError::Serialization(_) => "serialization_error",
            CarelinkError::Io(_) => "io_error",
            CarelinkError::Validation(_) => "validation_error",
        }
    }

    /// Build a mapping error for a resource
    pub fn mapping(resource: impl Into<String>, message: impl Into<String>) -> Self {
        CarelinkError::Mapping {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for CarelinkError {
    fn from(err: std::io::Error) -> Self {
        CarelinkError::Io(err.to_string())
    }
}

// Conversion from serde_json::Error
impl From<serde_json::Error> for CarelinkError {
    fn from(err: serde_json::Error) -> Self {
        CarelinkError::Serialization(err.to_string())
    }
}

// Conversion from toml parse errors
impl From<toml::de::Error> for CarelinkError {
    fn from(err: toml::de::Error) -> Self {
        CarelinkError::Configuration(format!("TOML parse error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CarelinkError::Configuration("Invalid config".to_string());
        assert_eq!(err.to_string(), "Configuration error: Invalid config");

        let err = CarelinkError::TerminalAuth {
            connection_id: "practice-a".to_string(),
            message: "invalid_client".to_string(),
        };
        assert!(err.to_string().contains("practice-a"));
    }

    #[test]
    fn test_retry_classification() {
        assert!(CarelinkError::TransientNetwork {
            target: "fhir".into(),
            message: "timeout".into()
        }
        .is_retryable());
        assert!(CarelinkError::RetryableAuth {
            connection_id: "c".into(),
            message: "503".into()
        }
        .is_retryable());
        assert!(CarelinkError::RateLimited {
            target: "fhir".into(),
            retry_after: None
        }
        .is_retryable());

        assert!(!CarelinkError::InvalidIdentifier("123".into()).is_retryable());
        assert!(!CarelinkError::Rejected {
            target: "fhir".into(),
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!CarelinkError::TerminalAuth {
            connection_id: "c".into(),
            message: "denied".into()
        }
        .is_retryable());
        assert!(!CarelinkError::AuditWriteFailure("disk full".into()).is_retryable());
    }

    #[test]
    fn test_retry_after_only_for_rate_limit() {
        let err = CarelinkError::RateLimited {
            target: "fhir".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(CarelinkError::NotFound("x".into()).retry_after(), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: CarelinkError = io_err.into();
        assert!(matches!(err, CarelinkError::Io(_)));
        assert_eq!(err.kind(), "io_error");
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: CarelinkError = json_err.into();
        assert!(matches!(err, CarelinkError::Serialization(_)));
    }

    #[test]
    fn test_toml_error_conversion() {
        let toml_err = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
        let err: CarelinkError = toml_err.into();
        assert!(matches!(err, CarelinkError::Configuration(_)));
        assert!(err.to_string().contains("TOML parse error"));
    }
}
