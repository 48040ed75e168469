//! Domain models and types for Carelink.
//!
//! # Overview
//!
//! The domain layer provides:
//! - **Validated identifiers** ([`NhsNumber`], [`PatientId`], [`ConnectionId`], [`CorrelationId`])
//! - **Connection state** ([`NhsConnection`], [`AccessToken`])
//! - **Record models** ([`PatientRecordMapping`], [`ClinicalResource`], [`FhirResourceBundle`])
//! - **Outbound work** ([`MedicationTransferRequest`], [`ComplianceSubmissionBatch`])
//! - **Audit and notification events** ([`AuditEntry`], [`Notification`])
//! - **Error types** ([`CarelinkError`]) and the [`Result`] alias
//!
//! # Type Safety
//!
//! A national identifier can only be built through Modulus 11 validation, so
//! code that holds an [`NhsNumber`] never has to re-check it:
//!
//! ```rust
//! use carelink::domain::NhsNumber;
//!
//! # fn example() -> carelink::domain::Result<()> {
//! let nhs = NhsNumber::parse("9434765919")?;
//! assert_eq!(nhs.redacted(), "*******919");
//! assert!(NhsNumber::parse("9434765918").is_err());
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod compliance;
pub mod connection;
pub mod errors;
pub mod ids;
pub mod mapping;
pub mod notification;
pub mod resource;
pub mod result;
pub mod transfer;

// Re-export commonly used types for convenience
pub use audit::{AuditAction, AuditEntry, AuditEvent, AuditOutcome, GENESIS_HASH};
pub use compliance::{
    ComplianceItem, ComplianceItemInput, ComplianceSubmissionBatch, ItemStatus, JsonType,
    ReportingCadence, ReportingPeriod,
};
pub use connection::{AccessToken, ConnectionStatus, NhsConnection};
pub use errors::CarelinkError;
pub use ids::{ConnectionId, CorrelationId, NhsNumber, PatientId};
pub use mapping::{FieldOwner, PatientRecordMapping, SyncStatus};
pub use notification::{Notification, Severity};
pub use resource::{CanonicalRecord, ClinicalResource, FhirResourceBundle, ResourceType};
pub use result::Result;
pub use transfer::{
    Acknowledgement, IdempotencyKey, MedicationTransferPayload, MedicationTransferRequest,
    TransferOutcome, TransferStatus, TransferredMedication,
};
