//! Record reconciliation
//!
//! [`SyncOrchestrator`] fetches a patient's remote record, compares its content
//! hash with the stored mapping and applies external-owned fields through a
//! [`FieldOwnershipTable`].

mod orchestrator;
mod ownership;

pub use orchestrator::{
    PatientLocks, ReconcileOutcome, SyncFailure, SyncOrchestrator, SyncSummary,
};
pub use ownership::{FieldOwnershipTable, MergePlan};
