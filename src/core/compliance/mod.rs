//! Regulatory compliance submissions
//!
//! A batch per reporting period; each item is validated on its own and
//! carries its own status, so one bad item never blocks the rest.

mod schema;
mod submitter;

pub use schema::ItemValidator;
pub use submitter::{ComplianceRunSummary, ComplianceSubmitter};
