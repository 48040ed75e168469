//! Clinical-record protocol (FHIR R4)
//!
//! - [`client`] - paginated Patient search with retry classification
//! - [`mapping`] - validated resources to canonical record fields

pub mod client;
pub mod mapping;

pub use client::{ClinicalRecordSource, FhirClient};
pub use mapping::{build_bundle, CANONICAL_FIELDS};
