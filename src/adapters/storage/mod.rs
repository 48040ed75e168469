//! Storage backends
//!
//! - [`traits`] - persistence seams used by the core services
//! - [`memory`] - in-process store for development and tests
//! - [`factory`] - builds the configured backend

pub mod factory;
pub mod memory;
pub mod traits;

pub use factory::{create_stores, Stores};
pub use memory::MemoryStore;
pub use traits::{
    AuditSink, ClinicalRecordStore, ComplianceStore, ConnectionStateRecord, ConnectionStateStore,
    FieldPatch, MappingStore, TransferStore,
};
