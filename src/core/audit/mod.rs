//! Tamper-evident audit trail
//!
//! Every externally-visible action is recorded through [`AuditRecorder`]
//! before its effect is reported as complete. Entries form a SHA-256 hash
//! chain that [`verify_chain`] can check offline.

mod recorder;

pub use recorder::{verify_chain, AuditRecorder, ChainBreak, ChainReport};
