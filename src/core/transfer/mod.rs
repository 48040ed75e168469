//! Medication-transfer delivery
//!
//! ```text
//! submit ─▶ insert_if_absent ─┬─ duplicate ─▶ stored outcome
//!                             └─ new ─▶ attempt ─▶ Acked | Failed | retry task
//! ```

mod gateway;

pub use gateway::MedicationTransferGateway;
