//! Storage backend factory
//!
//! Builds every store from `[storage]`. With the in-memory backend the audit
//! log still goes to the JSONL file named by `[audit] path`, so audit entries
//! survive a restart even in development.

use super::memory::MemoryStore;
use super::traits::{
    AuditSink, ClinicalRecordStore, ComplianceStore, ConnectionStateStore, MappingStore,
    TransferStore,
};
use crate::adapters::audit_file::FileAuditLog;
use crate::adapters::postgresql::{PostgreSQLClient, PostgresStore};
use crate::config::{CarelinkConfig, StorageBackend};
use crate::domain::{CarelinkError, Result};
use std::sync::Arc;

/// One handle per persistence concern
#[derive(Clone)]
pub struct Stores {
    pub mappings: Arc<dyn MappingStore>,
    pub records: Arc<dyn ClinicalRecordStore>,
    pub transfers: Arc<dyn TransferStore>,
    pub compliance: Arc<dyn ComplianceStore>,
    pub connections: Arc<dyn ConnectionStateStore>,
    pub audit: Arc<dyn AuditSink>,
}

impl Stores {
    /// Every concern served by one in-memory store
    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            mappings: store.clone(),
            records: store.clone(),
            transfers: store.clone(),
            compliance: store.clone(),
            connections: store.clone(),
            audit: store,
        }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }
}

/// Create the stores selected by `config.storage.backend`
///
/// # Errors
///
/// Returns an error if the audit file cannot be opened, or if the PostgreSQL
/// pool cannot be built or the schema migration fails.
pub async fn create_stores(config: &CarelinkConfig) -> Result<Stores> {
    match config.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!(
                audit_path = %config.audit.path,
                "Using in-memory storage; mappings, transfers and batches are lost on exit"
            );
            let audit = FileAuditLog::open(&config.audit.path)?;
            Ok(Stores::in_memory(Arc::new(MemoryStore::new())).with_audit_sink(Arc::new(audit)))
        }
        StorageBackend::PostgreSQL => {
            let pg_config = config.storage.postgresql.as_ref().ok_or_else(|| {
                CarelinkError::Configuration(
                    "storage.postgresql is required when backend = \"postgresql\"".to_string(),
                )
            })?;

            tracing::info!("Creating PostgreSQL storage");
            let client = PostgreSQLClient::new(pg_config.clone()).await?;
            client.ensure_schema().await?;
            let store = Arc::new(PostgresStore::new(client));

            Ok(Stores {
                mappings: store.clone(),
                records: store.clone(),
                transfers: store.clone(),
                compliance: store.clone(),
                connections: store.clone(),
                audit: store,
            })
        }
    }
}
