//! Service wiring
//!
//! Builds the shared services (stores, audit recorder, auth manager, transfer
//! gateway) once from a [`CarelinkConfig`] and hands out per-connection
//! orchestrators and submitters.

use crate::adapters::auth::{OAuthTokenClient, TokenProvider};
use crate::adapters::compliance::HttpComplianceClient;
use crate::adapters::fhir::FhirClient;
use crate::adapters::notification::{NotificationSink, TracingNotifier};
use crate::adapters::storage::{create_stores, Stores};
use crate::adapters::transfer::{HttpTransferClient, TransferTransport};
use crate::config::CarelinkConfig;
use crate::core::audit::AuditRecorder;
use crate::core::auth::AuthManager;
use crate::core::compliance::ComplianceSubmitter;
use crate::core::sync::{FieldOwnershipTable, PatientLocks, SyncOrchestrator};
use crate::core::transfer::MedicationTransferGateway;
use crate::domain::{CarelinkError, ConnectionId, NhsConnection, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct ConnectionClients {
    fhir: Arc<FhirClient>,
    compliance: Arc<HttpComplianceClient>,
}

/// Long-lived services shared by every command
pub struct Runtime {
    config: CarelinkConfig,
    stores: Stores,
    audit: Arc<AuditRecorder>,
    notifier: Arc<dyn NotificationSink>,
    auth: Arc<AuthManager>,
    gateway: MedicationTransferGateway,
    clients: HashMap<ConnectionId, ConnectionClients>,
    /// Shared by every orchestrator so one patient never reconciles twice at once
    patient_locks: Arc<PatientLocks>,
}

impl Runtime {
    /// Build from configuration with the configured storage backend
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be opened or a connection's
    /// endpoints are malformed.
    pub async fn build(config: &CarelinkConfig) -> Result<Self> {
        let stores = create_stores(config).await?;
        Self::with_stores(config, stores, Arc::new(TracingNotifier)).await
    }

    /// Build on explicit stores and notification sink
    pub async fn with_stores(
        config: &CarelinkConfig,
        stores: Stores,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let audit = Arc::new(AuditRecorder::new(
            stores.audit.clone(),
            config.application.actor.clone(),
        ));
        let auth = Arc::new(AuthManager::new(
            &config.auth,
            stores.connections.clone(),
            audit.clone(),
            notifier.clone(),
        ));
        let tokens: Arc<dyn TokenProvider> = auth.clone();

        let mut clients = HashMap::new();
        let mut transports: HashMap<ConnectionId, Arc<dyn TransferTransport>> = HashMap::new();
        for connection in &config.connections {
            let id = ConnectionId::new(connection.id.clone())?;
            let exchanger = OAuthTokenClient::new(connection, &config.auth)?;
            auth.register(
                NhsConnection::new(id.clone(), connection.organization_code.clone()),
                Arc::new(exchanger),
            )
            .await?;

            transports.insert(
                id.clone(),
                Arc::new(HttpTransferClient::new(
                    connection,
                    Duration::from_secs(config.transfer.timeout_seconds),
                    tokens.clone(),
                )?),
            );
            clients.insert(
                id,
                ConnectionClients {
                    fhir: Arc::new(FhirClient::new(connection, &config.fhir, tokens.clone())?),
                    compliance: Arc::new(HttpComplianceClient::new(
                        connection,
                        Duration::from_secs(config.compliance.timeout_seconds),
                        tokens.clone(),
                    )?),
                },
            );
            tracing::debug!(connection_id = %connection.id, "Connection registered");
        }

        let gateway = MedicationTransferGateway::new(
            &config.transfer,
            transports,
            stores.transfers.clone(),
            auth.clone(),
            audit.clone(),
            notifier.clone(),
        );

        tracing::info!(
            connections = config.connections.len(),
            backend = ?config.storage.backend,
            "Runtime ready"
        );

        Ok(Self {
            config: config.clone(),
            stores,
            audit,
            notifier,
            auth,
            gateway,
            clients,
            patient_locks: Arc::new(PatientLocks::new()),
        })
    }

    fn clients(&self, connection_id: &str) -> Result<(ConnectionId, &ConnectionClients)> {
        let id = ConnectionId::new(connection_id)?;
        let clients = self.clients.get(&id).ok_or_else(|| {
            CarelinkError::NotFound(format!("connection {connection_id} is not configured"))
        })?;
        Ok((id, clients))
    }

    /// Reconciliation against one connection's clinical-record API
    pub fn sync_orchestrator(&self, connection_id: &str) -> Result<SyncOrchestrator> {
        let (_, clients) = self.clients(connection_id)?;
        Ok(SyncOrchestrator::new(
            clients.fhir.clone(),
            self.stores.mappings.clone(),
            self.stores.records.clone(),
            self.audit.clone(),
            self.notifier.clone(),
            FieldOwnershipTable::from_config(&self.config.sync.field_ownership),
        )
        .with_patient_locks(self.patient_locks.clone()))
    }

    /// Compliance submission through one connection's reporting endpoint
    pub fn compliance_submitter(&self, connection_id: &str) -> Result<ComplianceSubmitter> {
        let (_, clients) = self.clients(connection_id)?;
        Ok(ComplianceSubmitter::new(
            &self.config.compliance,
            clients.compliance.clone(),
            self.stores.compliance.clone(),
            self.audit.clone(),
            self.notifier.clone(),
        ))
    }

    pub fn gateway(&self) -> &MedicationTransferGateway {
        &self.gateway
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    pub fn audit(&self) -> &Arc<AuditRecorder> {
        &self.audit
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn config(&self) -> &CarelinkConfig {
        &self.config
    }

    /// Wait for background transfer retries to settle
    pub async fn shutdown(&self) {
        let scheduled = self.gateway.scheduled_retries().await;
        if scheduled > 0 {
            tracing::info!(scheduled, "Waiting for scheduled transfer retries");
        }
        self.gateway.settle_all().await;
        tracing::info!("Runtime stopped");
    }
}
