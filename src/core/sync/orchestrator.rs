//! Reconciliation of remote patient records into the local store

use super::ownership::FieldOwnershipTable;
use crate::adapters::fhir::ClinicalRecordSource;
use crate::adapters::notification::NotificationSink;
use crate::adapters::storage::{ClinicalRecordStore, MappingStore};
use crate::core::audit::AuditRecorder;
use crate::domain::{
    AuditAction, AuditEvent, AuditOutcome, CarelinkError, CorrelationId, FhirResourceBundle,
    NhsNumber, Notification, PatientId, PatientRecordMapping, Result, SyncStatus,
};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// What one reconciliation did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Remote content matched the stored hash; nothing was written
    Unchanged { version: u64 },
    /// The local record and mapping were advanced to `version`
    Applied {
        version: u64,
        fields_written: usize,
        preserved: Vec<String>,
        ambiguous: Vec<String>,
    },
}

/// Result of a bulk run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub total: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub failed: Vec<SyncFailure>,
    #[serde(skip)]
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    pub patient_id: PatientId,
    pub error_kind: &'static str,
    pub message: String,
}

impl SyncSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn log_summary(&self) {
        tracing::info!(
            total = self.total,
            applied = self.applied,
            unchanged = self.unchanged,
            failed = self.failed.len(),
            duration_ms = self.duration.as_millis() as u64,
            "Reconciliation run finished"
        );
        for failure in &self.failed {
            tracing::warn!(
                patient_id = %failure.patient_id,
                error_kind = failure.error_kind,
                "{}",
                failure.message
            );
        }
    }
}

/// Per-patient reconciliation locks
///
/// One table is shared by every orchestrator in a process, whichever
/// connection it serves, so a patient is never reconciled twice at once.
#[derive(Default)]
pub struct PatientLocks {
    locks: Mutex<HashMap<PatientId, Arc<Mutex<()>>>>,
}

impl PatientLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, patient_id: &PatientId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop locks nobody holds or waits on any more
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(patient_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Applies remote records to the local canonical store
///
/// Each patient is reconciled under its own lock; different patients run in
/// parallel and only meet at per-row store updates. A commit that loses a
/// race with another process is re-checked against the stored mapping
/// before it counts as a conflict.
pub struct SyncOrchestrator {
    source: Arc<dyn ClinicalRecordSource>,
    mappings: Arc<dyn MappingStore>,
    records: Arc<dyn ClinicalRecordStore>,
    audit: Arc<AuditRecorder>,
    notifier: Arc<dyn NotificationSink>,
    ownership: FieldOwnershipTable,
    locks: Arc<PatientLocks>,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn ClinicalRecordSource>,
        mappings: Arc<dyn MappingStore>,
        records: Arc<dyn ClinicalRecordStore>,
        audit: Arc<AuditRecorder>,
        notifier: Arc<dyn NotificationSink>,
        ownership: FieldOwnershipTable,
    ) -> Self {
        Self {
            source,
            mappings,
            records,
            audit,
            notifier,
            ownership,
            locks: Arc::new(PatientLocks::new()),
        }
    }

    /// Share a lock table with other orchestrators
    pub fn with_patient_locks(mut self, locks: Arc<PatientLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Reconcile one patient
    ///
    /// # Errors
    ///
    /// - [`CarelinkError::Validation`] if the mapping is deactivated (no
    ///   network call is made)
    /// - [`CarelinkError::InvalidIdentifier`] if the locally recorded
    ///   identifier fails validation
    /// - [`CarelinkError::NotFound`] if the remote has no matching patient
    /// - [`CarelinkError::StaleMapping`] if the mapping moved underneath the commit
    pub async fn reconcile(
        &self,
        patient_id: &PatientId,
        correlation_id: CorrelationId,
    ) -> Result<ReconcileOutcome> {
        let _guard = self.locks.acquire(patient_id).await;
        let target = format!("patient:{patient_id}");

        let mapping = match self.resolve_mapping(patient_id).await {
            Ok(mapping) => mapping,
            Err(e) => {
                self.audit
                    .record_failure(correlation_id, AuditAction::ReconciliationApply, &target, &e)
                    .await?;
                return Err(e);
            }
        };
        if !mapping.active {
            let e = CarelinkError::Validation(format!(
                "mapping for patient {patient_id} is deactivated"
            ));
            self.audit
                .record_failure(correlation_id, AuditAction::ReconciliationApply, &target, &e)
                .await?;
            return Err(e);
        }

        let bundle = match self
            .source
            .fetch_patient_record(&mapping.nhs_number, correlation_id)
            .await
        {
            Ok(bundle) => bundle,
            Err(e) => {
                self.audit
                    .record_failure(correlation_id, AuditAction::RecordFetch, &target, &e)
                    .await?;
                if matches!(e, CarelinkError::NotFound(_)) {
                    self.notifier
                        .notify(Notification::PatientNotFound {
                            patient_id: patient_id.clone(),
                        })
                        .await;
                }
                return Err(e);
            }
        };
        self.audit
            .record(
                AuditEvent::new(
                    correlation_id,
                    AuditAction::RecordFetch,
                    &target,
                    AuditOutcome::Succeeded,
                )
                .with_detail(json!({
                    "resources": bundle.resources.len(),
                    "content_hash": bundle.content_hash,
                })),
            )
            .await?;

        if let Err(reason) = identifier_matches(&bundle, &mapping.nhs_number) {
            return Err(self
                .conflict(patient_id, correlation_id, &target, reason)
                .await?);
        }

        if mapping.is_current(&bundle.content_hash) {
            return self.unchanged(&mapping, correlation_id, &target).await;
        }

        self.apply(mapping, &bundle, correlation_id, &target).await
    }

    async fn unchanged(
        &self,
        mapping: &PatientRecordMapping,
        correlation_id: CorrelationId,
        target: &str,
    ) -> Result<ReconcileOutcome> {
        tracing::debug!(
            patient_id = %mapping.patient_id,
            version = mapping.version,
            "Remote record unchanged"
        );
        self.audit
            .record(
                AuditEvent::new(
                    correlation_id,
                    AuditAction::ReconciliationApply,
                    target,
                    AuditOutcome::Skipped,
                )
                .with_detail(json!({"version": mapping.version})),
            )
            .await?;
        Ok(ReconcileOutcome::Unchanged {
            version: mapping.version,
        })
    }

    async fn apply(
        &self,
        mut mapping: PatientRecordMapping,
        bundle: &FhirResourceBundle,
        correlation_id: CorrelationId,
        target: &str,
    ) -> Result<ReconcileOutcome> {
        let patient_id = mapping.patient_id.clone();
        let plan = self.ownership.plan(&bundle.canonical);

        if !plan.ambiguous.is_empty() {
            tracing::warn!(
                patient_id = %patient_id,
                fields = ?plan.ambiguous,
                "Fields with no ownership entry kept local"
            );
            self.notifier
                .notify(Notification::AmbiguousFieldOwnership {
                    patient_id: patient_id.clone(),
                    fields: plan.ambiguous.clone(),
                })
                .await;
        }

        // A stale commit is merged once more against the winner's state
        let mut merged_again = false;
        let (patch, next) = loop {
            let local = match self.records.load_fields(&patient_id).await {
                Ok(local) => local,
                Err(e) => {
                    self.audit
                        .record_failure(correlation_id, AuditAction::ReconciliationApply, target, &e)
                        .await?;
                    return Err(e);
                }
            };
            let patch = FieldOwnershipTable::changed_only(plan.patch.clone(), &local);
            let next = mapping.advanced(bundle.content_hash.clone(), Utc::now());

            match self
                .records
                .commit_reconciliation(&patient_id, &patch, &next, mapping.version)
                .await
            {
                Ok(()) => break (patch, next),
                Err(stale @ CarelinkError::StaleMapping { .. }) => {
                    let current = match self.mappings.load_mapping(&patient_id).await {
                        Ok(current) => current,
                        Err(e) => {
                            self.audit
                                .record_failure(
                                    correlation_id,
                                    AuditAction::ReconciliationApply,
                                    target,
                                    &e,
                                )
                                .await?;
                            return Err(e);
                        }
                    };
                    match current {
                        Some(current) if current.is_current(&bundle.content_hash) => {
                            tracing::info!(
                                patient_id = %patient_id,
                                version = current.version,
                                "Concurrent reconciliation already applied this content"
                            );
                            return self.unchanged(&current, correlation_id, target).await;
                        }
                        Some(current) if current.active && !merged_again => {
                            tracing::info!(
                                patient_id = %patient_id,
                                expected = mapping.version,
                                found = current.version,
                                "Mapping moved during reconciliation, merging again"
                            );
                            mapping = current;
                            merged_again = true;
                        }
                        _ => {
                            return Err(self
                                .conflict(&patient_id, correlation_id, target, stale.to_string())
                                .await?);
                        }
                    }
                }
                Err(e) => {
                    self.audit
                        .record_failure(correlation_id, AuditAction::ReconciliationApply, target, &e)
                        .await?;
                    return Err(e);
                }
            }
        };

        tracing::info!(
            patient_id = %patient_id,
            version = next.version,
            fields_written = patch.len(),
            "Reconciliation applied"
        );
        self.audit
            .record(
                AuditEvent::new(
                    correlation_id,
                    AuditAction::ReconciliationApply,
                    target,
                    AuditOutcome::Succeeded,
                )
                .with_detail(json!({
                    "version": next.version,
                    "content_hash": bundle.content_hash,
                    "fields_written": patch.fields.keys().collect::<Vec<_>>(),
                    "preserved": plan.preserved,
                    "ambiguous": plan.ambiguous,
                })),
            )
            .await?;

        Ok(ReconcileOutcome::Applied {
            version: next.version,
            fields_written: patch.len(),
            preserved: plan.preserved,
            ambiguous: plan.ambiguous,
        })
    }

    /// Stored mapping, or a new one built from the locally recorded identifier
    async fn resolve_mapping(&self, patient_id: &PatientId) -> Result<PatientRecordMapping> {
        if let Some(mapping) = self.mappings.load_mapping(patient_id).await? {
            return Ok(mapping);
        }

        let identifier = self
            .records
            .national_identifier(patient_id)
            .await?
            .ok_or_else(|| {
                CarelinkError::NotFound(format!(
                    "no national identifier recorded for patient {patient_id}"
                ))
            })?;
        let nhs_number = NhsNumber::parse(&identifier)?;

        let created = self
            .mappings
            .create_mapping(&PatientRecordMapping::new(patient_id.clone(), nhs_number))
            .await?;
        tracing::info!(
            patient_id = %patient_id,
            nhs_number = %created.nhs_number.redacted(),
            "Created patient mapping"
        );
        Ok(created)
    }

    /// Mark the mapping Conflict, audit and notify; returns the error to surface
    async fn conflict(
        &self,
        patient_id: &PatientId,
        correlation_id: CorrelationId,
        target: &str,
        reason: String,
    ) -> Result<CarelinkError> {
        tracing::warn!(patient_id = %patient_id, reason = %reason, "Reconciliation conflict");
        self.mappings
            .mark_mapping_status(patient_id, SyncStatus::Conflict)
            .await?;
        self.audit
            .record(
                AuditEvent::new(
                    correlation_id,
                    AuditAction::ReconciliationConflict,
                    target,
                    AuditOutcome::Failed,
                )
                .with_detail(json!({"reason": reason})),
            )
            .await?;
        self.notifier
            .notify(Notification::ReconciliationConflict {
                patient_id: patient_id.clone(),
                reason: reason.clone(),
            })
            .await;
        Ok(CarelinkError::mapping(target, reason))
    }

    /// Reconcile several patients with bounded concurrency
    ///
    /// Each patient gets its own correlation id. Failures are collected, not
    /// propagated, except audit write failures which abort the run.
    pub async fn reconcile_many(
        &self,
        patients: Vec<PatientId>,
        parallelism: usize,
    ) -> Result<SyncSummary> {
        let started = Instant::now();
        let mut summary = SyncSummary {
            total: patients.len(),
            ..SyncSummary::default()
        };

        let mut results = stream::iter(patients)
            .map(|patient_id| async move {
                let outcome = self.reconcile(&patient_id, CorrelationId::new()).await;
                (patient_id, outcome)
            })
            .buffer_unordered(parallelism.max(1));

        while let Some((patient_id, outcome)) = results.next().await {
            match outcome {
                Ok(ReconcileOutcome::Applied { .. }) => summary.applied += 1,
                Ok(ReconcileOutcome::Unchanged { .. }) => summary.unchanged += 1,
                Err(e @ CarelinkError::AuditWriteFailure(_)) => return Err(e),
                Err(e) => summary.failed.push(SyncFailure {
                    patient_id,
                    error_kind: e.kind(),
                    message: e.to_string(),
                }),
            }
        }

        summary.duration = started.elapsed();
        Ok(summary)
    }

    /// Reconcile every active mapping
    pub async fn reconcile_all(&self, parallelism: usize) -> Result<SyncSummary> {
        let patients = self
            .mappings
            .list_mappings()
            .await?
            .into_iter()
            .filter(|m| m.active)
            .map(|m| m.patient_id)
            .collect();
        self.reconcile_many(patients, parallelism).await
    }

    /// Stop reconciling a patient; the mapping row is kept
    pub async fn deactivate(
        &self,
        patient_id: &PatientId,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        let _guard = self.locks.acquire(patient_id).await;

        self.mappings.deactivate_mapping(patient_id).await?;
        self.audit
            .record_simple(
                correlation_id,
                AuditAction::MappingDeactivated,
                format!("patient:{patient_id}"),
                AuditOutcome::Succeeded,
            )
            .await?;
        tracing::info!(patient_id = %patient_id, "Mapping deactivated");
        Ok(())
    }
}

fn identifier_matches(
    bundle: &FhirResourceBundle,
    nhs_number: &NhsNumber,
) -> std::result::Result<(), String> {
    let patient = bundle
        .patient()
        .ok_or_else(|| "bundle has no Patient resource".to_string())?;
    if patient
        .identifier
        .iter()
        .any(|i| i.value == nhs_number.as_str())
    {
        Ok(())
    } else {
        Err(format!(
            "remote Patient/{} does not carry identifier {}",
            patient.id,
            nhs_number.redacted()
        ))
    }
}
