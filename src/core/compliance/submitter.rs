//! Periodic compliance batch submission

use super::schema::ItemValidator;
use crate::adapters::compliance::{ComplianceItemSource, ComplianceTransport, ItemVerdict};
use crate::adapters::notification::NotificationSink;
use crate::adapters::storage::ComplianceStore;
use crate::config::ComplianceConfig;
use crate::core::audit::AuditRecorder;
use crate::core::checksum::calculate_checksum;
use crate::core::retry::RetryPolicy;
use crate::domain::{
    AuditAction, AuditEvent, AuditOutcome, CarelinkError, ComplianceItem, ComplianceItemInput,
    ComplianceSubmissionBatch, CorrelationId, ItemStatus, Notification, ReportingCadence,
    ReportingPeriod, Result,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Counts for one submission run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComplianceRunSummary {
    pub period: String,
    /// Accepted by the endpoint in this run
    pub submitted: usize,
    /// Rejected by the endpoint in this run
    pub rejected: usize,
    /// Excluded by local validation
    pub invalid: usize,
    /// Accepted in an earlier run and left alone
    pub previously_submitted: usize,
    /// Still Valid after the run, e.g. missing from the endpoint's answer
    pub outstanding: usize,
}

impl ComplianceRunSummary {
    pub fn is_complete(&self) -> bool {
        self.invalid == 0 && self.rejected == 0 && self.outstanding == 0
    }

    fn from_batch(batch: &ComplianceSubmissionBatch, submitted: usize, rejected: usize) -> Self {
        Self {
            period: batch.period.to_string(),
            submitted,
            rejected,
            invalid: batch.count(ItemStatus::Invalid),
            previously_submitted: batch.count(ItemStatus::Submitted) - submitted,
            outstanding: batch.count(ItemStatus::Valid),
        }
    }
}

/// Assembles, validates and submits the batch for a reporting period
///
/// Items are validated one by one; invalid items stay in the batch with a
/// reason. Runs are resumable: Submitted items are never sent again, and a
/// Rejected item is only revalidated once its payload changes.
pub struct ComplianceSubmitter {
    transport: Arc<dyn ComplianceTransport>,
    store: Arc<dyn ComplianceStore>,
    audit: Arc<AuditRecorder>,
    notifier: Arc<dyn NotificationSink>,
    validator: ItemValidator,
    retry: RetryPolicy,
    cadence: ReportingCadence,
    timeout: Duration,
}

impl ComplianceSubmitter {
    pub fn new(
        config: &ComplianceConfig,
        transport: Arc<dyn ComplianceTransport>,
        store: Arc<dyn ComplianceStore>,
        audit: Arc<AuditRecorder>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            transport,
            store,
            audit,
            notifier,
            validator: ItemValidator::new(&config.schemas),
            retry: RetryPolicy::from_config(&config.retry),
            cadence: config.cadence,
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    /// The reporting period containing now
    pub fn current_period(&self) -> ReportingPeriod {
        ReportingPeriod::containing(Utc::now(), self.cadence)
    }

    /// Pull items from `source` for `period` and submit them
    pub async fn run_from_source(
        &self,
        period: &ReportingPeriod,
        source: &dyn ComplianceItemSource,
        correlation_id: CorrelationId,
    ) -> Result<ComplianceRunSummary> {
        let inputs = source.items_for(period).await?;
        self.submit(period, inputs, correlation_id).await
    }

    /// Merge `inputs` into the stored batch, validate and submit what is due
    ///
    /// # Errors
    ///
    /// - [`CarelinkError::Validation`] for duplicate item ids in `inputs`
    /// - the transport error once the retry budget is spent; items stay
    ///   Valid and the next run sends them again
    /// - [`CarelinkError::AuditWriteFailure`] if the intent entry or the
    ///   refusal cannot be written; nothing is sent in that case
    pub async fn submit(
        &self,
        period: &ReportingPeriod,
        inputs: Vec<ComplianceItemInput>,
        correlation_id: CorrelationId,
    ) -> Result<ComplianceRunSummary> {
        let mut seen = HashSet::new();
        if let Some(dup) = inputs.iter().find(|i| !seen.insert(i.item_id.as_str())) {
            let e = CarelinkError::Validation(format!(
                "duplicate compliance item id '{}'",
                dup.item_id
            ));
            tracing::warn!(period = %period, item_id = %dup.item_id, "Compliance run refused");
            self.audit
                .record_failure(
                    correlation_id,
                    AuditAction::ComplianceSubmit,
                    format!("compliance:{period}"),
                    &e,
                )
                .await?;
            return Err(e);
        }

        let mut batch = self
            .store
            .load_batch(period)
            .await?
            .unwrap_or_else(|| ComplianceSubmissionBatch::new(period.clone()));

        let newly_invalid = self.merge(&mut batch, inputs)?;
        self.store.save_batch(&batch).await?;

        for item in &newly_invalid {
            self.audit
                .record(
                    AuditEvent::new(
                        correlation_id,
                        AuditAction::ComplianceItemResult,
                        item_target(period, &item.item_id),
                        AuditOutcome::Failed,
                    )
                    .with_detail(json!({"status": "invalid", "reason": item.reason})),
                )
                .await?;
            self.notifier
                .notify(Notification::ComplianceItemInvalid {
                    period: period.to_string(),
                    item_id: item.item_id.clone(),
                    reason: item.reason.clone().unwrap_or_default(),
                })
                .await;
        }

        let due: Vec<ComplianceItem> = batch
            .items
            .iter()
            .filter(|i| i.needs_submission())
            .cloned()
            .collect();
        if due.is_empty() {
            tracing::info!(period = %period, "No compliance items due for submission");
            return Ok(ComplianceRunSummary::from_batch(&batch, 0, 0));
        }

        let target = format!("compliance:{period}");
        self.audit
            .record(
                AuditEvent::new(
                    correlation_id,
                    AuditAction::ComplianceSubmit,
                    &target,
                    AuditOutcome::Attempted,
                )
                .with_detail(json!({
                    "items": due.iter().map(|i| i.item_id.as_str()).collect::<Vec<_>>(),
                })),
            )
            .await?;

        let verdicts = match self
            .retry
            .run("compliance submission", || self.send(period, &due, correlation_id))
            .await
        {
            Ok(verdicts) => verdicts,
            Err(e) => {
                tracing::error!(
                    period = %period,
                    items = due.len(),
                    error = %e,
                    "Compliance submission failed; items stay valid for the next run"
                );
                self.audit
                    .record_failure(correlation_id, AuditAction::ComplianceSubmit, &target, &e)
                    .await?;
                return Err(e);
            }
        };

        let (submitted, rejected) = self
            .apply_verdicts(&mut batch, &due, verdicts, correlation_id)
            .await?;
        batch.submitted_at = Some(Utc::now());
        self.store.save_batch(&batch).await?;

        let summary = ComplianceRunSummary::from_batch(&batch, submitted, rejected);
        self.audit
            .record(
                AuditEvent::new(
                    correlation_id,
                    AuditAction::ComplianceSubmit,
                    &target,
                    AuditOutcome::Succeeded,
                )
                .with_detail(json!({
                    "submitted": submitted,
                    "rejected": rejected,
                    "outstanding": summary.outstanding,
                })),
            )
            .await?;
        tracing::info!(
            period = %period,
            submitted,
            rejected,
            invalid = summary.invalid,
            "Compliance batch submitted"
        );
        Ok(summary)
    }

    async fn send(
        &self,
        period: &ReportingPeriod,
        items: &[ComplianceItem],
        correlation_id: CorrelationId,
    ) -> Result<Vec<ItemVerdict>> {
        match tokio::time::timeout(
            self.timeout,
            self.transport.submit_batch(period, items, correlation_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CarelinkError::TransientNetwork {
                target: format!("compliance:{period}"),
                message: format!("no response within {:?}", self.timeout),
            }),
        }
    }

    /// Fold this run's inputs into the batch; returns items that became Invalid
    fn merge(
        &self,
        batch: &mut ComplianceSubmissionBatch,
        inputs: Vec<ComplianceItemInput>,
    ) -> Result<Vec<ComplianceItem>> {
        let mut newly_invalid = Vec::new();

        for input in inputs {
            let payload_hash = calculate_checksum(&input.payload)?;

            if let Some(existing) = batch.item(&input.item_id) {
                let unchanged = existing.payload_hash == payload_hash;
                match existing.status {
                    ItemStatus::Submitted => continue,
                    ItemStatus::Rejected if unchanged => continue,
                    ItemStatus::Valid if unchanged => continue,
                    _ => {}
                }
            }

            let (status, reason) = match self.validator.validate(&input) {
                Ok(()) => (ItemStatus::Valid, None),
                Err(reason) => (ItemStatus::Invalid, Some(reason)),
            };
            let item = ComplianceItem {
                item_id: input.item_id,
                kind: input.kind,
                payload: input.payload,
                payload_hash,
                status,
                reason,
                submitted_at: None,
            };
            if status == ItemStatus::Invalid {
                tracing::warn!(
                    item_id = %item.item_id,
                    reason = item.reason.as_deref().unwrap_or(""),
                    "Compliance item failed validation"
                );
                newly_invalid.push(item.clone());
            }

            match batch.item_mut(&item.item_id) {
                Some(slot) => *slot = item,
                None => batch.items.push(item),
            }
        }

        Ok(newly_invalid)
    }

    async fn apply_verdicts(
        &self,
        batch: &mut ComplianceSubmissionBatch,
        sent: &[ComplianceItem],
        verdicts: Vec<ItemVerdict>,
        correlation_id: CorrelationId,
    ) -> Result<(usize, usize)> {
        let period = batch.period.clone();
        let mut by_id: HashMap<String, ItemVerdict> = verdicts
            .into_iter()
            .map(|v| (v.item_id.clone(), v))
            .collect();
        let (mut submitted, mut rejected) = (0, 0);
        let now = Utc::now();

        for sent_item in sent {
            let Some(verdict) = by_id.remove(&sent_item.item_id) else {
                tracing::warn!(
                    period = %period,
                    item_id = %sent_item.item_id,
                    "No verdict returned for item; it stays valid"
                );
                continue;
            };
            let Some(item) = batch.item_mut(&sent_item.item_id) else {
                continue;
            };

            if verdict.accepted {
                item.status = ItemStatus::Submitted;
                item.reason = None;
                item.submitted_at = Some(now);
                submitted += 1;
            } else {
                item.status = ItemStatus::Rejected;
                item.reason = Some(
                    verdict
                        .reason
                        .unwrap_or_else(|| "rejected without reason".to_string()),
                );
                rejected += 1;
            }
            let item = item.clone();
            self.store.update_item(&period, &item).await?;

            let outcome = if item.status == ItemStatus::Submitted {
                AuditOutcome::Succeeded
            } else {
                AuditOutcome::Failed
            };
            self.audit
                .record(
                    AuditEvent::new(
                        correlation_id,
                        AuditAction::ComplianceItemResult,
                        item_target(&period, &item.item_id),
                        outcome,
                    )
                    .with_detail(json!({"status": item.status, "reason": item.reason})),
                )
                .await?;
            if item.status == ItemStatus::Rejected {
                self.notifier
                    .notify(Notification::ComplianceItemRejected {
                        period: period.to_string(),
                        item_id: item.item_id.clone(),
                        reason: item.reason.clone().unwrap_or_default(),
                    })
                    .await;
            }
        }

        for unexpected in by_id.keys() {
            tracing::warn!(period = %period, item_id = %unexpected, "Verdict for an item that was not sent");
        }
        Ok((submitted, rejected))
    }

    /// Stored batch for a period
    pub async fn batch(&self, period: &ReportingPeriod) -> Result<Option<ComplianceSubmissionBatch>> {
        self.store.load_batch(period).await
    }
}

fn item_target(period: &ReportingPeriod, item_id: &str) -> String {
    format!("compliance:{period}:{item_id}")
}
