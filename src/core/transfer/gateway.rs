//! Idempotent medication-transfer delivery

use crate::adapters::notification::NotificationSink;
use crate::adapters::storage::TransferStore;
use crate::adapters::transfer::TransferTransport;
use crate::config::TransferConfig;
use crate::core::audit::AuditRecorder;
use crate::core::auth::AuthManager;
use crate::core::retry::RetryPolicy;
use crate::domain::{
    AuditAction, AuditEvent, AuditOutcome, CarelinkError, ConnectionId, CorrelationId,
    IdempotencyKey, MedicationTransferPayload, MedicationTransferRequest, Notification, Result,
    TransferOutcome, TransferStatus,
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// What happens after one delivery attempt
enum Next {
    Settled,
    RetryAfter(Duration),
}

/// Background retry task for one request
struct RetryTask {
    connection_id: ConnectionId,
    /// Resolves to true when the task cancelled its request after revocation
    handle: JoinHandle<bool>,
}

/// Reliable, at-most-once delivery of medication transfers
///
/// The idempotency key is derived from the patient, the medication-list
/// version and a coarse time bucket; a second submission with the same key
/// returns the stored outcome without another delivery. Transient failures
/// are retried by a background task per request, with doubling backoff,
/// until the attempt budget is spent. Revoking the connection cancels every
/// waiting retry.
pub struct MedicationTransferGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    transports: HashMap<ConnectionId, Arc<dyn TransferTransport>>,
    store: Arc<dyn TransferStore>,
    auth: Arc<AuthManager>,
    audit: Arc<AuditRecorder>,
    notifier: Arc<dyn NotificationSink>,
    policy: RetryPolicy,
    bucket: chrono::Duration,
    attempt_timeout: Duration,
    tasks: Mutex<HashMap<IdempotencyKey, RetryTask>>,
}

impl MedicationTransferGateway {
    pub fn new(
        config: &TransferConfig,
        transports: HashMap<ConnectionId, Arc<dyn TransferTransport>>,
        store: Arc<dyn TransferStore>,
        auth: Arc<AuthManager>,
        audit: Arc<AuditRecorder>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                transports,
                store,
                auth,
                audit,
                notifier,
                policy: RetryPolicy::doubling(
                    config.max_attempts,
                    Duration::from_millis(config.initial_backoff_ms),
                    Duration::from_millis(config.max_backoff_ms),
                ),
                bucket: chrono::Duration::seconds(config.time_bucket_seconds as i64),
                attempt_timeout: Duration::from_secs(config.timeout_seconds),
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Queue a transfer and make the first delivery attempt
    ///
    /// Returns after the first attempt: the outcome is Acked, Failed,
    /// FailedTerminal, or Pending with a retry scheduled. A submission whose
    /// key already exists returns the stored outcome with `duplicate = true`.
    ///
    /// # Errors
    ///
    /// - [`CarelinkError::Validation`] for a structurally invalid payload
    /// - [`CarelinkError::NotFound`] for an unknown connection
    /// - [`CarelinkError::AuditWriteFailure`] if the intent entry cannot be
    ///   written; nothing is sent in that case
    ///
    /// Validation and unknown-connection failures are audited before they
    /// are returned.
    pub async fn submit_transfer(
        &self,
        connection_id: &ConnectionId,
        payload: MedicationTransferPayload,
        correlation_id: CorrelationId,
    ) -> Result<TransferOutcome> {
        let precheck = payload
            .validate()
            .and_then(|()| self.inner.transport(connection_id).map(drop));
        if let Err(e) = precheck {
            tracing::warn!(connection_id = %connection_id, error = %e, "Transfer refused");
            self.inner
                .audit
                .record_failure(
                    correlation_id,
                    AuditAction::TransferFailed,
                    format!("connection:{connection_id}"),
                    &e,
                )
                .await?;
            return Err(e);
        }

        let key = IdempotencyKey::derive(
            &payload.patient,
            &payload.medication_list_version,
            Utc::now(),
            self.inner.bucket,
        );
        let request = MedicationTransferRequest::new(key.clone(), connection_id.clone(), payload);

        if let Some(existing) = self.inner.store.insert_if_absent(&request).await? {
            tracing::info!(
                idempotency_key = %key,
                status = %existing.status,
                "Duplicate transfer submission, returning stored outcome"
            );
            return Ok(existing.outcome(true));
        }
        tracing::info!(
            idempotency_key = %key,
            connection_id = %connection_id,
            patient = %request.payload.patient.redacted(),
            "Transfer queued"
        );

        // Subscribed before the first attempt so a revocation during it is seen
        let revoked = self.inner.auth.revocation_signal(connection_id)?;
        let (request, next) = self.inner.attempt(request, correlation_id).await?;
        if let Next::RetryAfter(delay) = next {
            self.inner
                .spawn_retries(key, connection_id.clone(), correlation_id, delay, revoked)
                .await;
        }
        Ok(request.outcome(false))
    }

    /// Re-schedule requests left Pending or Sent by a previous process
    ///
    /// A Sent request has an unknown outcome and is re-sent under the same
    /// key; the receiver deduplicates it.
    pub async fn resume_pending(&self) -> Result<usize> {
        let mut resumed = 0;
        for status in [TransferStatus::Sent, TransferStatus::Pending] {
            for mut request in self.inner.store.list_transfers(Some(status)).await? {
                if self.inner.tasks.lock().await.contains_key(&request.key) {
                    continue;
                }
                if request.status == TransferStatus::Sent {
                    request.mark_retry("outcome unknown after restart", Utc::now())?;
                    self.inner.store.update_transfer(&request).await?;
                }
                let delay = request
                    .next_attempt_at
                    .and_then(|at| (at - Utc::now()).to_std().ok())
                    .unwrap_or(Duration::ZERO);
                let revoked = self.inner.auth.revocation_signal(&request.connection_id)?;
                tracing::info!(
                    idempotency_key = %request.key,
                    retry_count = request.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Resuming transfer"
                );
                self.inner
                    .spawn_retries(
                        request.key,
                        request.connection_id,
                        CorrelationId::new(),
                        delay,
                        revoked,
                    )
                    .await;
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Current outcome of a request
    pub async fn outcome(&self, key: &IdempotencyKey) -> Result<TransferOutcome> {
        self.inner
            .store
            .load_transfer(key)
            .await?
            .map(|r| r.outcome(false))
            .ok_or_else(|| CarelinkError::NotFound(format!("transfer {key}")))
    }

    /// Wait until background retries for `key` have finished
    pub async fn await_settled(&self, key: &IdempotencyKey) -> Result<TransferOutcome> {
        let task = self.inner.tasks.lock().await.remove(key);
        if let Some(task) = task {
            if let Err(e) = task.handle.await {
                tracing::error!(idempotency_key = %key, error = %e, "Transfer retry task failed");
            }
        }
        self.outcome(key).await
    }

    /// Wait for every scheduled retry task
    pub async fn settle_all(&self) {
        let tasks: Vec<_> = self.inner.tasks.lock().await.drain().collect();
        for (key, task) in tasks {
            if let Err(e) = task.handle.await {
                tracing::error!(idempotency_key = %key, error = %e, "Transfer retry task failed");
            }
        }
    }

    /// Number of retry tasks still scheduled
    pub async fn scheduled_retries(&self) -> usize {
        self.inner.tasks.lock().await.len()
    }

    /// Revoke a connection and wait for its retry tasks to stand down
    ///
    /// Returns the number of Pending requests moved to Failed.
    pub async fn revoke_connection(
        &self,
        connection_id: &ConnectionId,
        reason: &str,
        correlation_id: CorrelationId,
    ) -> Result<usize> {
        // Taken before the signal fires; a task that finishes first would
        // otherwise remove itself uncounted
        let waiting: Vec<(IdempotencyKey, RetryTask)> = {
            let mut tasks = self.inner.tasks.lock().await;
            let keys: Vec<IdempotencyKey> = tasks
                .iter()
                .filter(|(_, task)| &task.connection_id == connection_id)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| tasks.remove(&key).map(|task| (key, task)))
                .collect()
        };

        if let Err(e) = self
            .inner
            .auth
            .revoke(connection_id, reason, correlation_id)
            .await
        {
            self.inner.tasks.lock().await.extend(waiting);
            return Err(e);
        }

        let mut cancelled = 0;
        for (key, task) in waiting {
            match task.handle.await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(idempotency_key = %key, error = %e, "Transfer retry task failed");
                }
            }
        }
        tracing::info!(connection_id = %connection_id, cancelled, "Pending transfers cancelled");
        Ok(cancelled)
    }

    /// Requests needing operator action
    pub async fn failed_transfers(&self) -> Result<Vec<MedicationTransferRequest>> {
        let mut failed = self
            .inner
            .store
            .list_transfers(Some(TransferStatus::Failed))
            .await?;
        failed.extend(
            self.inner
                .store
                .list_transfers(Some(TransferStatus::FailedTerminal))
                .await?,
        );
        Ok(failed)
    }
}

impl GatewayInner {
    fn transport(&self, connection_id: &ConnectionId) -> Result<Arc<dyn TransferTransport>> {
        self.transports
            .get(connection_id)
            .cloned()
            .ok_or_else(|| CarelinkError::NotFound(format!("connection {connection_id}")))
    }

    async fn spawn_retries(
        self: &Arc<Self>,
        key: IdempotencyKey,
        connection_id: ConnectionId,
        correlation_id: CorrelationId,
        delay: Duration,
        revoked: watch::Receiver<bool>,
    ) {
        // Held across the spawn so the task's own removal runs after the insert
        let mut tasks = self.tasks.lock().await;
        let inner = Arc::clone(self);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let cancelled = Arc::clone(&inner)
                .retry_loop(task_key.clone(), correlation_id, delay, revoked)
                .await;
            inner.tasks.lock().await.remove(&task_key);
            cancelled
        });
        tasks.insert(
            key,
            RetryTask {
                connection_id,
                handle,
            },
        );
    }

    /// Returns true if the request was cancelled by a revocation
    async fn retry_loop(
        self: Arc<Self>,
        key: IdempotencyKey,
        correlation_id: CorrelationId,
        mut delay: Duration,
        mut revoked: watch::Receiver<bool>,
    ) -> bool {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_revoked(&mut revoked) => {
                    return match self.cancel(&key, correlation_id).await {
                        Ok(cancelled) => cancelled,
                        Err(e) => {
                            crate::log_error_with_context!(&e, "Failed to cancel transfer");
                            false
                        }
                    };
                }
            }

            let request = match self.store.load_transfer(&key).await {
                Ok(Some(request)) if request.status == TransferStatus::Pending => request,
                Ok(_) => return false,
                Err(e) => {
                    self.abandon(&key, correlation_id, e).await;
                    return false;
                }
            };

            match self.attempt(request, correlation_id).await {
                Ok((_, Next::RetryAfter(next))) => delay = next,
                Ok((_, Next::Settled)) => return false,
                Err(e) => {
                    self.abandon(&key, correlation_id, e).await;
                    return false;
                }
            }
        }
    }

    /// Audit a retry the task could not carry out
    ///
    /// The request stays Pending; `resume_pending` picks it up again. An
    /// audit write failure is only logged since it cannot be recorded.
    async fn abandon(
        &self,
        key: &IdempotencyKey,
        correlation_id: CorrelationId,
        error: CarelinkError,
    ) {
        crate::log_error_with_context!(&error, "Transfer attempt aborted");
        if matches!(error, CarelinkError::AuditWriteFailure(_)) {
            return;
        }
        if let Err(e) = self
            .audit
            .record_failure(
                correlation_id,
                AuditAction::TransferAttempt,
                format!("transfer:{key}"),
                &error,
            )
            .await
        {
            tracing::error!(idempotency_key = %key, error = %e, "Failed to audit aborted transfer attempt");
        }
    }

    /// One delivery attempt: intent audit, Pending → Sent, send, record outcome
    async fn attempt(
        &self,
        mut request: MedicationTransferRequest,
        correlation_id: CorrelationId,
    ) -> Result<(MedicationTransferRequest, Next)> {
        let target = format!("transfer:{}", request.key);
        let attempt = request.retry_count + 1;

        self.audit
            .record(
                AuditEvent::new(
                    correlation_id,
                    AuditAction::TransferAttempt,
                    &target,
                    AuditOutcome::Attempted,
                )
                .with_detail(json!({
                    "attempt": attempt,
                    "connection_id": request.connection_id,
                    "destination": request.payload.destination_organization,
                })),
            )
            .await?;

        request.mark_sent(Utc::now())?;
        self.store.update_transfer(&request).await?;

        let transport = self.transport(&request.connection_id)?;
        let result = match tokio::time::timeout(
            self.attempt_timeout,
            transport.deliver(&request, correlation_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CarelinkError::TransientNetwork {
                target: target.clone(),
                message: format!("no response within {:?}", self.attempt_timeout),
            }),
        };

        let next = match result {
            Ok(ack) => {
                let ack_id = ack.acknowledgement_id.clone();
                request.mark_acked(ack)?;
                self.store.update_transfer(&request).await?;
                tracing::info!(idempotency_key = %request.key, attempt, "Transfer acknowledged");
                self.audit
                    .record(
                        AuditEvent::new(
                            correlation_id,
                            AuditAction::TransferAcknowledged,
                            &target,
                            AuditOutcome::Succeeded,
                        )
                        .with_detail(json!({"acknowledgement_id": ack_id, "attempt": attempt})),
                    )
                    .await?;
                Next::Settled
            }
            Err(e) if e.is_retryable() => {
                let delay = self.policy.delay_after(&e, attempt);
                request.mark_retry(e.to_string(), Utc::now() + chrono_delay(delay))?;

                if request.retry_count >= self.policy.max_attempts {
                    let reason = format!("retry budget exhausted after {attempt} attempt(s): {e}");
                    request.mark_failed_terminal(&reason)?;
                    self.store.update_transfer(&request).await?;
                    tracing::error!(idempotency_key = %request.key, attempt, "{reason}");
                    self.audit
                        .record(
                            AuditEvent::new(
                                correlation_id,
                                AuditAction::TransferFailed,
                                &target,
                                AuditOutcome::Failed,
                            )
                            .with_detail(json!({
                                "terminal": true,
                                "attempts": attempt,
                                "error_kind": e.kind(),
                                "error": e.to_string(),
                            })),
                        )
                        .await?;
                    self.notifier
                        .notify(Notification::TransferFailedTerminal {
                            key: request.key.clone(),
                            attempts: attempt,
                            reason,
                        })
                        .await;
                    Next::Settled
                } else {
                    self.store.update_transfer(&request).await?;
                    crate::log_retry_attempt!(
                        attempt,
                        self.policy.max_attempts,
                        delay.as_millis() as u64,
                        e
                    );
                    self.audit
                        .record_failure(correlation_id, AuditAction::TransferAttempt, &target, &e)
                        .await?;
                    Next::RetryAfter(delay)
                }
            }
            Err(e) => {
                request.mark_failed(e.to_string())?;
                self.store.update_transfer(&request).await?;
                tracing::warn!(idempotency_key = %request.key, error = %e, "Transfer rejected");
                self.audit
                    .record_failure(correlation_id, AuditAction::TransferFailed, &target, &e)
                    .await?;
                self.notifier
                    .notify(Notification::TransferFailed {
                        key: request.key.clone(),
                        reason: e.to_string(),
                    })
                    .await;
                Next::Settled
            }
        };

        Ok((request, next))
    }

    /// Pending → Failed after the connection was revoked; true if it moved
    async fn cancel(&self, key: &IdempotencyKey, correlation_id: CorrelationId) -> Result<bool> {
        let Some(mut request) = self.store.load_transfer(key).await? else {
            return Ok(false);
        };
        if request.status != TransferStatus::Pending {
            return Ok(false);
        }

        let error =
            CarelinkError::Cancelled(format!("connection {} revoked", request.connection_id));
        let reason = error.to_string();
        request.mark_failed(&reason)?;
        self.store.update_transfer(&request).await?;
        tracing::warn!(idempotency_key = %key, "Pending transfer cancelled");
        self.audit
            .record_failure(
                correlation_id,
                AuditAction::TransferFailed,
                format!("transfer:{key}"),
                &error,
            )
            .await?;
        self.notifier
            .notify(Notification::TransferFailed {
                key: key.clone(),
                reason,
            })
            .await;
        Ok(true)
    }
}

async fn wait_revoked(revoked: &mut watch::Receiver<bool>) {
    // A closed channel means the connection is gone; leave the timer alone
    if revoked.wait_for(|r| *r).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}
