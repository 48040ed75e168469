//! Per-connection token cache with single-flight refresh

use crate::adapters::auth::{TokenExchanger, TokenProvider};
use crate::adapters::notification::NotificationSink;
use crate::adapters::storage::{ConnectionStateRecord, ConnectionStateStore};
use crate::config::AuthConfig;
use crate::core::audit::AuditRecorder;
use crate::domain::{
    AccessToken, AuditAction, AuditEvent, AuditOutcome, CarelinkError, ConnectionId,
    ConnectionStatus, CorrelationId, NhsConnection, Notification, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};

/// Failure of the most recent exchange, replayed to callers that waited on it
#[derive(Debug, Clone)]
struct ExchangeFailure {
    terminal: bool,
    message: String,
}

impl ExchangeFailure {
    fn from_error(error: &CarelinkError) -> Self {
        let message = match error {
            CarelinkError::TerminalAuth { message, .. }
            | CarelinkError::RetryableAuth { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            terminal: matches!(error, CarelinkError::TerminalAuth { .. }),
            message,
        }
    }

    fn to_error(&self, connection_id: &ConnectionId) -> CarelinkError {
        let connection_id = connection_id.to_string();
        let message = self.message.clone();
        if self.terminal {
            CarelinkError::TerminalAuth {
                connection_id,
                message,
            }
        } else {
            CarelinkError::RetryableAuth {
                connection_id,
                message,
            }
        }
    }
}

struct ConnectionSlot {
    state: RwLock<NhsConnection>,
    // Held for the whole exchange; guards the outcome of the last attempt
    refresh: Mutex<Option<ExchangeFailure>>,
    // Bumped under `refresh` after every completed exchange
    generation: AtomicU64,
    revoked: watch::Sender<bool>,
    exchanger: Arc<dyn TokenExchanger>,
}

/// Issues bearer tokens per connection
///
/// Each connection has its own state record and refresh lock. While one
/// caller performs the credential exchange, every other caller for the same
/// connection waits for it and receives the same outcome.
pub struct AuthManager {
    slots: StdRwLock<HashMap<ConnectionId, Arc<ConnectionSlot>>>,
    refresh_margin: chrono::Duration,
    exchange_timeout: Duration,
    states: Arc<dyn ConnectionStateStore>,
    audit: Arc<AuditRecorder>,
    notifier: Arc<dyn NotificationSink>,
}

impl AuthManager {
    pub fn new(
        config: &AuthConfig,
        states: Arc<dyn ConnectionStateStore>,
        audit: Arc<AuditRecorder>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            slots: StdRwLock::new(HashMap::new()),
            refresh_margin: chrono::Duration::seconds(config.refresh_margin_seconds as i64),
            exchange_timeout: Duration::from_secs(config.timeout_seconds),
            states,
            audit,
            notifier,
        }
    }

    /// Add a connection, restoring any persisted Degraded or Revoked status
    pub async fn register(
        &self,
        mut connection: NhsConnection,
        exchanger: Arc<dyn TokenExchanger>,
    ) -> Result<()> {
        if let Some(persisted) = self.states.load_connection_state(&connection.id).await? {
            if matches!(
                persisted.status,
                ConnectionStatus::Degraded | ConnectionStatus::Revoked
            ) {
                tracing::warn!(
                    connection_id = %connection.id,
                    status = %persisted.status,
                    reason = persisted.reason.as_deref().unwrap_or(""),
                    "Restoring persisted connection status"
                );
                connection.status = persisted.status;
                connection.status_reason = persisted.reason;
            }
        }

        let (revoked, _) = watch::channel(connection.status == ConnectionStatus::Revoked);
        let id = connection.id.clone();
        let slot = Arc::new(ConnectionSlot {
            state: RwLock::new(connection),
            refresh: Mutex::new(None),
            generation: AtomicU64::new(0),
            revoked,
            exchanger,
        });

        self.slots
            .write()
            .map_err(|_| CarelinkError::Storage("connection registry poisoned".to_string()))?
            .insert(id, slot);
        Ok(())
    }

    fn slot(&self, connection_id: &ConnectionId) -> Result<Arc<ConnectionSlot>> {
        self.slots
            .read()
            .map_err(|_| CarelinkError::Storage("connection registry poisoned".to_string()))?
            .get(connection_id)
            .cloned()
            .ok_or_else(|| CarelinkError::NotFound(format!("connection {connection_id}")))
    }

    /// Registered connection ids
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.slots
            .read()
            .map(|slots| slots.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Return a token valid for longer than the refresh margin
    ///
    /// # Errors
    ///
    /// - [`CarelinkError::ConnectionUnavailable`] when the connection is
    ///   Degraded or Revoked; no exchange is attempted
    /// - [`CarelinkError::TerminalAuth`] when the credentials were rejected
    /// - [`CarelinkError::RetryableAuth`] for network failures, timeouts and 5xx
    pub async fn obtain_token(
        &self,
        connection_id: &ConnectionId,
        correlation_id: CorrelationId,
    ) -> Result<AccessToken> {
        let slot = self.slot(connection_id)?;

        if let Some(token) = self.cached(&slot).await? {
            return Ok(token);
        }

        let observed = slot.generation.load(Ordering::SeqCst);
        let mut last_failure = slot.refresh.lock().await;

        // An exchange finished while we waited: share its outcome
        if slot.generation.load(Ordering::SeqCst) != observed {
            if let Some(failure) = last_failure.as_ref() {
                return Err(failure.to_error(connection_id));
            }
        }
        if let Some(token) = self.cached(&slot).await? {
            return Ok(token);
        }

        let prior_status = {
            let mut state = slot.state.write().await;
            let prior = state.status;
            state.status = ConnectionStatus::Refreshing;
            prior
        };

        tracing::debug!(connection_id = %connection_id, "Exchanging client credentials");
        let outcome = match tokio::time::timeout(self.exchange_timeout, slot.exchanger.exchange())
            .await
        {
            Ok(result) => result,
            Err(_) => Err(CarelinkError::RetryableAuth {
                connection_id: connection_id.to_string(),
                message: format!(
                    "token exchange timed out after {}s",
                    self.exchange_timeout.as_secs()
                ),
            }),
        };

        let result = self
            .apply_exchange(&slot, connection_id, correlation_id, prior_status, outcome)
            .await;

        *last_failure = result.as_ref().err().map(ExchangeFailure::from_error);
        slot.generation.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn cached(&self, slot: &ConnectionSlot) -> Result<Option<AccessToken>> {
        let state = slot.state.read().await;
        match state.status {
            ConnectionStatus::Degraded | ConnectionStatus::Revoked => {
                Err(CarelinkError::ConnectionUnavailable {
                    connection_id: state.id.to_string(),
                    status: state.status.to_string(),
                })
            }
            _ => Ok(state
                .usable_token(self.refresh_margin, Utc::now())
                .cloned()),
        }
    }

    async fn apply_exchange(
        &self,
        slot: &ConnectionSlot,
        connection_id: &ConnectionId,
        correlation_id: CorrelationId,
        prior_status: ConnectionStatus,
        outcome: Result<AccessToken>,
    ) -> Result<AccessToken> {
        match outcome {
            Ok(token) => {
                let recorded = self
                    .audit
                    .record(
                        AuditEvent::new(
                            correlation_id,
                            AuditAction::TokenExchange,
                            format!("connection:{connection_id}"),
                            AuditOutcome::Succeeded,
                        )
                        .with_detail(serde_json::json!({
                            "expires_at": token.expires_at().to_rfc3339(),
                        })),
                    )
                    .await;

                let mut state = slot.state.write().await;
                if let Err(e) = recorded {
                    state.status = prior_status;
                    return Err(e);
                }
                state.status = ConnectionStatus::Active;
                state.token = Some(token.clone());
                state.last_refreshed_at = Some(Utc::now());
                state.status_reason = None;
                Ok(token)
            }
            Err(error @ CarelinkError::TerminalAuth { .. }) => {
                let reason = ExchangeFailure::from_error(&error).message;
                {
                    let mut state = slot.state.write().await;
                    state.status = ConnectionStatus::Degraded;
                    state.token = None;
                    state.status_reason = Some(reason.clone());
                }
                tracing::error!(
                    connection_id = %connection_id,
                    reason = %reason,
                    "Credentials rejected; connection degraded until reconnected"
                );

                self.persist(connection_id, ConnectionStatus::Degraded, Some(reason.clone()))
                    .await?;
                self.audit
                    .record_failure(
                        correlation_id,
                        AuditAction::TokenExchange,
                        format!("connection:{connection_id}"),
                        &error,
                    )
                    .await?;
                self.audit
                    .record_simple(
                        correlation_id,
                        AuditAction::ConnectionDegraded,
                        format!("connection:{connection_id}"),
                        AuditOutcome::Succeeded,
                    )
                    .await?;
                self.notifier
                    .notify(Notification::ConnectionDegraded {
                        connection_id: connection_id.clone(),
                        reason,
                    })
                    .await;
                Err(error)
            }
            Err(error) => {
                slot.state.write().await.status = prior_status;
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %error,
                    "Token exchange failed; will retry on next request"
                );
                self.audit
                    .record_failure(
                        correlation_id,
                        AuditAction::TokenExchange,
                        format!("connection:{connection_id}"),
                        &error,
                    )
                    .await?;
                Err(error)
            }
        }
    }

    async fn persist(
        &self,
        connection_id: &ConnectionId,
        status: ConnectionStatus,
        reason: Option<String>,
    ) -> Result<()> {
        self.states
            .save_connection_state(&ConnectionStateRecord {
                connection_id: connection_id.clone(),
                status,
                reason,
                updated_at: Utc::now(),
            })
            .await
    }

    /// Drop the cached token, e.g. after the resource server answered 401
    pub async fn invalidate(&self, connection_id: &ConnectionId) -> Result<()> {
        let slot = self.slot(connection_id)?;
        slot.state.write().await.token = None;
        tracing::info!(connection_id = %connection_id, "Cached token invalidated");
        Ok(())
    }

    /// Withdraw access and fire the revocation signal
    ///
    /// Retry timers waiting on the signal cancel their transfers; use
    /// [`MedicationTransferGateway::revoke_connection`](crate::core::transfer::MedicationTransferGateway::revoke_connection)
    /// to learn how many were cancelled.
    pub async fn revoke(
        &self,
        connection_id: &ConnectionId,
        reason: &str,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        let slot = self.slot(connection_id)?;
        let _refresh = slot.refresh.lock().await;
        {
            let mut state = slot.state.write().await;
            state.status = ConnectionStatus::Revoked;
            state.token = None;
            state.status_reason = Some(reason.to_string());
        }
        slot.revoked.send_replace(true);

        self.persist(connection_id, ConnectionStatus::Revoked, Some(reason.to_string()))
            .await?;
        self.audit
            .record(
                AuditEvent::new(
                    correlation_id,
                    AuditAction::ConnectionRevoked,
                    format!("connection:{connection_id}"),
                    AuditOutcome::Succeeded,
                )
                .with_detail(serde_json::json!({ "reason": reason })),
            )
            .await?;
        self.notifier
            .notify(Notification::ConnectionRevoked {
                connection_id: connection_id.clone(),
                reason: reason.to_string(),
            })
            .await;

        tracing::warn!(connection_id = %connection_id, reason = %reason, "Connection revoked");
        Ok(())
    }

    /// Operator action: return a Degraded or Revoked connection to Active
    pub async fn reconnect(
        &self,
        connection_id: &ConnectionId,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        let slot = self.slot(connection_id)?;
        let mut last_failure = slot.refresh.lock().await;
        let previous = {
            let mut state = slot.state.write().await;
            let previous = state.status;
            state.status = ConnectionStatus::Active;
            state.token = None;
            state.status_reason = None;
            previous
        };
        *last_failure = None;
        slot.revoked.send_replace(false);

        self.persist(connection_id, ConnectionStatus::Active, None)
            .await?;
        self.audit
            .record(
                AuditEvent::new(
                    correlation_id,
                    AuditAction::ConnectionReconnected,
                    format!("connection:{connection_id}"),
                    AuditOutcome::Succeeded,
                )
                .with_detail(serde_json::json!({ "previous_status": previous.to_string() })),
            )
            .await?;

        tracing::info!(connection_id = %connection_id, previous = %previous, "Connection reconnected");
        Ok(())
    }

    pub async fn status(&self, connection_id: &ConnectionId) -> Result<ConnectionStatus> {
        Ok(self.slot(connection_id)?.state.read().await.status)
    }

    /// Snapshot of the connection record
    pub async fn connection(&self, connection_id: &ConnectionId) -> Result<NhsConnection> {
        Ok(self.slot(connection_id)?.state.read().await.clone())
    }

    /// Receiver that flips to `true` when the connection is revoked
    pub fn revocation_signal(&self, connection_id: &ConnectionId) -> Result<watch::Receiver<bool>> {
        Ok(self.slot(connection_id)?.revoked.subscribe())
    }
}

#[async_trait]
impl TokenProvider for AuthManager {
    async fn token(
        &self,
        connection_id: &ConnectionId,
        correlation_id: CorrelationId,
    ) -> Result<AccessToken> {
        self.obtain_token(connection_id, correlation_id).await
    }

    async fn invalidate(&self, connection_id: &ConnectionId) -> Result<()> {
        AuthManager::invalidate(self, connection_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::notification::RecordingNotifier;
    use crate::adapters::storage::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    struct FakeExchanger {
        calls: AtomicUsize,
        delay: Duration,
        fail_with: Option<bool>,
    }

    impl FakeExchanger {
        fn ok(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(delay_ms),
                fail_with: None,
            })
        }

        fn failing(terminal: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(100),
                fail_with: Some(terminal),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenExchanger for FakeExchanger {
        async fn exchange(&self) -> Result<AccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match self.fail_with {
                Some(true) => Err(CarelinkError::TerminalAuth {
                    connection_id: "a".into(),
                    message: "invalid_client".into(),
                }),
                Some(false) => Err(CarelinkError::RetryableAuth {
                    connection_id: "a".into(),
                    message: "HTTP 503".into(),
                }),
                None => Ok(AccessToken::new(
                    format!("token-{n}"),
                    Utc::now() + chrono::Duration::minutes(10),
                )),
            }
        }
    }

    async fn manager(
        exchanger: Arc<FakeExchanger>,
    ) -> (Arc<AuthManager>, Arc<MemoryStore>, Arc<RecordingNotifier>, ConnectionId) {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let audit = Arc::new(AuditRecorder::new(store.clone(), "carelink"));
        let auth = Arc::new(AuthManager::new(
            &AuthConfig::default(),
            store.clone(),
            audit,
            notifier.clone(),
        ));
        let id = ConnectionId::new("a").unwrap();
        auth.register(NhsConnection::new(id.clone(), "A81001"), exchanger)
            .await
            .unwrap();
        (auth, store, notifier, id)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_exchange() {
        let exchanger = FakeExchanger::ok(100);
        let (auth, _, _, id) = manager(exchanger.clone()).await;

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let auth = auth.clone();
                let id = id.clone();
                tokio::spawn(async move { auth.obtain_token(&id, CorrelationId::new()).await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().secret(), "token-0");
        }
        assert_eq!(exchanger.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiters_share_a_failed_exchange() {
        let exchanger = FakeExchanger::failing(false);
        let (auth, _, _, id) = manager(exchanger.clone()).await;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let auth = auth.clone();
                let id = id.clone();
                tokio::spawn(async move { auth.obtain_token(&id, CorrelationId::new()).await })
            })
            .collect();
        for task in tasks {
            assert!(matches!(
                task.await.unwrap(),
                Err(CarelinkError::RetryableAuth { .. })
            ));
        }
        assert_eq!(exchanger.calls(), 1);
        assert_eq!(auth.status(&id).await.unwrap(), ConnectionStatus::Active);
    }

    #[tokio::test]
    async fn test_cached_token_reused() {
        let exchanger = FakeExchanger::ok(0);
        let (auth, _, _, id) = manager(exchanger.clone()).await;
        auth.obtain_token(&id, CorrelationId::new()).await.unwrap();
        auth.obtain_token(&id, CorrelationId::new()).await.unwrap();
        assert_eq!(exchanger.calls(), 1);

        auth.invalidate(&id).await.unwrap();
        let token = auth.obtain_token(&id, CorrelationId::new()).await.unwrap();
        assert_eq!(token.secret(), "token-1");
    }

    #[tokio::test]
    async fn test_terminal_failure_degrades_until_reconnect() {
        let exchanger = FakeExchanger::failing(true);
        let (auth, store, notifier, id) = manager(exchanger.clone()).await;

        let err = auth.obtain_token(&id, CorrelationId::new()).await.unwrap_err();
        assert!(matches!(err, CarelinkError::TerminalAuth { .. }));
        assert_eq!(auth.status(&id).await.unwrap(), ConnectionStatus::Degraded);

        // No automatic refresh while degraded
        let err = auth.obtain_token(&id, CorrelationId::new()).await.unwrap_err();
        assert!(matches!(err, CarelinkError::ConnectionUnavailable { .. }));
        assert_eq!(exchanger.calls(), 1);

        let persisted = store.load_connection_state(&id).await.unwrap().unwrap();
        assert_eq!(persisted.status, ConnectionStatus::Degraded);
        assert!(matches!(
            notifier.events().as_slice(),
            [Notification::ConnectionDegraded { .. }]
        ));

        auth.reconnect(&id, CorrelationId::new()).await.unwrap();
        assert_eq!(auth.status(&id).await.unwrap(), ConnectionStatus::Active);
        let _ = auth.obtain_token(&id, CorrelationId::new()).await;
        assert_eq!(exchanger.calls(), 2);
    }

    #[tokio::test]
    async fn test_revoke_fires_signal() {
        let (auth, store, _, id) = manager(FakeExchanger::ok(0)).await;
        let mut signal = auth.revocation_signal(&id).unwrap();

        auth.revoke(&id, "practice left the scheme", CorrelationId::new())
            .await
            .unwrap();
        signal.changed().await.unwrap();
        assert!(*signal.borrow());

        assert!(matches!(
            auth.obtain_token(&id, CorrelationId::new()).await,
            Err(CarelinkError::ConnectionUnavailable { .. })
        ));

        // A fresh manager over the same store restores Revoked
        let audit = Arc::new(AuditRecorder::new(store.clone(), "carelink"));
        let restored = AuthManager::new(
            &AuthConfig::default(),
            store.clone(),
            audit,
            Arc::new(RecordingNotifier::new()),
        );
        restored
            .register(NhsConnection::new(id.clone(), "A81001"), FakeExchanger::ok(0))
            .await
            .unwrap();
        assert_eq!(restored.status(&id).await.unwrap(), ConnectionStatus::Revoked);
        assert!(*restored.revocation_signal(&id).unwrap().borrow());
    }

    #[tokio::test]
    async fn test_token_exchange_is_audited() {
        let (auth, store, _, id) = manager(FakeExchanger::ok(0)).await;
        let correlation = CorrelationId::new();
        auth.obtain_token(&id, correlation).await.unwrap();

        let trail = crate::adapters::storage::AuditSink::entries_for(store.as_ref(), &correlation)
            .await
            .unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, AuditAction::TokenExchange);
        assert_eq!(trail[0].outcome, AuditOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let (auth, _, _, _) = manager(FakeExchanger::ok(0)).await;
        let other = ConnectionId::new("missing").unwrap();
        assert!(matches!(
            auth.obtain_token(&other, CorrelationId::new()).await,
            Err(CarelinkError::NotFound(_))
        ));
    }
}
