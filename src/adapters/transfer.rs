//! Medication-transfer endpoint client

use super::auth::TokenProvider;
use super::http::{build_client, send_error, status_error};
use crate::config::ConnectionConfig;
use crate::domain::{
    Acknowledgement, CarelinkError, ConnectionId, CorrelationId, MedicationTransferRequest, Result,
};
use crate::log_outbound_call;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Delivers one transfer request to the receiving organisation
///
/// Errors follow the shared classification: retryable failures are
/// re-scheduled by the gateway, [`CarelinkError::SubmissionRejected`] is final.
#[async_trait]
pub trait TransferTransport: Send + Sync {
    async fn deliver(
        &self,
        request: &MedicationTransferRequest,
        correlation_id: CorrelationId,
    ) -> Result<Acknowledgement>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckResponse {
    acknowledgement_id: String,
    #[serde(default)]
    received_at: Option<DateTime<Utc>>,
}

/// HTTP transport posting the payload with an `Idempotency-Key` header
///
/// The receiver answers 2xx with an acknowledgement, or 409 with the
/// acknowledgement of an earlier delivery under the same key.
pub struct HttpTransferClient {
    connection_id: ConnectionId,
    url: String,
    client: Client,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpTransferClient {
    pub fn new(
        connection: &ConnectionConfig,
        timeout: Duration,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        Ok(Self {
            connection_id: ConnectionId::new(connection.id.clone())?,
            url: connection.transfer_url.clone(),
            client: build_client(timeout, connection.tls_verify, &connection.transfer_url)?,
            tokens,
        })
    }
}

#[async_trait]
impl TransferTransport for HttpTransferClient {
    async fn deliver(
        &self,
        request: &MedicationTransferRequest,
        correlation_id: CorrelationId,
    ) -> Result<Acknowledgement> {
        let token = self.tokens.token(&self.connection_id, correlation_id).await?;

        let started = Instant::now();
        let response = self
            .client
            .post(&self.url)
            .header("Authorization", token.bearer_header())
            .header("Idempotency-Key", request.key.as_str())
            .header("X-Correlation-ID", correlation_id.to_string())
            .json(&request.payload)
            .send()
            .await
            .map_err(|e| send_error(&self.url, e))?;

        let status = response.status();
        log_outbound_call!("POST", self.url, status.as_u16(), started.elapsed());

        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate(&self.connection_id).await?;
            return Err(CarelinkError::RetryableAuth {
                connection_id: self.connection_id.to_string(),
                message: "transfer endpoint rejected the bearer token".to_string(),
            });
        }

        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| send_error(&self.url, e))?;

        if status.is_success() || status == StatusCode::CONFLICT {
            let ack: AckResponse = serde_json::from_str(&body).map_err(|e| {
                CarelinkError::mapping("Acknowledgement", format!("invalid acknowledgement: {e}"))
            })?;
            if status == StatusCode::CONFLICT {
                tracing::info!(
                    idempotency_key = %request.key,
                    acknowledgement_id = %ack.acknowledgement_id,
                    "Receiver reported an earlier delivery"
                );
            }
            return Ok(Acknowledgement {
                acknowledgement_id: ack.acknowledgement_id,
                received_at: ack.received_at.unwrap_or_else(Utc::now),
            });
        }

        match status_error(&self.url, status, &headers, &body) {
            CarelinkError::Rejected { message, .. } => Err(CarelinkError::SubmissionRejected {
                item: format!("transfer:{}", request.key),
                reason: format!("HTTP {status}: {message}"),
            }),
            other => Err(other),
        }
    }
}
