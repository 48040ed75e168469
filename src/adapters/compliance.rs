//! Compliance-submission endpoint client and item sources

use super::auth::TokenProvider;
use super::http::{build_client, send_error, status_error};
use crate::config::ConnectionConfig;
use crate::domain::{
    CarelinkError, ComplianceItem, ComplianceItemInput, ConnectionId, CorrelationId,
    ReportingPeriod, Result,
};
use crate::log_outbound_call;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-item verdict returned by the endpoint
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemVerdict {
    pub item_id: String,
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Sends a batch of validated items and returns a verdict per item
#[async_trait]
pub trait ComplianceTransport: Send + Sync {
    async fn submit_batch(
        &self,
        period: &ReportingPeriod,
        items: &[ComplianceItem],
        correlation_id: CorrelationId,
    ) -> Result<Vec<ItemVerdict>>;
}

/// Produces the items for a reporting period
#[async_trait]
pub trait ComplianceItemSource: Send + Sync {
    async fn items_for(&self, period: &ReportingPeriod) -> Result<Vec<ComplianceItemInput>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionBody<'a> {
    period: &'a ReportingPeriod,
    items: Vec<SubmittedItem<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmittedItem<'a> {
    item_id: &'a str,
    kind: &'a str,
    payload: &'a Value,
}

#[derive(Deserialize)]
struct SubmissionResponse {
    results: Vec<ItemVerdict>,
}

/// HTTP client for the regulator's submission endpoint
pub struct HttpComplianceClient {
    connection_id: ConnectionId,
    url: String,
    client: Client,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpComplianceClient {
    pub fn new(
        connection: &ConnectionConfig,
        timeout: Duration,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        Ok(Self {
            connection_id: ConnectionId::new(connection.id.clone())?,
            url: connection.compliance_url.clone(),
            client: build_client(timeout, connection.tls_verify, &connection.compliance_url)?,
            tokens,
        })
    }
}

#[async_trait]
impl ComplianceTransport for HttpComplianceClient {
    async fn submit_batch(
        &self,
        period: &ReportingPeriod,
        items: &[ComplianceItem],
        correlation_id: CorrelationId,
    ) -> Result<Vec<ItemVerdict>> {
        let token = self.tokens.token(&self.connection_id, correlation_id).await?;
        let body = SubmissionBody {
            period,
            items: items
                .iter()
                .map(|i| SubmittedItem {
                    item_id: &i.item_id,
                    kind: &i.kind,
                    payload: &i.payload,
                })
                .collect(),
        };

        let started = Instant::now();
        let response = self
            .client
            .post(&self.url)
            .header("Authorization", token.bearer_header())
            .header("X-Correlation-ID", correlation_id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(&self.url, e))?;

        let status = response.status();
        log_outbound_call!("POST", self.url, status.as_u16(), started.elapsed());

        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate(&self.connection_id).await?;
            return Err(CarelinkError::RetryableAuth {
                connection_id: self.connection_id.to_string(),
                message: "compliance endpoint rejected the bearer token".to_string(),
            });
        }

        let headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|e| send_error(&self.url, e))?;
        if !status.is_success() {
            return Err(status_error(&self.url, status, &headers, &text));
        }

        let parsed: SubmissionResponse = serde_json::from_str(&text).map_err(|e| {
            CarelinkError::mapping("SubmissionResponse", format!("invalid response: {e}"))
        })?;
        Ok(parsed.results)
    }
}

/// Reads items from a JSON file holding an array of
/// `{"item_id", "kind", "payload"}` objects
#[derive(Debug, Clone)]
pub struct JsonFileItemSource {
    path: PathBuf,
}

impl JsonFileItemSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ComplianceItemSource for JsonFileItemSource {
    async fn items_for(&self, period: &ReportingPeriod) -> Result<Vec<ComplianceItemInput>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            CarelinkError::Io(format!("Failed to read {}: {e}", self.path.display()))
        })?;
        let items: Vec<ComplianceItemInput> = serde_json::from_str(&content)?;
        tracing::info!(
            period = %period,
            path = %self.path.display(),
            items = items.len(),
            "Loaded compliance items"
        );
        Ok(items)
    }
}
