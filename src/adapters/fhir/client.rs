//! FHIR R4 search client

use super::mapping::build_bundle;
use crate::adapters::auth::TokenProvider;
use crate::adapters::http::{build_client, send_error, status_error};
use crate::config::{ConnectionConfig, FhirConfig};
use crate::core::retry::RetryPolicy;
use crate::domain::{
    CarelinkError, ConnectionId, CorrelationId, FhirResourceBundle, NhsNumber, Result,
};
use crate::log_outbound_call;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

const FHIR_JSON: &str = "application/fhir+json";

/// Source of remote patient records
#[async_trait]
pub trait ClinicalRecordSource: Send + Sync {
    /// Fetch, validate and map the record for one national identifier
    async fn fetch_patient_record(
        &self,
        nhs_number: &NhsNumber,
        correlation_id: CorrelationId,
    ) -> Result<FhirResourceBundle>;
}

#[derive(Debug, Deserialize)]
struct SearchBundle {
    #[serde(rename = "resourceType")]
    resource_type: String,
    #[serde(default)]
    link: Vec<BundleLink>,
    #[serde(default)]
    entry: Vec<BundleEntry>,
}

#[derive(Debug, Deserialize)]
struct BundleLink {
    relation: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct BundleEntry {
    #[serde(default)]
    resource: Option<Value>,
    #[serde(default)]
    search: Option<EntrySearch>,
}

#[derive(Debug, Deserialize)]
struct EntrySearch {
    #[serde(default)]
    mode: Option<String>,
}

/// One page of search results
#[derive(Debug)]
struct Page {
    resources: Vec<Value>,
    next: Option<Url>,
}

/// Reads patient records from one connection's FHIR endpoint
///
/// Searches `Patient?identifier=<system>|<nhs>` with the configured
/// `_revinclude` parameters and follows `next` links up to `max_pages`.
pub struct FhirClient {
    connection_id: ConnectionId,
    base_url: Url,
    client: Client,
    tokens: Arc<dyn TokenProvider>,
    retry: RetryPolicy,
    max_pages: usize,
    identifier_system: String,
    revinclude: Vec<String>,
}

impl FhirClient {
    pub fn new(
        connection: &ConnectionConfig,
        config: &FhirConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        // A trailing slash makes relative joins append instead of replace
        let mut base = connection.fhir_base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base).map_err(|e| {
            CarelinkError::Configuration(format!(
                "Invalid fhir_base_url for connection {}: {e}",
                connection.id
            ))
        })?;

        Ok(Self {
            connection_id: ConnectionId::new(connection.id.clone())?,
            client: build_client(
                Duration::from_secs(config.timeout_seconds),
                connection.tls_verify,
                base_url.as_str(),
            )?,
            base_url,
            tokens,
            retry: RetryPolicy::from_config(&config.retry),
            max_pages: config.max_pages.max(1),
            identifier_system: config.identifier_system.clone(),
            revinclude: config.revinclude.clone(),
        })
    }

    /// URL of the first search page
    pub fn search_url(&self, nhs_number: &NhsNumber) -> Result<Url> {
        let mut url = self
            .base_url
            .join("Patient")
            .map_err(|e| CarelinkError::Configuration(format!("Invalid FHIR search URL: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(
                "identifier",
                &format!("{}|{}", self.identifier_system, nhs_number.as_str()),
            );
            for include in &self.revinclude {
                query.append_pair("_revinclude", include);
            }
        }
        Ok(url)
    }

    async fn fetch_page(&self, url: &Url, correlation_id: CorrelationId) -> Result<Page> {
        let token = self.tokens.token(&self.connection_id, correlation_id).await?;
        let target = url.path().to_string();

        let started = Instant::now();
        let response = self
            .client
            .get(url.clone())
            .header("Authorization", token.bearer_header())
            .header("Accept", FHIR_JSON)
            .header("X-Correlation-ID", correlation_id.to_string())
            .send()
            .await
            .map_err(|e| send_error(&target, e))?;

        let status = response.status();
        log_outbound_call!("GET", target, status.as_u16(), started.elapsed());

        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate(&self.connection_id).await?;
            return Err(CarelinkError::RetryableAuth {
                connection_id: self.connection_id.to_string(),
                message: "FHIR server rejected the bearer token".to_string(),
            });
        }

        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| send_error(&target, e))?;

        if !status.is_success() {
            return Err(status_error(&target, status, &headers, &body));
        }

        let bundle: SearchBundle = serde_json::from_str(&body)
            .map_err(|e| CarelinkError::mapping("Bundle", format!("invalid search bundle: {e}")))?;
        if bundle.resource_type != "Bundle" {
            return Err(CarelinkError::mapping(
                bundle.resource_type,
                "expected a searchset Bundle",
            ));
        }

        let mut resources = Vec::with_capacity(bundle.entry.len());
        for entry in bundle.entry {
            let Some(resource) = entry.resource else {
                continue;
            };
            let is_outcome = entry.search.and_then(|s| s.mode).as_deref() == Some("outcome");
            if is_outcome
                && resource.get("resourceType").and_then(Value::as_str) == Some("OperationOutcome")
            {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    outcome = %resource,
                    "FHIR search returned an OperationOutcome"
                );
                continue;
            }
            resources.push(resource);
        }

        let next = bundle
            .link
            .iter()
            .find(|l| l.relation == "next")
            .map(|l| {
                self.base_url.join(&l.url).map_err(|e| {
                    CarelinkError::mapping("Bundle", format!("invalid next link '{}': {e}", l.url))
                })
            })
            .transpose()?;

        Ok(Page { resources, next })
    }
}

#[async_trait]
impl ClinicalRecordSource for FhirClient {
    async fn fetch_patient_record(
        &self,
        nhs_number: &NhsNumber,
        correlation_id: CorrelationId,
    ) -> Result<FhirResourceBundle> {
        let mut url = self.search_url(nhs_number)?;
        let mut raw = Vec::new();
        let mut pages = 0usize;

        loop {
            if pages == self.max_pages {
                return Err(CarelinkError::mapping(
                    "Bundle",
                    format!(
                        "search for {} exceeded {} pages",
                        nhs_number.redacted(),
                        self.max_pages
                    ),
                ));
            }

            let page = self
                .retry
                .run("fhir_search_page", || self.fetch_page(&url, correlation_id))
                .await?;
            pages += 1;
            raw.extend(page.resources);

            match page.next {
                Some(next) => url = next,
                None => break,
            }
        }

        tracing::info!(
            connection_id = %self.connection_id,
            nhs_number = %nhs_number.redacted(),
            pages,
            resources = raw.len(),
            "Patient record fetched"
        );

        build_bundle(raw, nhs_number)
    }
}
