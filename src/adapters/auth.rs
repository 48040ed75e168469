//! OAuth2 client-credentials token exchange

use super::http::{build_client, send_error};
use crate::config::{AuthConfig, ConnectionConfig, SecretString};
use crate::domain::{AccessToken, CarelinkError, ConnectionId, CorrelationId, Result};
use crate::log_outbound_call;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Performs one credential exchange for a single connection
///
/// Implementations classify failures: rejected credentials are
/// [`CarelinkError::TerminalAuth`], anything that may succeed later is
/// [`CarelinkError::RetryableAuth`].
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self) -> Result<AccessToken>;
}

/// Supplies bearer tokens to resource clients
///
/// Resource clients call [`invalidate`](TokenProvider::invalidate) when the
/// server rejects a token with 401 so the next attempt performs a fresh
/// exchange.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(
        &self,
        connection_id: &ConnectionId,
        correlation_id: CorrelationId,
    ) -> Result<AccessToken>;

    async fn invalidate(&self, connection_id: &ConnectionId) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    300
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Token endpoint client using HTTP Basic client authentication
pub struct OAuthTokenClient {
    connection_id: ConnectionId,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
    scope: Option<String>,
    client: Client,
}

impl OAuthTokenClient {
    pub fn new(connection: &ConnectionConfig, auth: &AuthConfig) -> Result<Self> {
        let client = build_client(
            Duration::from_secs(auth.timeout_seconds),
            connection.tls_verify,
            &connection.token_url,
        )?;

        Ok(Self {
            connection_id: ConnectionId::new(connection.id.clone())?,
            token_url: connection.token_url.clone(),
            client_id: connection.client_id.clone(),
            client_secret: connection.client_secret.clone(),
            scope: connection.scope.clone(),
            client,
        })
    }

    fn auth_header_value(&self) -> String {
        let secret: &str = self.client_secret.expose_secret().as_ref();
        let credentials = format!("{}:{}", self.client_id, secret);
        format!(
            "Basic {}",
            general_purpose::STANDARD.encode(credentials.as_bytes())
        )
    }

    fn terminal(&self, message: impl Into<String>) -> CarelinkError {
        CarelinkError::TerminalAuth {
            connection_id: self.connection_id.to_string(),
            message: message.into(),
        }
    }

    fn retryable(&self, message: impl Into<String>) -> CarelinkError {
        CarelinkError::RetryableAuth {
            connection_id: self.connection_id.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl TokenExchanger for OAuthTokenClient {
    async fn exchange(&self) -> Result<AccessToken> {
        let mut form = vec![("grant_type", "client_credentials")];
        if let Some(scope) = self.scope.as_deref() {
            form.push(("scope", scope));
        }

        let started = Instant::now();
        let response = self
            .client
            .post(&self.token_url)
            .header("Authorization", self.auth_header_value())
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| self.retryable(send_error(&self.token_url, e).to_string()))?;

        let status = response.status();
        log_outbound_call!("POST", self.token_url, status.as_u16(), started.elapsed());

        let body = response
            .text()
            .await
            .map_err(|e| self.retryable(format!("Failed to read token response: {e}")))?;

        if !status.is_success() {
            let detail: TokenErrorResponse = serde_json::from_str(&body).unwrap_or_default();
            let reason = match (detail.error, detail.error_description) {
                (Some(e), Some(d)) => format!("{e}: {d}"),
                (Some(e), None) => e,
                _ => format!("HTTP {status}"),
            };
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    self.terminal(format!("credentials rejected ({status}): {reason}"))
                }
                _ => self.retryable(format!("token endpoint returned {status}: {reason}")),
            });
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| self.retryable(format!("Malformed token response: {e}")))?;

        if let Some(token_type) = token.token_type.as_deref() {
            if !token_type.eq_ignore_ascii_case("bearer") {
                return Err(self.terminal(format!("unsupported token type '{token_type}'")));
            }
        }
        if token.access_token.is_empty() {
            return Err(self.retryable("token endpoint returned an empty access_token"));
        }

        tracing::info!(
            connection_id = %self.connection_id,
            expires_in = token.expires_in,
            "Access token issued"
        );

        Ok(AccessToken::new(
            token.access_token,
            Utc::now() + ChronoDuration::seconds(token.expires_in.max(0)),
        ))
    }
}
