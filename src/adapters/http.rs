//! Shared HTTP plumbing: client construction and error classification
//!
//! Every outbound protocol client converts `reqwest` failures and non-success
//! statuses through [`send_error`] and [`status_error`], so retry decisions
//! depend only on [`CarelinkError`] classification.

use crate::core::retry::parse_retry_after;
use crate::domain::{CarelinkError, Result};
use chrono::Utc;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, ClientBuilder, StatusCode};
use std::time::Duration;

/// Build an HTTP client with a request timeout and optional TLS verification bypass
pub fn build_client(timeout: Duration, tls_verify: bool, target: &str) -> Result<Client> {
    let mut client_builder = ClientBuilder::new()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(30)))
        .user_agent(concat!("carelink/", env!("CARGO_PKG_VERSION")));

    if !tls_verify {
        tracing::warn!(
            target_url = %target,
            "⚠️  SECURITY WARNING: TLS certificate verification is DISABLED. \
            This configuration is INSECURE and must only be used in development/testing environments."
        );
        client_builder = client_builder.danger_accept_invalid_certs(true);
    }

    client_builder
        .build()
        .map_err(|e| CarelinkError::Configuration(format!("Failed to build HTTP client: {e}")))
}

/// Classify a transport-level failure (connect error, timeout, broken body)
///
/// All of these are transient.
pub fn send_error(target: &str, error: reqwest::Error) -> CarelinkError {
    let message = if error.is_timeout() {
        format!("timed out: {error}")
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        error.to_string()
    };
    CarelinkError::TransientNetwork {
        target: target.to_string(),
        message,
    }
}

/// Classify a non-success HTTP status
///
/// - 429 → [`CarelinkError::RateLimited`] carrying any `Retry-After` hint
/// - 5xx → [`CarelinkError::TransientNetwork`]
/// - other 4xx → [`CarelinkError::Rejected`]
pub fn status_error(
    target: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> CarelinkError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        return CarelinkError::RateLimited {
            target: target.to_string(),
            retry_after,
        };
    }

    if status.is_server_error() {
        return CarelinkError::TransientNetwork {
            target: target.to_string(),
            message: format!("HTTP {status}: {}", truncate(body)),
        };
    }

    CarelinkError::Rejected {
        target: target.to_string(),
        status: status.as_u16(),
        message: truncate(body),
    }
}

/// Keep error bodies short enough for logs and audit detail
fn truncate(body: &str) -> String {
    const LIMIT: usize = 512;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
