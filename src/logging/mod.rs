//! Logging and observability
//!
//! Structured logging through `tracing`, with:
//! - JSON-formatted file logs
//! - Configurable log levels (`RUST_LOG` wins when set)
//! - Local file logging with daily or hourly rotation
//!
//! National identifiers are never logged in full; log sites use
//! [`NhsNumber::redacted`](crate::domain::NhsNumber::redacted).
//!
//! # Example
//!
//! ```no_run
//! use carelink::logging::init_logging;
//! use carelink::config::LoggingConfig;
//!
//! let config = LoggingConfig::default();
//! let _guard = init_logging("info", &config).expect("Failed to initialize logging");
//!
//! tracing::info!(connection_id = "practice-a", "Connection ready");
//! ```

pub mod structured;

pub use structured::{init_logging, LoggingGuard};

/// Log an error with context
///
/// # Example
///
/// ```no_run
/// use carelink::log_error_with_context;
/// use carelink::domain::CarelinkError;
///
/// let error = CarelinkError::Configuration("Invalid config".to_string());
/// log_error_with_context!(&error, "Failed to load configuration");
/// ```
#[macro_export]
macro_rules! log_error_with_context {
    ($error:expr, $context:expr) => {
        tracing::error!(
            error = %$error,
            error_kind = $error.kind(),
            context = $context,
            "Error occurred"
        );
    };
}

/// Log a retry attempt
///
/// # Example
///
/// ```no_run
/// use carelink::log_retry_attempt;
///
/// log_retry_attempt!(2, 4, 2000u64, "HTTP 503");
/// ```
#[macro_export]
macro_rules! log_retry_attempt {
    ($attempt:expr, $max_attempts:expr, $delay_ms:expr, $reason:expr) => {
        tracing::warn!(
            attempt = $attempt,
            max_attempts = $max_attempts,
            delay_ms = $delay_ms,
            reason = %$reason,
            "Retrying operation"
        );
    };
}

/// Log a completed outbound protocol call
///
/// # Example
///
/// ```no_run
/// use carelink::log_outbound_call;
/// use std::time::Duration;
///
/// log_outbound_call!("GET", "https://fhir.example.com/R4/Patient", 200u16, Duration::from_millis(85));
/// ```
#[macro_export]
macro_rules! log_outbound_call {
    ($method:expr, $url:expr, $status:expr, $elapsed:expr) => {
        tracing::debug!(
            method = $method,
            url = %$url,
            status = $status,
            elapsed_ms = $elapsed.as_millis() as u64,
            "Outbound call completed"
        );
    };
}
