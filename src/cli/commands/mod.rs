//! CLI command implementations
//!
//! Every command returns its process exit code: 0 ok, 1 partial success,
//! 2 configuration error, 3 validation error, 4 connection error, 5 fatal.

pub mod audit;
pub mod compliance;
pub mod connection;
pub mod nhs;
pub mod reconcile;
pub mod status;
pub mod transfer;
pub mod validate;

use crate::config::{load_config, CarelinkConfig};
use crate::domain::CarelinkError;
use crate::runtime::Runtime;

/// Exit code for an error that ended a command
pub fn exit_code_for(error: &CarelinkError) -> i32 {
    match error {
        CarelinkError::Configuration(_) => 2,
        CarelinkError::InvalidIdentifier(_)
        | CarelinkError::Validation(_)
        | CarelinkError::SubmissionRejected { .. } => 3,
        CarelinkError::TerminalAuth { .. }
        | CarelinkError::RetryableAuth { .. }
        | CarelinkError::TransientNetwork { .. }
        | CarelinkError::RateLimited { .. }
        | CarelinkError::ConnectionUnavailable { .. } => 4,
        _ => 5,
    }
}

/// Load the configuration and build the runtime, printing the failure
///
/// `Err` carries the exit code to return.
pub(crate) async fn open_runtime(config_path: &str) -> Result<(CarelinkConfig, Runtime), i32> {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => {
            println!("❌ Failed to load configuration file");
            println!("   Error: {e}");
            return Err(2);
        }
    };

    match Runtime::build(&config).await {
        Ok(runtime) => Ok((config, runtime)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize runtime");
            println!("❌ Failed to initialize: {e}");
            Err(match e {
                CarelinkError::Configuration(_) => 2,
                _ => 4,
            })
        }
    }
}

/// The `--connection` value, or the only configured connection
pub(crate) fn resolve_connection(
    config: &CarelinkConfig,
    requested: Option<&str>,
) -> Result<String, String> {
    match requested {
        Some(id) if config.connection(id).is_some() => Ok(id.to_string()),
        Some(id) => Err(format!("connection '{id}' is not configured")),
        None => match config.connections.as_slice() {
            [only] => Ok(only.id.clone()),
            [] => Err("no connections are configured".to_string()),
            _ => Err("several connections are configured; pass --connection".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(CarelinkError::Configuration("x".into()), 2 ; "configuration")]
    #[test_case(CarelinkError::InvalidIdentifier("x".into()), 3 ; "identifier")]
    #[test_case(CarelinkError::ConnectionUnavailable { connection_id: "a".into(), status: "revoked".into() }, 4 ; "connection")]
    #[test_case(CarelinkError::AuditWriteFailure("disk full".into()), 5 ; "audit")]
    fn test_exit_codes(error: CarelinkError, expected: i32) {
        assert_eq!(exit_code_for(&error), expected);
    }

    #[test]
    fn test_resolve_connection_requires_choice() {
        let config = CarelinkConfig::default();
        assert!(resolve_connection(&config, None).is_err());
        assert!(resolve_connection(&config, Some("practice-a")).is_err());
    }
}
