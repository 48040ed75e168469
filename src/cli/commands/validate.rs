//! Validate config command implementation
//!
//! This module implements the `validate-config` command for validating
//! the Carelink configuration file.

use crate::config::{load_config, StorageBackend};
use clap::Args;

/// Arguments for the validate-config command
#[derive(Args, Debug)]
pub struct ValidateArgs {}

impl ValidateArgs {
    /// Execute the validate-config command
    ///
    /// Loading already validates every section, so a load failure is reported
    /// as a configuration error.
    pub async fn execute(&self, config_path: &str) -> anyhow::Result<i32> {
        tracing::info!(config_path = %config_path, "Validating configuration");

        println!("🔍 Validating configuration file: {config_path}");
        println!();

        let config = match load_config(config_path) {
            Ok(c) => c,
            Err(e) => {
                println!("❌ Configuration validation failed");
                println!("   Error: {e}");
                println!();
                return Ok(2);
            }
        };

        println!("✅ Configuration is valid");
        println!();
        println!("Configuration Summary:");
        println!("  Environment: {:?}", config.environment);
        println!("  Log Level: {}", config.application.log_level);
        println!("  Audit Actor: {}", config.application.actor);
        println!("  Connections: {}", config.connections.len());
        for connection in &config.connections {
            println!(
                "    - {} ({}) {}",
                connection.id, connection.organization_code, connection.fhir_base_url
            );
            if !connection.tls_verify {
                println!("      ⚠️  TLS verification disabled");
            }
        }

        match config.storage.backend {
            StorageBackend::Memory => {
                println!("  Storage: memory");
                println!("  Audit File: {}", config.audit.path);
            }
            StorageBackend::PostgreSQL => {
                if let Some(ref pg_config) = config.storage.postgresql {
                    use secrecy::ExposeSecret;
                    println!("  Storage: PostgreSQL");
                    println!(
                        "  PostgreSQL Connection: {}",
                        pg_config
                            .connection_string
                            .expose_secret()
                            .as_ref()
                            .split('@')
                            .next_back()
                            .unwrap_or("***")
                    );
                    println!("  Max Connections: {}", pg_config.max_connections);
                }
            }
        }

        println!(
            "  Field Ownership: {}",
            if config.sync.field_ownership.is_empty() {
                "built-in table".to_string()
            } else {
                format!("{} configured field(s)", config.sync.field_ownership.len())
            }
        );
        println!(
            "  Transfer Retries: {} attempt(s), {}ms → {}ms backoff",
            config.transfer.max_attempts,
            config.transfer.initial_backoff_ms,
            config.transfer.max_backoff_ms
        );
        println!(
            "  Compliance: {:?} cadence, {} item schema(s)",
            config.compliance.cadence,
            config.compliance.schemas.len()
        );
        println!();
        Ok(0)
    }
}
