//! Configuration management for Carelink.
//!
//! # Overview
//!
//! Carelink uses TOML configuration files with support for:
//! - Environment variable substitution (`${VAR_NAME}`)
//! - `CARELINK_<SECTION>_<KEY>` overrides, including per-connection secrets
//!   (`CARELINK_CONNECTIONS_<ID>_CLIENT_SECRET`)
//! - Default values for optional settings
//! - Validation on load
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use carelink::config::load_config;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("carelink.toml")?;
//!
//! for connection in &config.connections {
//!     println!("{} -> {}", connection.id, connection.fhir_base_url);
//! }
//! println!("Transfer retry budget: {}", config.transfer.max_attempts);
//! # Ok(())
//! # }
//! ```
//!
//! # Example Configuration
//!
//! ```toml
//! environment = "production"
//!
//! [application]
//! log_level = "info"
//! actor = "carelink"
//!
//! [[connections]]
//! id = "practice-a"
//! organization_code = "A81001"
//! token_url = "https://auth.example.nhs.uk/oauth2/token"
//! client_id = "carelink"
//! client_secret = "${PRACTICE_A_CLIENT_SECRET}"
//! fhir_base_url = "https://fhir.example.nhs.uk/R4"
//! transfer_url = "https://pharmacy.example.com/api/transfers"
//! compliance_url = "https://reporting.example.gov.uk/api/submissions"
//!
//! [sync.field_ownership]
//! "demographics.family_name" = "external"
//! "clinical.medications" = "local"
//!
//! [storage]
//! backend = "postgresql"
//!
//! [storage.postgresql]
//! connection_string = "${CARELINK_PG_URL}"
//! ```

pub mod loader;
pub mod schema;
pub mod secret;

// Re-export commonly used types
pub use loader::{load_config, parse_config};
pub use schema::{
    ApplicationConfig, AuditConfig, AuthConfig, CarelinkConfig, ComplianceConfig,
    ConnectionConfig, Environment, FhirConfig, ItemSchemaConfig, LoggingConfig,
    PostgreSQLConfig, RetryConfig, StorageBackend, StorageConfig, SyncConfig, TransferConfig,
};
pub use secret::{secret_string, SecretString, SecretValue};
