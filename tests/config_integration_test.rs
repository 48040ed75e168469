//! Integration tests for configuration loading and validation
//!
//! Note: Tests that modify environment variables hold ENV_MUTEX to avoid
//! interference between tests.

use carelink::config::{load_config, Environment, StorageBackend};
use carelink::domain::{FieldOwner, JsonType, ReportingCadence};
use secrecy::ExposeSecret;
use std::io::Write;
use std::sync::Mutex;
use tempfile::NamedTempFile;

// Mutex to serialize tests that modify environment variables
static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Helper function to clean up environment variables
fn cleanup_env_vars() {
    std::env::remove_var("CARELINK_APPLICATION_LOG_LEVEL");
    std::env::remove_var("CARELINK_TRANSFER_MAX_ATTEMPTS");
    std::env::remove_var("CARELINK_CONNECTIONS_PRACTICE_A_CLIENT_SECRET");
    std::env::remove_var("TEST_PRACTICE_A_SECRET");
    std::env::remove_var("TEST_PG_URL");
}

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

const CONNECTION: &str = r#"
[[connections]]
id = "practice-a"
organization_code = "A81001"
token_url = "https://auth.example.com/oauth2/token"
client_id = "carelink"
client_secret = "s3cret"
fhir_base_url = "https://fhir.example.com/R4"
transfer_url = "https://pharmacy.example.com/transfers"
compliance_url = "https://reporting.example.com/submissions"
"#;

#[test]
fn test_load_complete_config() {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    cleanup_env_vars();
    std::env::set_var("TEST_PG_URL", "postgresql://carelink:pw@db.internal:5432/carelink");

    let toml_content = r#"
environment = "staging"

[application]
log_level = "debug"
actor = "carelink-staging"

[[connections]]
id = "practice-a"
organization_code = "A81001"
token_url = "https://auth.example.com/oauth2/token"
client_id = "carelink"
client_secret = "s3cret"
scope = "patient/*.read"
fhir_base_url = "https://fhir.example.com/R4"
transfer_url = "https://pharmacy.example.com/transfers"
compliance_url = "https://reporting.example.com/submissions"

[auth]
refresh_margin_seconds = 120

[fhir]
max_pages = 5
revinclude = ["AllergyIntolerance:patient"]

[fhir.retry]
max_attempts = 4
initial_delay_ms = 200
max_delay_ms = 5000

[sync]
parallelism = 8

[sync.field_ownership]
"demographics.family_name" = "external"
"clinical.medications" = "local"

[transfer]
time_bucket_seconds = 1800
max_attempts = 3

[compliance]
cadence = "quarterly"

[[compliance.schemas]]
kind = "falls"
required = { resident_count = "integer", falls = "array" }

[storage]
backend = "postgresql"

[storage.postgresql]
connection_string = "${TEST_PG_URL}"
max_connections = 5

[logging]
local_enabled = false
local_rotation = "hourly"
"#;

    let file = write_config(toml_content);
    let config = load_config(file.path()).unwrap();

    assert_eq!(config.environment, Environment::Staging);
    assert_eq!(config.application.actor, "carelink-staging");
    assert_eq!(config.connections.len(), 1);
    assert_eq!(config.connections[0].scope.as_deref(), Some("patient/*.read"));
    assert!(config.connections[0].tls_verify);
    assert_eq!(config.auth.refresh_margin_seconds, 120);
    assert_eq!(config.fhir.max_pages, 5);
    assert_eq!(config.fhir.retry.max_attempts, 4);
    assert_eq!(config.sync.parallelism, 8);
    assert_eq!(
        config.sync.field_ownership.get("clinical.medications"),
        Some(&FieldOwner::Local)
    );
    assert_eq!(config.transfer.time_bucket_seconds, 1800);
    assert_eq!(config.compliance.cadence, ReportingCadence::Quarterly);
    assert_eq!(
        config.compliance.schemas[0].required.get("resident_count"),
        Some(&JsonType::Integer)
    );
    assert_eq!(config.storage.backend, StorageBackend::PostgreSQL);
    let pg = config.storage.postgresql.as_ref().unwrap();
    assert_eq!(
        pg.connection_string.expose_secret().as_ref(),
        "postgresql://carelink:pw@db.internal:5432/carelink"
    );

    cleanup_env_vars();
}

#[test]
fn test_minimal_config_uses_defaults() {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    cleanup_env_vars();

    let file = write_config(CONNECTION);
    let config = load_config(file.path()).unwrap();

    assert_eq!(config.environment, Environment::Development);
    assert_eq!(config.application.log_level, "info");
    assert_eq!(config.application.actor, "carelink");
    assert_eq!(config.auth.refresh_margin_seconds, 60);
    assert_eq!(config.fhir.max_pages, 20);
    assert_eq!(config.fhir.identifier_system, "https://fhir.nhs.uk/Id/nhs-number");
    assert_eq!(config.transfer.time_bucket_seconds, 3600);
    assert_eq!(config.transfer.max_attempts, 6);
    assert!(config.sync.field_ownership.is_empty());
    assert_eq!(config.storage.backend, StorageBackend::Memory);
}

#[test]
fn test_env_var_substitution_in_secret() {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    cleanup_env_vars();
    std::env::set_var("TEST_PRACTICE_A_SECRET", "from-env");

    let file = write_config(&CONNECTION.replace("\"s3cret\"", "\"${TEST_PRACTICE_A_SECRET}\""));
    let config = load_config(file.path()).unwrap();
    assert_eq!(
        config.connections[0].client_secret.expose_secret().as_ref(),
        "from-env"
    );
    assert!(!format!("{:?}", config.connections[0]).contains("from-env"));

    cleanup_env_vars();
}

#[test]
fn test_missing_env_var_is_reported() {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    cleanup_env_vars();

    let file = write_config(&CONNECTION.replace("\"s3cret\"", "\"${TEST_PRACTICE_A_SECRET}\""));
    let err = load_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("TEST_PRACTICE_A_SECRET"));
}

#[test]
fn test_env_overrides() {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    cleanup_env_vars();
    std::env::set_var("CARELINK_APPLICATION_LOG_LEVEL", "warn");
    std::env::set_var("CARELINK_TRANSFER_MAX_ATTEMPTS", "2");
    std::env::set_var("CARELINK_CONNECTIONS_PRACTICE_A_CLIENT_SECRET", "rotated");

    let file = write_config(CONNECTION);
    let config = load_config(file.path()).unwrap();
    assert_eq!(config.application.log_level, "warn");
    assert_eq!(config.transfer.max_attempts, 2);
    assert_eq!(
        config.connections[0].client_secret.expose_secret().as_ref(),
        "rotated"
    );

    cleanup_env_vars();
}

#[test]
fn test_production_rejects_memory_storage() {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    cleanup_env_vars();

    let file = write_config(&format!("environment = \"production\"\n{CONNECTION}"));
    let err = load_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("memory"));
}

#[test]
fn test_production_rejects_disabled_tls() {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    cleanup_env_vars();

    let content = format!(
        "environment = \"production\"\n{}tls_verify = false\n\n[storage]\nbackend = \"postgresql\"\n\n[storage.postgresql]\nconnection_string = \"postgresql://localhost/carelink\"\n",
        CONNECTION
    );
    let file = write_config(&content);
    let err = load_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("TLS"));
}

#[test]
fn test_duplicate_connection_ids_rejected() {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    cleanup_env_vars();

    let file = write_config(&format!("{CONNECTION}{CONNECTION}"));
    let err = load_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("duplicate connection id"));
}

#[test]
fn test_invalid_url_rejected() {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    cleanup_env_vars();

    let file = write_config(&CONNECTION.replace(
        "https://fhir.example.com/R4",
        "fhir.example.com/R4",
    ));
    let err = load_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("fhir_base_url"));
}

#[test]
fn test_missing_file() {
    let err = load_config("/nonexistent/carelink.toml").unwrap_err();
    assert!(err.to_string().contains("not found"));
}
