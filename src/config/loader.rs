//! Configuration loader with TOML parsing and environment variable overrides

use super::schema::{CarelinkConfig, Environment, StorageBackend};
use crate::config::secret_string;
use crate::domain::errors::CarelinkError;
use crate::domain::result::Result;
use regex::Regex;
use std::fs;
use std::path::Path;

/// Loads configuration from a TOML file
///
/// This function:
/// 1. Reads the TOML file
/// 2. Performs environment variable substitution (${VAR} syntax)
/// 3. Parses the TOML into CarelinkConfig
/// 4. Applies environment variable overrides (CARELINK_* prefix)
/// 5. Validates the configuration
///
/// # Errors
///
/// Returns [`CarelinkError::Configuration`] if the file cannot be read, a
/// referenced variable is unset, parsing fails or validation fails.
///
/// # Examples
///
/// ```no_run
/// use carelink::config::loader::load_config;
///
/// let config = load_config("carelink.toml").expect("Failed to load config");
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<CarelinkConfig> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(CarelinkError::Configuration(format!(
            "Configuration file not found: {}",
            path.display()
        )));
    }

    let contents = fs::read_to_string(path).map_err(|e| {
        CarelinkError::Configuration(format!(
            "Failed to read configuration file {}: {}",
            path.display(),
            e
        ))
    })?;

    parse_config(&contents)
}

/// Parses configuration text; the file-less half of [`load_config`]
pub fn parse_config(contents: &str) -> Result<CarelinkConfig> {
    let contents = substitute_env_vars(contents)?;

    let mut config: CarelinkConfig = toml::from_str(&contents)
        .map_err(|e| CarelinkError::Configuration(format!("Failed to parse TOML: {e}")))?;

    apply_env_overrides(&mut config)?;

    config.validate().map_err(|e| {
        CarelinkError::Configuration(format!("Configuration validation failed: {e}"))
    })?;

    Ok(config)
}

/// Substitutes environment variables in the format ${VAR_NAME}
///
/// Comment lines are copied untouched. Every missing variable is reported in
/// one error.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
        .map_err(|e| CarelinkError::Configuration(format!("Invalid substitution pattern: {e}")))?;
    let mut result = String::new();
    let mut missing_vars: Vec<String> = Vec::new();

    for line in input.lines() {
        if line.trim_start().starts_with('#') {
            result.push_str(line);
            result.push('\n');
            continue;
        }

        let mut processed_line = line.to_string();
        for cap in re.captures_iter(line) {
            let var_name = &cap[1];
            match std::env::var(var_name) {
                Ok(value) => {
                    let placeholder = format!("${{{var_name}}}");
                    processed_line = processed_line.replace(&placeholder, &value);
                }
                Err(_) => {
                    if !missing_vars.iter().any(|v| v == var_name) {
                        missing_vars.push(var_name.to_string());
                    }
                }
            }
        }
        result.push_str(&processed_line);
        result.push('\n');
    }

    if !missing_vars.is_empty() {
        return Err(CarelinkError::Configuration(format!(
            "Missing required environment variables: {}",
            missing_vars.join(", ")
        )));
    }

    Ok(result)
}

/// Environment variable name for a per-connection setting
///
/// `practice-a` + `CLIENT_SECRET` → `CARELINK_CONNECTIONS_PRACTICE_A_CLIENT_SECRET`
fn connection_var(connection_id: &str, key: &str) -> String {
    let id: String = connection_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("CARELINK_CONNECTIONS_{id}_{key}")
}

fn parse_override<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        CarelinkError::Configuration(format!("Invalid value '{value}' for {name}"))
    })
}

/// Applies environment variable overrides using CARELINK_* prefix
///
/// Environment variables follow the pattern: CARELINK_<SECTION>_<KEY>
/// For example: CARELINK_FHIR_MAX_PAGES, CARELINK_STORAGE_BACKEND
fn apply_env_overrides(config: &mut CarelinkConfig) -> Result<()> {
    // Application overrides
    if let Ok(val) = std::env::var("CARELINK_APPLICATION_LOG_LEVEL") {
        config.application.log_level = val;
    }
    if let Ok(val) = std::env::var("CARELINK_APPLICATION_ACTOR") {
        config.application.actor = val;
    }
    if let Ok(val) = std::env::var("CARELINK_ENVIRONMENT") {
        config.environment = match val.to_lowercase().as_str() {
            "development" => Environment::Development,
            "staging" => Environment::Staging,
            "production" => Environment::Production,
            other => {
                return Err(CarelinkError::Configuration(format!(
                    "Invalid value '{other}' for CARELINK_ENVIRONMENT"
                )))
            }
        };
    }

    // Per-connection overrides
    for connection in &mut config.connections {
        if let Ok(val) = std::env::var(connection_var(&connection.id, "CLIENT_SECRET")) {
            connection.client_secret = secret_string(val);
        }
        if let Ok(val) = std::env::var(connection_var(&connection.id, "CLIENT_ID")) {
            connection.client_id = val;
        }
        if let Ok(val) = std::env::var(connection_var(&connection.id, "TLS_VERIFY")) {
            connection.tls_verify = val.parse().unwrap_or(true);
        }
    }

    // Auth overrides
    if let Ok(val) = std::env::var("CARELINK_AUTH_REFRESH_MARGIN_SECONDS") {
        config.auth.refresh_margin_seconds =
            parse_override("CARELINK_AUTH_REFRESH_MARGIN_SECONDS", &val)?;
    }
    if let Ok(val) = std::env::var("CARELINK_AUTH_TIMEOUT_SECONDS") {
        config.auth.timeout_seconds = parse_override("CARELINK_AUTH_TIMEOUT_SECONDS", &val)?;
    }

    // FHIR overrides
    if let Ok(val) = std::env::var("CARELINK_FHIR_TIMEOUT_SECONDS") {
        config.fhir.timeout_seconds = parse_override("CARELINK_FHIR_TIMEOUT_SECONDS", &val)?;
    }
    if let Ok(val) = std::env::var("CARELINK_FHIR_MAX_PAGES") {
        config.fhir.max_pages = parse_override("CARELINK_FHIR_MAX_PAGES", &val)?;
    }
    if let Ok(val) = std::env::var("CARELINK_FHIR_RETRY_MAX_ATTEMPTS") {
        config.fhir.retry.max_attempts =
            parse_override("CARELINK_FHIR_RETRY_MAX_ATTEMPTS", &val)?;
    }

    // Sync overrides
    if let Ok(val) = std::env::var("CARELINK_SYNC_PARALLELISM") {
        config.sync.parallelism = parse_override("CARELINK_SYNC_PARALLELISM", &val)?;
    }

    // Transfer overrides
    if let Ok(val) = std::env::var("CARELINK_TRANSFER_TIME_BUCKET_SECONDS") {
        config.transfer.time_bucket_seconds =
            parse_override("CARELINK_TRANSFER_TIME_BUCKET_SECONDS", &val)?;
    }
    if let Ok(val) = std::env::var("CARELINK_TRANSFER_MAX_ATTEMPTS") {
        config.transfer.max_attempts = parse_override("CARELINK_TRANSFER_MAX_ATTEMPTS", &val)?;
    }

    // Compliance overrides
    if let Ok(val) = std::env::var("CARELINK_COMPLIANCE_CADENCE") {
        config.compliance.cadence = match val.to_lowercase().as_str() {
            "monthly" => crate::domain::ReportingCadence::Monthly,
            "quarterly" => crate::domain::ReportingCadence::Quarterly,
            other => {
                return Err(CarelinkError::Configuration(format!(
                    "Invalid value '{other}' for CARELINK_COMPLIANCE_CADENCE"
                )))
            }
        };
    }

    // Storage overrides
    if let Ok(val) = std::env::var("CARELINK_STORAGE_BACKEND") {
        config.storage.backend = match val.to_lowercase().as_str() {
            "memory" => StorageBackend::Memory,
            "postgresql" => StorageBackend::PostgreSQL,
            other => {
                return Err(CarelinkError::Configuration(format!(
                    "Invalid value '{other}' for CARELINK_STORAGE_BACKEND"
                )))
            }
        };
    }
    if let Some(ref mut pg) = config.storage.postgresql {
        if let Ok(val) = std::env::var("CARELINK_STORAGE_POSTGRESQL_CONNECTION_STRING") {
            pg.connection_string = secret_string(val);
        }
        if let Ok(val) = std::env::var("CARELINK_STORAGE_POSTGRESQL_MAX_CONNECTIONS") {
            pg.max_connections =
                parse_override("CARELINK_STORAGE_POSTGRESQL_MAX_CONNECTIONS", &val)?;
        }
        if let Ok(val) = std::env::var("CARELINK_STORAGE_POSTGRESQL_SSL_MODE") {
            pg.ssl_mode = val;
        }
    }

    // Audit overrides
    if let Ok(val) = std::env::var("CARELINK_AUDIT_PATH") {
        config.audit.path = val;
    }

    // Logging overrides
    if let Ok(val) = std::env::var("CARELINK_LOGGING_LOCAL_ENABLED") {
        config.logging.local_enabled = val.parse().unwrap_or(true);
    }
    if let Ok(val) = std::env::var("CARELINK_LOGGING_LOCAL_PATH") {
        config.logging.local_path = val;
    }
    if let Ok(val) = std::env::var("CARELINK_LOGGING_LOCAL_ROTATION") {
        config.logging.local_rotation = val;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Environment variables are process-global
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const MINIMAL: &str = r#"
[application]
log_level = "info"

[[connections]]
id = "practice-a"
organization_code = "A81001"
token_url = "https://auth.example.com/token"
client_id = "carelink"
client_secret = "${CARELINK_TEST_SECRET}"
fhir_base_url = "https://fhir.example.com/R4"
transfer_url = "https://pharmacy.example.com/transfers"
compliance_url = "https://reporting.example.com/submissions"

[sync.field_ownership]
"demographics.family_name" = "external"
"clinical.medications" = "local"

[[compliance.schemas]]
kind = "falls"
required = { resident_id = "string", injury = "boolean" }
"#;

    #[test]
    fn test_substitute_env_vars() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::set_var("CARELINK_TEST_VAR", "test_value");
        let input = "password = \"${CARELINK_TEST_VAR}\"";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "password = \"test_value\"\n");
        std::env::remove_var("CARELINK_TEST_VAR");
    }

    #[test]
    fn test_substitute_env_vars_reports_all_missing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::remove_var("CARELINK_MISSING_A");
        std::env::remove_var("CARELINK_MISSING_B");
        let input = "a = \"${CARELINK_MISSING_A}\"\nb = \"${CARELINK_MISSING_B}\"";
        let err = substitute_env_vars(input).unwrap_err().to_string();
        assert!(err.contains("CARELINK_MISSING_A"));
        assert!(err.contains("CARELINK_MISSING_B"));
    }

    #[test]
    fn test_substitute_skips_comments() {
        let input = "# secret = \"${CARELINK_NOT_SET_ANYWHERE}\"";
        assert!(substitute_env_vars(input).is_ok());
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config("nonexistent.toml").is_err());
    }

    #[test]
    fn test_load_config_valid() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::set_var("CARELINK_TEST_SECRET", "from-env");

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(MINIMAL.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = load_config(temp_file.path()).unwrap();
        std::env::remove_var("CARELINK_TEST_SECRET");

        assert_eq!(config.connections.len(), 1);
        let conn = config.connection("practice-a").unwrap();
        assert_eq!(conn.client_secret.expose_secret(), "from-env");
        assert!(conn.tls_verify);
        assert_eq!(config.fhir.max_pages, 20);
        assert_eq!(config.transfer.time_bucket_seconds, 3600);
        assert_eq!(
            config.sync.field_ownership.get("clinical.medications"),
            Some(&crate::domain::FieldOwner::Local)
        );
        assert_eq!(config.compliance.schemas[0].required.len(), 2);
    }

    #[test]
    fn test_connection_secret_override() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::set_var("CARELINK_TEST_SECRET", "from-file");
        std::env::set_var("CARELINK_CONNECTIONS_PRACTICE_A_CLIENT_SECRET", "overridden");

        let config = parse_config(MINIMAL).unwrap();

        std::env::remove_var("CARELINK_TEST_SECRET");
        std::env::remove_var("CARELINK_CONNECTIONS_PRACTICE_A_CLIENT_SECRET");
        assert_eq!(
            config.connections[0].client_secret.expose_secret(),
            "overridden"
        );
    }

    #[test]
    fn test_invalid_numeric_override_rejected() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::set_var("CARELINK_FHIR_MAX_PAGES", "lots");
        let result = parse_config("");
        std::env::remove_var("CARELINK_FHIR_MAX_PAGES");
        assert!(matches!(result, Err(CarelinkError::Configuration(_))));
    }

    #[test]
    fn test_connection_var_name() {
        assert_eq!(
            connection_var("practice-a", "CLIENT_SECRET"),
            "CARELINK_CONNECTIONS_PRACTICE_A_CLIENT_SECRET"
        );
    }
}
