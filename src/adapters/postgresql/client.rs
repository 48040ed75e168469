//! PostgreSQL connection pool
//!
//! Wraps a `deadpool-postgres` pool configured from [`PostgreSQLConfig`],
//! applies the statement timeout to every checked-out connection and runs the
//! schema migration.

use crate::config::PostgreSQLConfig;
use crate::domain::{CarelinkError, Result};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use postgres_native_tls::MakeTlsConnector;
use secrecy::ExposeSecret;
use std::time::Duration;
use tokio_postgres::config::SslMode;
use tokio_postgres::NoTls;

/// Pooled PostgreSQL client
pub struct PostgreSQLClient {
    pool: Pool,
    config: PostgreSQLConfig,
}

impl PostgreSQLClient {
    /// Build the pool; no connection is opened until first use
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unparseable connection string or
    /// an unknown `ssl_mode`, and a storage error if the TLS connector or the
    /// pool cannot be created.
    pub async fn new(config: PostgreSQLConfig) -> Result<Self> {
        let connection_string: &str = config.connection_string.expose_secret().as_ref();
        let mut pg_config: tokio_postgres::Config = connection_string.parse().map_err(|e| {
            CarelinkError::Configuration(format!("Invalid PostgreSQL connection string: {e}"))
        })?;
        pg_config.ssl_mode(parse_ssl_mode(&config.ssl_mode)?);

        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let manager = if config.ssl_mode == "disable" {
            Manager::from_config(pg_config, NoTls, manager_config)
        } else {
            let connector = native_tls::TlsConnector::builder().build().map_err(|e| {
                CarelinkError::Storage(format!("Failed to build TLS connector: {e}"))
            })?;
            Manager::from_config(pg_config, MakeTlsConnector::new(connector), manager_config)
        };

        let timeout = Duration::from_secs(config.connection_timeout_seconds);
        let pool = Pool::builder(manager)
            .max_size(config.max_connections)
            .wait_timeout(Some(timeout))
            .create_timeout(Some(timeout))
            .recycle_timeout(Some(timeout))
            .runtime(deadpool_postgres::Runtime::Tokio1)
            .build()
            .map_err(|e| CarelinkError::Storage(format!("Failed to create connection pool: {e}")))?;

        tracing::info!(
            target_db = %redact_connection_string(connection_string),
            max_connections = config.max_connections,
            ssl_mode = %config.ssl_mode,
            "PostgreSQL pool created"
        );

        Ok(Self { pool, config })
    }

    /// Run `SELECT 1` through the pool
    pub async fn test_connection(&self) -> Result<()> {
        let client = self.get_connection().await?;
        client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| CarelinkError::Storage(format!("Connection test failed: {e}")))?;
        tracing::info!("PostgreSQL connection test successful");
        Ok(())
    }

    /// Apply the bundled migration
    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.get_connection().await?;
        let migration_sql = include_str!("../../../migrations/001_initial_schema.sql");
        client
            .batch_execute(migration_sql)
            .await
            .map_err(|e| CarelinkError::Storage(format!("Failed to execute migration: {e}")))?;
        tracing::info!("PostgreSQL schema initialized");
        Ok(())
    }

    /// Check out a connection with the configured statement timeout applied
    pub async fn get_connection(&self) -> Result<Object> {
        let client = self.pool.get().await.map_err(|e| {
            CarelinkError::Storage(format!("Failed to get connection from pool: {e}"))
        })?;

        client
            .batch_execute(&format!(
                "SET statement_timeout = {}",
                self.config.statement_timeout_seconds * 1000
            ))
            .await
            .map_err(|e| CarelinkError::Storage(format!("Failed to set statement timeout: {e}")))?;

        Ok(client)
    }

    pub fn pool_status(&self) -> deadpool_postgres::Status {
        self.pool.status()
    }
}

fn parse_ssl_mode(mode: &str) -> Result<SslMode> {
    match mode {
        "disable" => Ok(SslMode::Disable),
        "prefer" => Ok(SslMode::Prefer),
        "require" => Ok(SslMode::Require),
        other => Err(CarelinkError::Configuration(format!(
            "Unsupported ssl_mode '{other}'"
        ))),
    }
}

/// Drop credentials from a connection string for logging
pub fn redact_connection_string(connection_string: &str) -> String {
    connection_string
        .rsplit_once('@')
        .map(|(_, host)| format!("postgresql://***@{host}"))
        .unwrap_or_else(|| "postgresql://***".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_connection_string() {
        let safe = redact_connection_string("postgresql://user:p@ss@localhost:5432/carelink");
        assert!(!safe.contains("p@ss"));
        assert_eq!(safe, "postgresql://***@localhost:5432/carelink");
        assert_eq!(redact_connection_string("host=localhost"), "postgresql://***");
    }

    #[test]
    fn test_parse_ssl_mode() {
        assert!(matches!(parse_ssl_mode("require"), Ok(SslMode::Require)));
        assert!(matches!(parse_ssl_mode("disable"), Ok(SslMode::Disable)));
        assert!(parse_ssl_mode("verify-full").is_err());
    }
}
