//! Audit command implementation
//!
//! Verifies the audit hash chain and prints the entries for one correlation id.

use crate::adapters::audit_file::FileAuditLog;
use crate::adapters::storage::{create_stores, AuditSink};
use crate::config::{load_config, StorageBackend};
use crate::core::audit::verify_chain;
use crate::domain::CorrelationId;
use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

/// Arguments for the audit command
#[derive(Args, Debug)]
pub struct AuditArgs {
    /// Read this JSONL audit file instead of the configured store
    #[arg(long, global = true)]
    pub file: Option<PathBuf>,

    #[command(subcommand)]
    pub action: AuditAction,
}

#[derive(Subcommand, Debug)]
pub enum AuditAction {
    /// Check every link of the hash chain
    Verify,

    /// Print the entries sharing a correlation id
    Trail {
        correlation_id: String,
    },
}

impl AuditArgs {
    async fn sink(&self, config_path: &str) -> Result<Arc<dyn AuditSink>, i32> {
        if let Some(path) = &self.file {
            return FileAuditLog::open(path)
                .map(|log| Arc::new(log) as Arc<dyn AuditSink>)
                .map_err(|e| {
                    println!("❌ {e}");
                    5
                });
        }

        let config = match load_config(config_path) {
            Ok(c) => c,
            Err(e) => {
                println!("❌ Failed to load configuration file");
                println!("   Error: {e}");
                return Err(2);
            }
        };
        // The memory backend keeps the audit trail in the configured file
        if config.storage.backend == StorageBackend::Memory {
            return FileAuditLog::open(&config.audit.path)
                .map(|log| Arc::new(log) as Arc<dyn AuditSink>)
                .map_err(|e| {
                    println!("❌ {e}");
                    5
                });
        }
        match create_stores(&config).await {
            Ok(stores) => Ok(stores.audit),
            Err(e) => {
                println!("❌ Failed to connect to database");
                println!("   Error: {e}");
                Err(4)
            }
        }
    }

    /// Execute the audit command
    pub async fn execute(&self, config_path: &str) -> anyhow::Result<i32> {
        let sink = match self.sink(config_path).await {
            Ok(s) => s,
            Err(code) => return Ok(code),
        };

        match &self.action {
            AuditAction::Verify => {
                let entries = sink.all_entries().await?;
                let report = verify_chain(&entries);
                if report.is_intact() {
                    println!("✅ {report}");
                    Ok(0)
                } else {
                    println!("❌ {report}");
                    Ok(5)
                }
            }
            AuditAction::Trail { correlation_id } => {
                let correlation_id: CorrelationId = match correlation_id.parse() {
                    Ok(c) => c,
                    Err(e) => {
                        eprintln!("Invalid correlation id: {e}");
                        return Ok(3);
                    }
                };
                let entries = sink.entries_for(&correlation_id).await?;
                if entries.is_empty() {
                    println!("No audit entries for {correlation_id}.");
                    return Ok(0);
                }
                println!(
                    "{:<8} {:<20} {:<26} {:<10} {:<40}",
                    "Seq", "Timestamp", "Action", "Outcome", "Target"
                );
                println!("{}", "-".repeat(110));
                for entry in entries {
                    println!(
                        "{:<8} {:<20} {:<26} {:<10} {:<40}",
                        entry.sequence,
                        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        entry.action.to_string(),
                        entry.outcome.to_string(),
                        entry.target
                    );
                }
                Ok(0)
            }
        }
    }
}
