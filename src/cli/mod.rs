//! CLI interface and argument parsing
//!
//! This module provides the command-line interface for Carelink using clap.

pub mod commands;

use clap::{Parser, Subcommand};

/// Carelink - national health-record integration
#[derive(Parser, Debug)]
#[command(name = "carelink")]
#[command(version, about, long_about = None)]
#[command(author = "Carelink Contributors")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "carelink.toml", env = "CARELINK_CONFIG")]
    pub config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "CARELINK_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Reconcile local patients with their national records
    Reconcile(commands::reconcile::ReconcileArgs),

    /// Submit and track medication transfers
    Transfer(commands::transfer::TransferArgs),

    /// Submit the compliance batch for a reporting period
    Compliance(commands::compliance::ComplianceArgs),

    /// Verify the audit chain or print an audit trail
    Audit(commands::audit::AuditArgs),

    /// Revoke, reconnect or test a connection
    Connection(commands::connection::ConnectionArgs),

    /// Show connection, mapping and transfer status
    Status(commands::status::StatusArgs),

    /// Validate configuration file
    ValidateConfig(commands::validate::ValidateArgs),

    /// Check NHS numbers against the Modulus 11 check digit
    CheckNhsNumber(commands::nhs::CheckNhsNumberArgs),
}

impl Commands {
    /// Whether the command needs a configuration file
    pub fn needs_config(&self) -> bool {
        !matches!(self, Commands::CheckNhsNumber(_))
    }
}
