//! Transfer command implementation
//!
//! Submits medication-transfer requests, resumes interrupted deliveries and
//! lists requests needing operator action.

use super::{exit_code_for, open_runtime, resolve_connection};
use crate::domain::{
    ConnectionId, CorrelationId, IdempotencyKey, MedicationTransferPayload, TransferOutcome,
    TransferStatus,
};
use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Arguments for the transfer command
#[derive(Args, Debug)]
pub struct TransferArgs {
    #[command(subcommand)]
    pub action: TransferAction,
}

#[derive(Subcommand, Debug)]
pub enum TransferAction {
    /// Submit the transfer described by a JSON payload file
    Submit {
        /// Payload file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Connection to deliver through (defaults to the only configured one)
        #[arg(long)]
        connection: Option<String>,

        /// Wait for background retries to settle before exiting
        #[arg(long)]
        wait: bool,
    },

    /// Re-schedule requests left Pending or Sent by an earlier run and wait for them
    Resume,

    /// Show the stored outcome of a request
    Show {
        /// Idempotency key
        key: String,
    },

    /// List failed requests
    Failed,
}

fn print_outcome(outcome: &TransferOutcome) {
    let marker = match outcome.status {
        TransferStatus::Acked => "✅",
        TransferStatus::Pending | TransferStatus::Sent => "🔄",
        TransferStatus::Failed | TransferStatus::FailedTerminal => "❌",
    };
    println!("{marker} Transfer {}", outcome.key);
    println!("  Status: {}", outcome.status);
    println!("  Retries: {}", outcome.retry_count);
    if outcome.duplicate {
        println!("  Duplicate submission: stored outcome returned");
    }
    if let Some(ack) = &outcome.acknowledgement {
        println!(
            "  Acknowledgement: {} at {}",
            ack.acknowledgement_id,
            ack.received_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    if let Some(reason) = &outcome.failure_reason {
        println!("  Last failure: {reason}");
    }
}

fn exit_code_for_status(status: TransferStatus) -> i32 {
    match status {
        TransferStatus::Acked => 0,
        TransferStatus::Pending | TransferStatus::Sent => 1,
        TransferStatus::Failed | TransferStatus::FailedTerminal => 5,
    }
}

impl TransferArgs {
    /// Execute the transfer command
    pub async fn execute(&self, config_path: &str) -> anyhow::Result<i32> {
        let (config, runtime) = match open_runtime(config_path).await {
            Ok(r) => r,
            Err(code) => return Ok(code),
        };
        let gateway = runtime.gateway();

        match &self.action {
            TransferAction::Submit {
                file,
                connection,
                wait,
            } => {
                let connection = match resolve_connection(&config, connection.as_deref()) {
                    Ok(c) => ConnectionId::new(c)?,
                    Err(e) => {
                        eprintln!("{e}");
                        return Ok(2);
                    }
                };
                let content = tokio::fs::read_to_string(file).await?;
                let payload: MedicationTransferPayload = match serde_json::from_str(&content) {
                    Ok(p) => p,
                    Err(e) => {
                        eprintln!("❌ Invalid transfer payload in {}: {e}", file.display());
                        return Ok(3);
                    }
                };

                let correlation_id = CorrelationId::new();
                tracing::info!(correlation_id = %correlation_id, "Submitting transfer");
                let mut outcome = match gateway
                    .submit_transfer(&connection, payload, correlation_id)
                    .await
                {
                    Ok(o) => o,
                    Err(e) => {
                        eprintln!("❌ Transfer not submitted: {e}");
                        return Ok(exit_code_for(&e));
                    }
                };
                if *wait && !outcome.status.is_final() {
                    println!("⏳ Waiting for retries to settle...");
                    outcome = gateway.await_settled(&outcome.key).await?;
                }
                print_outcome(&outcome);
                println!("  Correlation id: {correlation_id}");
                runtime.shutdown().await;
                Ok(exit_code_for_status(outcome.status))
            }
            TransferAction::Resume => {
                let resumed = gateway.resume_pending().await?;
                println!("🔄 Resumed {resumed} transfer(s)");
                runtime.shutdown().await;
                let failed = gateway.failed_transfers().await?;
                if !failed.is_empty() {
                    println!("⚠️  {} transfer(s) need operator action", failed.len());
                    return Ok(1);
                }
                Ok(0)
            }
            TransferAction::Show { key } => {
                let key = IdempotencyKey::from_existing(key.clone())?;
                match gateway.outcome(&key).await {
                    Ok(outcome) => {
                        print_outcome(&outcome);
                        Ok(0)
                    }
                    Err(e) => {
                        eprintln!("❌ {e}");
                        Ok(exit_code_for(&e))
                    }
                }
            }
            TransferAction::Failed => {
                let failed = gateway.failed_transfers().await?;
                if failed.is_empty() {
                    println!("No failed transfers.");
                    return Ok(0);
                }
                println!("Found {} failed transfer(s):", failed.len());
                println!();
                println!(
                    "{:<66} {:<16} {:<8} {:<40}",
                    "Idempotency Key", "Status", "Retries", "Reason"
                );
                println!("{}", "-".repeat(130));
                for request in failed {
                    println!(
                        "{:<66} {:<16} {:<8} {:<40}",
                        request.key.as_str(),
                        request.status.to_string(),
                        request.retry_count,
                        request.failure_reason.as_deref().unwrap_or("")
                    );
                }
                Ok(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn test_parse_submit_with_wait() {
        let cli = Cli::parse_from(["carelink", "transfer", "submit", "payload.json", "--wait"]);
        let Commands::Transfer(args) = cli.command else {
            panic!("expected transfer");
        };
        assert!(matches!(
            args.action,
            TransferAction::Submit { wait: true, ref file, .. } if file == &PathBuf::from("payload.json")
        ));
    }

    #[test]
    fn test_status_exit_codes() {
        assert_eq!(exit_code_for_status(TransferStatus::Acked), 0);
        assert_eq!(exit_code_for_status(TransferStatus::Pending), 1);
        assert_eq!(exit_code_for_status(TransferStatus::FailedTerminal), 5);
    }
}
