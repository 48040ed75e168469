//! Compliance command implementation

use super::{exit_code_for, open_runtime, resolve_connection};
use crate::adapters::compliance::JsonFileItemSource;
use crate::domain::{CorrelationId, ItemStatus, ReportingPeriod};
use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Arguments for the compliance command
#[derive(Args, Debug)]
pub struct ComplianceArgs {
    #[command(subcommand)]
    pub action: ComplianceAction,
}

#[derive(Subcommand, Debug)]
pub enum ComplianceAction {
    /// Validate and submit the items in a JSON file
    Submit {
        /// JSON array of `{"item_id", "kind", "payload"}` objects
        #[arg(long, value_name = "FILE")]
        items: PathBuf,

        /// Reporting period, e.g. 2026-10 or 2026-Q4 (defaults to the current one)
        #[arg(long)]
        period: Option<String>,

        /// Connection whose reporting endpoint receives the batch
        #[arg(long)]
        connection: Option<String>,
    },

    /// Show the stored batch for a period
    Show {
        /// Reporting period
        #[arg(long)]
        period: String,

        #[arg(long)]
        connection: Option<String>,
    },
}

impl ComplianceArgs {
    /// Execute the compliance command
    pub async fn execute(&self, config_path: &str) -> anyhow::Result<i32> {
        let (config, runtime) = match open_runtime(config_path).await {
            Ok(r) => r,
            Err(code) => return Ok(code),
        };

        let (connection, period) = match &self.action {
            ComplianceAction::Submit {
                connection, period, ..
            } => (connection, period.as_deref()),
            ComplianceAction::Show { connection, period } => (connection, Some(period.as_str())),
        };
        let connection = match resolve_connection(&config, connection.as_deref()) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                return Ok(2);
            }
        };
        let submitter = runtime.compliance_submitter(&connection)?;
        let period = match period.map(str::parse::<ReportingPeriod>) {
            None => submitter.current_period(),
            Some(Ok(p)) => p,
            Some(Err(e)) => {
                eprintln!("{e}");
                return Ok(3);
            }
        };

        match &self.action {
            ComplianceAction::Submit { items, .. } => {
                let correlation_id = CorrelationId::new();
                println!("📤 Submitting compliance batch for {period}");
                let source = JsonFileItemSource::new(items);
                let summary = match submitter
                    .run_from_source(&period, &source, correlation_id)
                    .await
                {
                    Ok(s) => s,
                    Err(e) => {
                        eprintln!("❌ Submission failed: {e}");
                        eprintln!("   Correlation id: {correlation_id}");
                        return Ok(exit_code_for(&e));
                    }
                };

                println!();
                println!("📊 Compliance Summary ({}):", summary.period);
                println!("  Submitted: {}", summary.submitted);
                println!("  Rejected: {}", summary.rejected);
                println!("  Invalid: {}", summary.invalid);
                println!("  Previously submitted: {}", summary.previously_submitted);
                println!("  Outstanding: {}", summary.outstanding);
                println!("  Correlation id: {correlation_id}");

                if summary.is_complete() {
                    println!("✅ Batch complete");
                    Ok(0)
                } else {
                    println!("⚠️  Batch incomplete; fix the listed items and run again");
                    Ok(1)
                }
            }
            ComplianceAction::Show { .. } => {
                let Some(batch) = submitter.batch(&period).await? else {
                    println!("No batch stored for {period}.");
                    return Ok(0);
                };
                println!("Batch {} ({} item(s)):", batch.period, batch.items.len());
                println!();
                println!("{:<30} {:<20} {:<12} {:<40}", "Item", "Kind", "Status", "Reason");
                println!("{}", "-".repeat(100));
                for item in &batch.items {
                    println!(
                        "{:<30} {:<20} {:<12} {:<40}",
                        item.item_id,
                        item.kind,
                        item.status.to_string(),
                        item.reason.as_deref().unwrap_or("")
                    );
                }
                let open = batch.items.len() - batch.count(ItemStatus::Submitted);
                Ok(if open == 0 { 0 } else { 1 })
            }
        }
    }
}
