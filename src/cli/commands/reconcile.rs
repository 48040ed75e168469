//! Reconcile command implementation
//!
//! Pulls remote records for the given patients (or every active mapping) and
//! applies externally owned fields to the local store.

use super::{exit_code_for, open_runtime, resolve_connection};
use crate::core::sync::ReconcileOutcome;
use crate::domain::{CorrelationId, PatientId};
use clap::Args;

/// Arguments for the reconcile command
#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Local patient ids to reconcile
    #[arg(value_name = "PATIENT_ID", required_unless_present = "all")]
    pub patients: Vec<String>,

    /// Reconcile every active mapping
    #[arg(long, conflicts_with = "patients")]
    pub all: bool,

    /// Connection to read from (defaults to the only configured one)
    #[arg(long)]
    pub connection: Option<String>,

    /// Concurrent reconciliations (defaults to sync.parallelism)
    #[arg(long)]
    pub parallelism: Option<usize>,
}

impl ReconcileArgs {
    /// Execute the reconcile command
    pub async fn execute(&self, config_path: &str) -> anyhow::Result<i32> {
        tracing::info!("Starting reconcile command");

        let (config, runtime) = match open_runtime(config_path).await {
            Ok(r) => r,
            Err(code) => return Ok(code),
        };
        let connection = match resolve_connection(&config, self.connection.as_deref()) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                return Ok(2);
            }
        };
        let orchestrator = runtime.sync_orchestrator(&connection)?;
        let parallelism = self.parallelism.unwrap_or(config.sync.parallelism).max(1);

        // A single patient gets the detailed outcome
        if let [single] = self.patients.as_slice() {
            let patient_id = match PatientId::new(single.clone()) {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("{e}");
                    return Ok(3);
                }
            };
            let correlation_id = CorrelationId::new();
            return match orchestrator.reconcile(&patient_id, correlation_id).await {
                Ok(ReconcileOutcome::Unchanged { version }) => {
                    println!("✅ {patient_id}: unchanged (version {version})");
                    Ok(0)
                }
                Ok(ReconcileOutcome::Applied {
                    version,
                    fields_written,
                    preserved,
                    ambiguous,
                }) => {
                    println!(
                        "✅ {patient_id}: applied version {version}, {fields_written} field(s) written"
                    );
                    if !preserved.is_empty() {
                        println!("   Preserved local fields: {}", preserved.join(", "));
                    }
                    if !ambiguous.is_empty() {
                        println!("   ⚠️  Fields without an owner: {}", ambiguous.join(", "));
                    }
                    println!("   Correlation id: {correlation_id}");
                    Ok(0)
                }
                Err(e) => {
                    eprintln!("❌ {patient_id}: {e}");
                    eprintln!("   Correlation id: {correlation_id}");
                    Ok(exit_code_for(&e))
                }
            };
        }

        println!("🚀 Starting reconciliation...");
        let summary = if self.all {
            orchestrator.reconcile_all(parallelism).await?
        } else {
            let mut ids = Vec::with_capacity(self.patients.len());
            for raw in &self.patients {
                match PatientId::new(raw.clone()) {
                    Ok(p) => ids.push(p),
                    Err(e) => {
                        eprintln!("{e}");
                        return Ok(3);
                    }
                }
            }
            orchestrator.reconcile_many(ids, parallelism).await?
        };
        summary.log_summary();

        println!();
        println!("📊 Reconciliation Summary:");
        println!("  Total: {}", summary.total);
        println!("  Applied: {}", summary.applied);
        println!("  Unchanged: {}", summary.unchanged);
        println!("  Failed: {}", summary.failed.len());
        println!("  Duration: {:.2}s", summary.duration.as_secs_f64());
        if !summary.failed.is_empty() {
            println!();
            println!("⚠️  Failures:");
            for failure in &summary.failed {
                println!(
                    "  - {} [{}]: {}",
                    failure.patient_id, failure.error_kind, failure.message
                );
            }
        }

        Ok(if summary.is_success() { 0 } else { 1 })
    }
}

#[cfg(test)]
mod tests {
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn test_parse_patient_list() {
        let cli = Cli::parse_from(["carelink", "reconcile", "res-1", "res-2"]);
        let Commands::Reconcile(args) = cli.command else {
            panic!("expected reconcile");
        };
        assert_eq!(args.patients, vec!["res-1", "res-2"]);
        assert!(!args.all);
    }

    #[test]
    fn test_all_conflicts_with_patients() {
        assert!(Cli::try_parse_from(["carelink", "reconcile", "--all", "res-1"]).is_err());
        assert!(Cli::try_parse_from(["carelink", "reconcile"]).is_err());
    }
}
