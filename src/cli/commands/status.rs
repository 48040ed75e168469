//! Status command implementation
//!
//! This module implements the `status` command: connection states, mapping
//! counts and transfer queue depth.

use super::open_runtime;
use crate::domain::{ConnectionStatus, SyncStatus, TransferStatus};
use clap::Args;
use std::collections::BTreeMap;

/// Arguments for the status command
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Only show this connection
    #[arg(long)]
    pub connection: Option<String>,
}

impl StatusArgs {
    /// Execute the status command
    pub async fn execute(&self, config_path: &str) -> anyhow::Result<i32> {
        tracing::info!("Checking status");

        println!("📊 Carelink Status");
        println!();

        let (_, runtime) = match open_runtime(config_path).await {
            Ok(r) => r,
            Err(code) => return Ok(code),
        };

        let mut ids = runtime.auth().connection_ids();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        if let Some(ref only) = self.connection {
            ids.retain(|id| id.as_str() == only);
        }
        if ids.is_empty() {
            println!("No matching connections configured.");
            return Ok(0);
        }

        let mut unhealthy = false;
        println!(
            "{:<24} {:<12} {:<12} {:<25} {:<30}",
            "Connection", "Organization", "Status", "Token Expires", "Reason"
        );
        println!("{}", "-".repeat(105));
        for id in &ids {
            let connection = runtime.auth().connection(id).await?;
            let status = match connection.status {
                ConnectionStatus::Active => "✅ active",
                ConnectionStatus::Refreshing => "🔄 refreshing",
                ConnectionStatus::Degraded => {
                    unhealthy = true;
                    "⚠️  degraded"
                }
                ConnectionStatus::Revoked => {
                    unhealthy = true;
                    "❌ revoked"
                }
            };
            let expires = connection
                .token
                .as_ref()
                .map(|t| t.expires_at().format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<24} {:<12} {:<12} {:<25} {:<30}",
                id.as_str(),
                connection.organization_code,
                status,
                expires,
                connection.status_reason.as_deref().unwrap_or("")
            );
        }
        println!();

        let stores = runtime.stores();
        let mut mappings: BTreeMap<String, usize> = BTreeMap::new();
        for mapping in stores.mappings.list_mappings().await? {
            *mappings.entry(mapping.sync_status.to_string()).or_default() += 1;
        }
        println!("Patient mappings:");
        if mappings.is_empty() {
            println!("  none");
        }
        for (status, count) in &mappings {
            println!("  {status}: {count}");
        }
        if mappings.contains_key(&SyncStatus::Conflict.to_string()) {
            unhealthy = true;
        }
        println!();

        println!("Transfers:");
        for status in [
            TransferStatus::Pending,
            TransferStatus::Sent,
            TransferStatus::Acked,
            TransferStatus::Failed,
            TransferStatus::FailedTerminal,
        ] {
            let count = stores.transfers.list_transfers(Some(status)).await?.len();
            if count > 0 && matches!(status, TransferStatus::Failed | TransferStatus::FailedTerminal)
            {
                unhealthy = true;
            }
            println!("  {status}: {count}");
        }
        println!();

        Ok(if unhealthy { 1 } else { 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_args_defaults() {
        let args = StatusArgs { connection: None };
        assert!(args.connection.is_none());
    }
}
