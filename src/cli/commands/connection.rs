//! Connection lifecycle commands

use super::{exit_code_for, open_runtime};
use crate::domain::{ConnectionId, CorrelationId};
use clap::{Args, Subcommand};

/// Arguments for the connection command
#[derive(Args, Debug)]
pub struct ConnectionArgs {
    #[command(subcommand)]
    pub action: ConnectionAction,
}

#[derive(Subcommand, Debug)]
pub enum ConnectionAction {
    /// Withdraw access; pending transfer retries are cancelled
    Revoke {
        id: String,

        /// Reason recorded in the audit trail
        #[arg(long, default_value = "revoked by operator")]
        reason: String,
    },

    /// Return a degraded or revoked connection to active
    Reconnect { id: String },

    /// Obtain a token to check the credentials
    Test { id: String },
}

impl ConnectionArgs {
    /// Execute the connection command
    pub async fn execute(&self, config_path: &str) -> anyhow::Result<i32> {
        let (_, runtime) = match open_runtime(config_path).await {
            Ok(r) => r,
            Err(code) => return Ok(code),
        };
        let auth = runtime.auth();
        let correlation_id = CorrelationId::new();

        let result = match &self.action {
            ConnectionAction::Revoke { id, reason } => {
                let id = ConnectionId::new(id.clone())?;
                runtime
                    .gateway()
                    .revoke_connection(&id, reason, correlation_id)
                    .await
                    .map(|cancelled| {
                        println!("🛑 Connection {id} revoked ({cancelled} pending transfer(s) cancelled)");
                    })
            }
            ConnectionAction::Reconnect { id } => {
                let id = ConnectionId::new(id.clone())?;
                auth.reconnect(&id, correlation_id).await.map(|()| {
                    println!("✅ Connection {id} is active");
                })
            }
            ConnectionAction::Test { id } => {
                let id = ConnectionId::new(id.clone())?;
                auth.obtain_token(&id, correlation_id).await.map(|token| {
                    println!(
                        "✅ Token issued for {id}, expires {}",
                        token.expires_at().format("%Y-%m-%d %H:%M:%S")
                    );
                })
            }
        };

        match result {
            Ok(()) => Ok(0),
            Err(e) => {
                eprintln!("❌ {e}");
                eprintln!("   Correlation id: {correlation_id}");
                Ok(exit_code_for(&e))
            }
        }
    }
}
