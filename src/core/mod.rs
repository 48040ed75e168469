//! Core business logic for Carelink.
//!
//! # Modules
//!
//! - [`auth`] - per-connection token cache with single-flight refresh
//! - [`sync`] - reconciliation of remote records into the local store
//! - [`transfer`] - idempotent medication-transfer delivery with retries
//! - [`compliance`] - per-period compliance batches
//! - [`audit`] - hash-chained audit recording and verification
//! - [`retry`] - exponential backoff shared by every protocol call
//! - [`checksum`] - canonical JSON hashing
//!
//! # Flow
//!
//! 1. **Token**: [`auth::AuthManager`] supplies a bearer token for the connection
//! 2. **Exchange**: the FHIR, transfer or compliance client performs the call
//! 3. **Apply**: results are written to the local stores
//! 4. **Audit**: every attempt and outcome is appended to the audit chain
//!
//! # Example
//!
//! ```rust,no_run
//! use carelink::config::load_config;
//! use carelink::domain::{CorrelationId, PatientId};
//! use carelink::runtime::Runtime;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("carelink.toml")?;
//! let runtime = Runtime::build(&config).await?;
//! let sync = runtime.sync_orchestrator(&config.connections[0].id)?;
//!
//! let outcome = sync
//!     .reconcile(&PatientId::new("res-1")?, CorrelationId::new())
//!     .await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod auth;
pub mod checksum;
pub mod compliance;
pub mod retry;
pub mod sync;
pub mod transfer;
