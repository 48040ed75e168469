// Carelink - National Health-Record Integration
// Copyright (c) 2025 Carelink Contributors
// Licensed under the MIT License

//! # Carelink - National Health-Record Integration
//!
//! Carelink connects a local clinical system to a national health-data
//! exchange. It authenticates per connected organization, reconciles national
//! patient records into the local canonical store, sends medication transfers
//! to pharmacies exactly once, and submits periodic compliance reports.
//!
//! ## Overview
//!
//! This library provides:
//! - **NHS number validation** with the Modulus 11 check digit
//! - **Token management** with one credential exchange per connection at a time
//! - **Record reconciliation** governed by a per-field ownership table
//! - **Medication transfers** keyed by an idempotency key, retried with backoff
//! - **Compliance submission** with per-item validation and resumable batches
//! - **A tamper-evident audit trail** linking every entry to the one before it
//!
//! ## Architecture
//!
//! - [`cli`] - Command-line interface and argument parsing
//! - [`core`] - Business logic (auth, sync, transfer, compliance, audit)
//! - [`adapters`] - External integrations (HTTP endpoints, storage, audit file)
//! - [`domain`] - Core domain types and models
//! - [`config`] - Configuration management
//! - [`logging`] - Structured logging and observability
//! - [`runtime`] - Wiring of the services from a configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use carelink::config::load_config;
//! use carelink::runtime::Runtime;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = load_config("carelink.toml")?;
//!     let runtime = Runtime::build(&config).await?;
//!
//!     let sync = runtime.sync_orchestrator(&config.connections[0].id)?;
//!     let summary = sync.reconcile_all(config.sync.parallelism).await?;
//!
//!     println!("Applied {} of {} records", summary.applied, summary.total);
//!     Ok(())
//! }
//! ```
//!
//! ## Identifiers
//!
//! ```rust
//! use carelink::domain::NhsNumber;
//!
//! let nhs = NhsNumber::parse("9434765919").unwrap();
//! assert_eq!(nhs.redacted(), "*******919");
//! assert!(NhsNumber::parse("9434765918").is_err());
//! ```
//!
//! ## Error Handling
//!
//! Every fallible operation returns [`domain::Result`], whose error type
//! [`domain::CarelinkError`] classifies failures as retryable or not:
//!
//! ```rust
//! use carelink::domain::CarelinkError;
//!
//! let err = CarelinkError::RateLimited { target: "fhir".into(), retry_after: None };
//! assert!(err.is_retryable());
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod logging;
pub mod runtime;
