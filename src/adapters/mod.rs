//! External system integrations for Carelink.
//!
//! - [`auth`] - OAuth2 client-credentials token exchange
//! - [`fhir`] - FHIR R4 patient search and canonical mapping
//! - [`transfer`] - medication-transfer endpoint
//! - [`compliance`] - compliance-submission endpoint and item sources
//! - [`storage`] - persistence traits, in-memory store and backend factory
//! - [`postgresql`] - PostgreSQL implementation of every store
//! - [`audit_file`] - JSONL append-only audit log
//! - [`notification`] - operator notification sinks
//! - [`http`] - shared client construction and error classification
//!
//! # Design Pattern
//!
//! Each external collaborator sits behind a trait defined next to its HTTP or
//! database implementation, so core services can be tested with in-process
//! fakes. Third-party errors are converted to
//! [`CarelinkError`](crate::domain::CarelinkError) before they leave this
//! module.
//!
//! ```rust,no_run
//! use carelink::adapters::auth::{OAuthTokenClient, TokenExchanger};
//! use carelink::config::load_config;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("carelink.toml")?;
//! let client = OAuthTokenClient::new(&config.connections[0], &config.auth)?;
//! let token = client.exchange().await?;
//! println!("token valid until {}", token.expires_at());
//! # Ok(())
//! # }
//! ```

pub mod audit_file;
pub mod auth;
pub mod compliance;
pub mod fhir;
pub mod http;
pub mod notification;
pub mod postgresql;
pub mod storage;
pub mod transfer;
