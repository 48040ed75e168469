//! PostgreSQL storage backend
//!
//! One pool serves every store. The schema lives in
//! `migrations/001_initial_schema.sql` and is applied at startup; the
//! `audit_log` table carries a trigger that rejects UPDATE and DELETE.

pub mod client;
pub mod models;
pub mod store;

pub use client::PostgreSQLClient;
pub use store::PostgresStore;
