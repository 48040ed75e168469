//! Credential management for connected organizations
//!
//! [`AuthManager`] caches one bearer token per connection and refreshes it
//! through a [`TokenExchanger`](crate::adapters::auth::TokenExchanger) when
//! less than the configured safety margin remains.

mod manager;

pub use manager::AuthManager;
