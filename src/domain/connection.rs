//! Connected-organization state
//!
//! An [`NhsConnection`] is the explicit per-organization state record owned by
//! the auth manager. It is never a process-wide singleton: every component that
//! needs a token goes through the manager with a [`ConnectionId`].

use super::ids::ConnectionId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Tokens can be issued and refreshed automatically
    #[default]
    Active,
    /// A credential exchange is in flight
    Refreshing,
    /// Credentials were rejected; automatic refresh stops until an operator reconnects
    Degraded,
    /// Access withdrawn by an operator; pending work for the connection is cancelled
    Revoked,
}

impl ConnectionStatus {
    /// Whether the connection may perform a credential exchange
    pub fn can_refresh(&self) -> bool {
        matches!(self, ConnectionStatus::Active | ConnectionStatus::Refreshing)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Refreshing => "refreshing",
            ConnectionStatus::Degraded => "degraded",
            ConnectionStatus::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

/// A time-bounded bearer token
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Create a token that expires at the given instant
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// The bearer value to place in the `Authorization` header
    pub fn secret(&self) -> &str {
        &self.value
    }

    /// Expiry instant
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the token remains valid for longer than `margin` after `now`
    pub fn is_valid_for(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - now > margin
    }

    /// `Authorization` header value
    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Per-organization connection state
#[derive(Debug, Clone)]
pub struct NhsConnection {
    /// Connection identifier
    pub id: ConnectionId,

    /// Organization code of the connected practice
    pub organization_code: String,

    /// Current lifecycle status
    pub status: ConnectionStatus,

    /// Cached token, if any
    pub token: Option<AccessToken>,

    /// When the last successful exchange happened
    pub last_refreshed_at: Option<DateTime<Utc>>,

    /// Reason for the last transition to Degraded or Revoked
    pub status_reason: Option<String>,
}

impl NhsConnection {
    /// Create an active connection with no cached token
    pub fn new(id: ConnectionId, organization_code: impl Into<String>) -> Self {
        Self {
            id,
            organization_code: organization_code.into(),
            status: ConnectionStatus::Active,
            token: None,
            last_refreshed_at: None,
            status_reason: None,
        }
    }

    /// Return the cached token when it outlives the safety margin
    pub fn usable_token(&self, margin: Duration, now: DateTime<Utc>) -> Option<&AccessToken> {
        if self.status == ConnectionStatus::Revoked || self.status == ConnectionStatus::Degraded {
            return None;
        }
        self.token
            .as_ref()
            .filter(|token| token.is_valid_for(margin, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> NhsConnection {
        NhsConnection::new(ConnectionId::new("practice-a").unwrap(), "A81001")
    }

    #[test]
    fn test_token_margin() {
        let now = Utc::now();
        let token = AccessToken::new("abc", now + Duration::seconds(90));
        assert!(token.is_valid_for(Duration::seconds(60), now));
        assert!(!token.is_valid_for(Duration::seconds(120), now));
    }

    #[test]
    fn test_usable_token_respects_status() {
        let now = Utc::now();
        let mut conn = connection();
        conn.token = Some(AccessToken::new("abc", now + Duration::seconds(600)));
        assert!(conn.usable_token(Duration::seconds(60), now).is_some());

        conn.status = ConnectionStatus::Degraded;
        assert!(conn.usable_token(Duration::seconds(60), now).is_none());
    }

    #[test]
    fn test_token_debug_redacted() {
        let token = AccessToken::new("very-secret", Utc::now());
        let out = format!("{token:?}");
        assert!(!out.contains("very-secret"));
        assert_eq!(token.bearer_header(), "Bearer very-secret");
    }

    #[test]
    fn test_can_refresh() {
        assert!(ConnectionStatus::Active.can_refresh());
        assert!(!ConnectionStatus::Degraded.can_refresh());
        assert!(!ConnectionStatus::Revoked.can_refresh());
    }
}
