//! The account record
//!
//! Timestamps are unix milliseconds (absolute). `token_expiry` is absent for
//! accounts whose credentials do not expire on their own — gateway-relay
//! accounts in particular, whose tokens are re-issued on a staleness
//! schedule instead.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use provider::Provider;
use serde::{Deserialize, Serialize};

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn default_true() -> bool {
    true
}

/// One provider-side credential unit.
///
/// Created and edited by the administrative surface; mutated in place by
/// the token manager on every refresh; never destroyed by the scheduling
/// core. An account with a `token_expiry` always carries a refresh token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    pub name: String,
    pub provider: Provider,
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Current access token (Bearer token for upstream calls)
    #[serde(default)]
    pub access_token: String,
    /// Refresh token for obtaining new access tokens
    #[serde(default)]
    pub refresh_token: String,
    /// Access token expiration as unix millis; `None` means the credential
    /// does not expire on its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<u64>,

    /// OAuth client pair (Gemini accounts carry their own)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Organization resolved from the provider (team plans)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Relay gateway base URL (gateway-relay accounts only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_type: Option<String>,

    /// Models this account may serve; empty means all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    /// Maximum parallel in-flight requests; 0 = unlimited
    #[serde(default)]
    pub max_concurrency: u32,

    /// Terminal credential loss (relay refresh rejected); excluded from
    /// selection until an administrator re-authorizes the account
    #[serde(default)]
    pub credential_expired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refreshed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<u64>,
}

impl Account {
    /// Whether the access token expires within `threshold` from now.
    /// Accounts without an expiry never need a threshold refresh.
    pub fn needs_refresh(&self, threshold: Duration) -> bool {
        match self.token_expiry {
            Some(expiry) => expiry <= now_millis() + threshold.as_millis() as u64,
            None => false,
        }
    }

    /// Whether this account may serve `model`. An empty `models` list
    /// permits everything; `None` (no model constraint) always passes.
    pub fn allows_model(&self, model: Option<&str>) -> bool {
        match model {
            Some(m) => self.models.is_empty() || self.models.iter().any(|allowed| allowed == m),
            None => true,
        }
    }

    /// Whether selection may consider this account at all.
    pub fn selectable(&self) -> bool {
        self.enabled && !self.credential_expired
    }
}
