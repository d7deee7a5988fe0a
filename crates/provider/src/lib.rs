//! Provider identities and upstream error classification
//!
//! The gateway fronts several provider families behind one API. Each pool
//! account belongs to exactly one `Provider`, which decides the token
//! refresh wire protocol and the upstream base the account talks to.
//! `classify` maps upstream responses onto the retry/failover strategy the
//! dispatcher follows.

pub mod classify;

pub use classify::{classify_429, classify_status};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Upstream provider family of a pool account.
///
/// `OpenAiOauth` and `OpenAiResponses` share one OAuth refresh protocol and
/// differ only in the API surface they are dispatched to. `GatewayRelay`
/// accounts authenticate through a relay gateway with its own refresh
/// endpoint and no self-reported token expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "claude_official")]
    ClaudeOfficial,
    #[serde(rename = "openai_oauth")]
    OpenAiOauth,
    #[serde(rename = "openai_responses")]
    OpenAiResponses,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "gateway_relay")]
    GatewayRelay,
}

impl Provider {
    /// Stable label for logs, metrics, and route segments.
    pub fn label(&self) -> &'static str {
        match self {
            Provider::ClaudeOfficial => "claude_official",
            Provider::OpenAiOauth => "openai_oauth",
            Provider::OpenAiResponses => "openai_responses",
            Provider::Gemini => "gemini",
            Provider::GatewayRelay => "gateway_relay",
        }
    }

    /// Whether refresh uses the relay-gateway protocol instead of one of
    /// the OAuth token endpoints.
    pub fn is_gateway_relay(&self) -> bool {
        matches!(self, Provider::GatewayRelay)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error for unrecognized provider labels (route parsing, config).
#[derive(Debug, thiserror::Error)]
#[error("unknown provider: {0}")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude_official" | "claude" => Ok(Provider::ClaudeOfficial),
            "openai_oauth" | "openai" => Ok(Provider::OpenAiOauth),
            "openai_responses" => Ok(Provider::OpenAiResponses),
            "gemini" => Ok(Provider::Gemini),
            "gateway_relay" => Ok(Provider::GatewayRelay),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

/// Classification of upstream errors, driving the dispatch state machine:
/// - `AuthExpired` forces a token refresh and one retry on the same account
/// - `QuotaExceeded` and `Permanent` count toward marking the account unavailable
/// - `Transient` re-enters selection with the remaining candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Retryable with a different account (timeouts, 5xx)
    Transient,
    /// Subscription quota exhausted (429 with a quota message)
    QuotaExceeded,
    /// Access token rejected (401) — refresh and retry the same account once
    AuthExpired,
    /// Credentials invalid beyond refresh (403)
    Permanent,
}

/// Health summary reported for the /health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    /// Overall status: "healthy", "degraded", or "unhealthy"
    pub status: String,
    /// Pool account counts and per-account detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<serde_json::Value>,
}
