//! Token endpoint configuration
//!
//! The OAuth client IDs are public — they identify the client application,
//! not a secret. The actual secrets (access/refresh tokens, client secret
//! pairs) live on the account records.
//!
//! Endpoints are injectable so tests can point the manager at local mock
//! servers; production uses the defaults. The relay gateway has no fixed
//! endpoint — each relay account carries its own `gateway_url`.

/// Anthropic's public OAuth client ID (same as the Claude CLI)
pub const CLAUDE_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Claude token endpoint (console, not the inference API)
pub const CLAUDE_TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";

/// OpenAI's public OAuth client ID
pub const OPENAI_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

/// OpenAI token endpoint (shared by the oauth and responses families)
pub const OPENAI_TOKEN_ENDPOINT: &str = "https://auth.openai.com/oauth/token";

/// Google OAuth token endpoint (Gemini accounts)
pub const GOOGLE_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Refresh path appended to a relay account's gateway URL
pub const RELAY_REFRESH_PATH: &str = "/auth/refresh";

/// Token endpoint set used by the manager; override in tests.
#[derive(Debug, Clone)]
pub struct RefreshEndpoints {
    pub claude: String,
    pub openai: String,
    pub google: String,
}

impl Default for RefreshEndpoints {
    fn default() -> Self {
        Self {
            claude: CLAUDE_TOKEN_ENDPOINT.to_string(),
            openai: OPENAI_TOKEN_ENDPOINT.to_string(),
            google: GOOGLE_TOKEN_ENDPOINT.to_string(),
        }
    }
}

/// Build a relay refresh URL from an account's gateway base URL,
/// tolerating a trailing slash.
pub fn relay_refresh_url(gateway_url: &str) -> String {
    format!("{}{}", gateway_url.trim_end_matches('/'), RELAY_REFRESH_PATH)
}
