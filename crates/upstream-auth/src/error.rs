//! Error types for token lifecycle operations

/// Errors from refresh and lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token refresh failed: {0}")]
    Exchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("token response parse error: {0}")]
    Parse(String),

    #[error("no refresh token available")]
    MissingRefreshToken,

    #[error("no gateway URL configured for relay account")]
    MissingGatewayUrl,

    #[error("account not found: {0}")]
    NotFound(u64),

    #[error("refresh already in flight for account {0}")]
    RefreshInFlight(u64),

    #[error("store error: {0}")]
    Store(#[from] account_store::Error),
}

/// Result alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;
