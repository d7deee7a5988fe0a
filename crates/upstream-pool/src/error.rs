//! Error types for pool operations

/// Errors from selection and dispatch.
///
/// `NoEligibleAccount` and `UpstreamFailed` are the two terminal shapes a
/// caller distinguishes: the first means the pool had nothing to offer,
/// the second that accounts were tried and the upstream kept failing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no eligible account: {0}")]
    NoEligibleAccount(String),

    #[error("upstream call failed with status {status}")]
    UpstreamFailed { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("auth error: {0}")]
    Auth(#[from] upstream_auth::Error),

    #[error("store error: {0}")]
    Store(#[from] account_store::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
