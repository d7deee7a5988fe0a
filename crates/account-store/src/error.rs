//! Error types for account storage

/// Errors from account store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("account parse error: {0}")]
    Parse(String),

    #[error("account not found: {0}")]
    NotFound(u64),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
