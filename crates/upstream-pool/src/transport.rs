//! Transport adapter seam
//!
//! The dispatcher issues upstream calls through this trait; the gateway
//! binary supplies an implementation that knows each provider's base URL
//! and TLS profile. Keeping the seam object-safe lets dispatch tests
//! substitute a scripted transport with no network at all.

use account_store::Account;
use async_trait::async_trait;

use crate::error::Result;

/// An upstream call, already translated to the provider's wire format by
/// the (external) adapter layer.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// The upstream's answer, passed through to the caller on success and fed
/// to classification on error statuses.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ProxyResponse {
    /// Response body as text for error classification.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Whether the upstream accepted the call.
    pub fn is_success(&self) -> bool {
        self.status < 400
    }
}

/// Issues one upstream call on behalf of `account`.
///
/// Implementations must honor request cancellation: dropping the future
/// aborts the in-flight call. Transport-level failures (connect, timeout)
/// surface as `Error::Transport`; HTTP error statuses come back as a
/// normal `ProxyResponse` for the dispatcher to classify.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, account: &Account, request: &ProxyRequest) -> Result<ProxyResponse>;
}
