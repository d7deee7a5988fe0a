//! Upstream response classification
//!
//! Distinguishes transient rate limits (429 with a generic message) from
//! subscription quota exhaustion (429 with a rolling-window/plan-limit
//! message), and separates 401 (token expired, refresh and retry the same
//! account) from 403 (credentials rejected outright).

use crate::ErrorClassification;

/// Quota exhaustion message patterns in upstream 429 responses.
///
/// These indicate the account has hit its rolling subscription limit,
/// not a transient per-minute rate limit.
const QUOTA_PATTERNS: &[&str] = &[
    "5-hour",
    "5 hour",
    "rolling window",
    "usage limit for your plan",
    "subscription usage limit",
    "quota exceeded",
];

/// Classify a 429 response body as quota exhaustion or transient rate limit.
pub fn classify_429(body: &str) -> ErrorClassification {
    let lower = body.to_lowercase();
    for pattern in QUOTA_PATTERNS {
        if lower.contains(pattern) {
            return ErrorClassification::QuotaExceeded;
        }
    }
    ErrorClassification::Transient
}

/// Classify an upstream error by HTTP status and response body.
///
/// 401 means the access token was rejected — the dispatcher forces a
/// refresh and retries the same account once. 403 means the credentials
/// are rejected beyond what a refresh can fix. 429 dispatches to
/// `classify_429`; 408/5xx and unknown statuses are transient.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    match status {
        429 => classify_429(body),
        401 => ErrorClassification::AuthExpired,
        403 => ErrorClassification::Permanent,
        408 | 500 | 502 | 503 | 504 => ErrorClassification::Transient,
        _ => ErrorClassification::Transient,
    }
}
