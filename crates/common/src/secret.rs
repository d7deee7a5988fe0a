//! Secret wrapper for credential material

use std::fmt;
use zeroize::Zeroize;

use crate::mask::mask_token;

/// An owned string holding credential material (access/refresh tokens,
/// client secrets). Redacted in Debug/Display, zeroized on drop.
pub struct SecretString(String);

impl SecretString {
    /// Wrap a credential string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the inner value (use sparingly — wire calls only).
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Partially masked rendition for admin payloads and log lines.
    /// Keeps the first and last 4 characters.
    pub fn masked(&self) -> String {
        mask_token(&self.0)
    }

    /// Whether the wrapped value is empty (no credential present).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl Clone for SecretString {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_debug_and_display() {
        let secret = SecretString::new("sk-ant-oat01-abcdef");
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(format!("{secret}"), "[REDACTED]");
    }

    #[test]
    fn exposes_value() {
        let secret = SecretString::new("rt_12345");
        assert_eq!(secret.expose(), "rt_12345");
    }

    #[test]
    fn masked_keeps_edges_only() {
        let secret = SecretString::new("sk-ant-oat01-abcdef");
        let masked = secret.masked();
        assert!(masked.starts_with("sk-a"));
        assert!(masked.ends_with("cdef"));
        assert!(!masked.contains("oat01"));
    }

    #[test]
    fn empty_secret_reports_empty() {
        assert!(SecretString::new("").is_empty());
        assert!(!SecretString::new("x").is_empty());
    }
}
