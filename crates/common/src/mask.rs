//! Partial masking of sensitive strings
//!
//! Admin listings and log lines show enough of a credential to identify it
//! (first/last few characters) without revealing the value. Values too short
//! to mask meaningfully collapse to a fixed-width run of stars so their
//! length is not leaked either.

/// Mask the middle of `value`, keeping `keep_start` leading and `keep_end`
/// trailing characters. Returns up to eight stars when the value is too
/// short to keep both edges.
pub fn mask_sensitive(value: &str, keep_start: usize, keep_end: usize) -> String {
    if value.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = value.chars().collect();
    if keep_start + keep_end >= chars.len() {
        return "*".repeat(chars.len().min(8));
    }
    let masked_len = chars.len() - keep_start - keep_end;
    let mut out = String::with_capacity(chars.len());
    out.extend(&chars[..keep_start]);
    out.extend(std::iter::repeat_n('*', masked_len));
    out.extend(&chars[chars.len() - keep_end..]);
    out
}

/// Token masking: keep the first and last 4 characters.
pub fn mask_token(value: &str) -> String {
    mask_sensitive(value, 4, 4)
}
