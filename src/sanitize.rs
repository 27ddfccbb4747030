//! Sanitization of externally-sourced strings.
//!
//! Every string that originates outside the process (DNS rdata, submitted
//! targets echoed into errors, email bodies, persisted JSON) passes through
//! here before it reaches a log line, a mail body, or the store. All
//! sanitizers are idempotent.

use sha2::{Digest, Sha256};

use crate::config::constants::{MAX_CLIENT_ERROR_LENGTH, MAX_FAIL_REASON_LENGTH};

/// Removes control characters (U+0000..U+001F and U+007F).
pub fn strip_control_chars(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control() || (*c as u32) > 0x7F)
        .collect()
}

/// Sanitizes free text for logs and email bodies: non-whitespace control
/// characters removed, whitespace runs (tabs and newlines included)
/// collapsed to single spaces, surrounding whitespace trimmed.
///
/// Control whitespace collapses rather than vanishes, so `"MX\t-all"`
/// stays two tokens.
pub fn sanitize_text(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_whitespace() || !c.is_control() || (*c as u32) > 0x7F)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Sanitizes a DNS hostname: control characters and all whitespace removed.
pub fn sanitize_hostname(value: &str) -> String {
    strip_control_chars(value)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// Truncates to at most `max` characters, replacing the tail with an
/// ellipsis when anything was dropped. Returns whether truncation happened.
pub fn truncate_chars(value: &str, max: usize) -> (String, bool) {
    if value.chars().count() <= max {
        return (value.to_string(), false);
    }
    let kept: String = value.chars().take(max.saturating_sub(1)).collect();
    (format!("{kept}…"), true)
}

/// Sanitizes a message destined for a 4xx response body.
pub fn sanitize_client_message(message: &str) -> String {
    truncate_chars(&sanitize_text(message), MAX_CLIENT_ERROR_LENGTH).0
}

/// Sanitizes an error message destined for the `fail_reason` column.
pub fn sanitize_fail_reason(message: &str) -> String {
    truncate_chars(&sanitize_text(message), MAX_FAIL_REASON_LENGTH).0
}

/// A record list capped to a maximum number of entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CappedValues {
    /// The retained values, at most `max` of them.
    pub values: Vec<String>,
    /// How many values existed before capping.
    pub total: usize,
    /// Whether the list was shortened.
    pub truncated: bool,
}

/// Caps `values` to at most `max` entries.
pub fn cap_values(values: Vec<String>, max: usize) -> CappedValues {
    let total = values.len();
    if total <= max {
        return CappedValues {
            values,
            total,
            truncated: false,
        };
    }
    CappedValues {
        values: values.into_iter().take(max).collect(),
        total,
        truncated: true,
    }
}

/// SHA-256 of the original values joined with `\n`, hex-encoded.
///
/// Attached to snapshots whenever capping or per-value truncation dropped
/// data, so the full payload can still be compared against a fresh
/// resolution without having been stored.
pub fn forensic_hash(originals: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(originals.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}
