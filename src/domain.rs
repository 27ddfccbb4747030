//! Target domain normalization and validation.
//!
//! Submitted targets pass through [`normalize_target`] before anything else
//! touches them: storage keys, DNS queries, and log lines all see the
//! normalized form. The grammar is deliberately strict; this service only
//! ever validates bare apex domains, so URLs, IP literals, and anything with
//! authority syntax are rejected up front.

use thiserror::Error;

use crate::config::constants::{MAX_LABEL_LENGTH, MAX_TARGET_LENGTH};

/// Why a submitted target was rejected.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TargetError {
    /// Empty after trimming.
    #[error("target is empty")]
    Empty,

    /// Contains control characters.
    #[error("target contains control characters")]
    ControlCharacters,

    /// Contains non-ASCII characters (IDNs must be submitted in punycode).
    #[error("target contains non-ASCII characters")]
    NonAscii,

    /// Longer than 253 characters after normalization.
    #[error("target exceeds {MAX_TARGET_LENGTH} characters")]
    TooLong,

    /// Contains a URL scheme, path, query, fragment, or authority separator.
    #[error("target must be a bare domain, not a URL")]
    UrlSyntax,

    /// Contains whitespace.
    #[error("target contains whitespace")]
    Whitespace,

    /// Is an IP address literal.
    #[error("target must be a domain, not an IP address")]
    IpLiteral,

    /// A label is empty, too long, or contains invalid characters.
    #[error("target has an invalid label")]
    BadLabel,
}

/// Normalizes a submitted target to its canonical form.
///
/// Trims surrounding whitespace, lowercases, and drops a single trailing
/// dot, then validates the result against the accepted grammar: ASCII
/// labels of `[a-z0-9-]`, 1-63 chars each, not hyphen-edged, joined by
/// dots, 253 chars total.
///
/// Idempotent on its accepted set: `normalize_target(ok)` returns `ok`
/// unchanged for any value it has previously accepted.
pub fn normalize_target(raw: &str) -> Result<String, TargetError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TargetError::Empty);
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(TargetError::ControlCharacters);
    }
    if !trimmed.is_ascii() {
        return Err(TargetError::NonAscii);
    }
    if trimmed.contains("://")
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains('?')
        || trimmed.contains('#')
        || trimmed.contains('@')
        || trimmed.contains(':')
    {
        return Err(TargetError::UrlSyntax);
    }
    if trimmed.chars().any(|c| c.is_ascii_whitespace()) {
        return Err(TargetError::Whitespace);
    }

    let normalized = trimmed.trim_end_matches('.').to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(TargetError::Empty);
    }
    if normalized.len() > MAX_TARGET_LENGTH {
        return Err(TargetError::TooLong);
    }
    if normalized.parse::<std::net::IpAddr>().is_ok() {
        return Err(TargetError::IpLiteral);
    }

    for label in normalized.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LENGTH {
            return Err(TargetError::BadLabel);
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(TargetError::BadLabel);
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(TargetError::BadLabel);
        }
    }

    Ok(normalized)
}
