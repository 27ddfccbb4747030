//! Fixed operational constants.
//!
//! Values that are part of the service's behavior rather than deployment
//! tuning. Everything deployment-tunable comes from environment variables
//! (see [`crate::config::Settings`]).

use std::time::Duration;

/// Per-IP rate limit window length.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Maximum requests allowed per IP per window.
pub const RATE_LIMIT_MAX_REQUESTS: u32 = 60;

/// Rate-limit entries whose `last_seen` is older than this many windows are
/// evicted by the sweeper.
pub const RATE_LIMIT_STALE_WINDOWS: u32 = 10;

/// How often the rate-limit sweeper runs.
pub const RATE_LIMIT_SWEEP_INTERVAL: Duration = Duration::from_secs(120);

/// Read-only debounce bookkeeping is garbage-collected once it exceeds this
/// many entries.
pub const DEBOUNCE_MAP_MAX_ENTRIES: usize = 10_000;

/// Default serialized-result byte budget when `RESULT_JSON_MAX_BYTES` is unset.
pub const RESULT_JSON_MAX_BYTES_DEFAULT: usize = 20_000;

/// Client-visible 4xx messages are truncated to this length after
/// control-character stripping.
pub const MAX_CLIENT_ERROR_LENGTH: usize = 500;

/// `fail_reason` values persisted to the store are truncated to this length.
pub const MAX_FAIL_REASON_LENGTH: usize = 1_000;

/// When a check payload is summarized, `found` lists on missing entries keep
/// at most this many items.
pub const MISSING_FOUND_PREVIEW: usize = 3;

/// Resume jitter never schedules a first tick closer than this to the next
/// interval tick.
pub const RESUME_JITTER_POLL_MARGIN_MS: u64 = 100;

/// Hard deadline for in-flight work after a shutdown signal.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Maximum accepted intake body size in bytes. A `{"target": ...}` object
/// never legitimately approaches this.
pub const MAX_INTAKE_BODY_BYTES: usize = 4 * 1024;

/// Maximum length of a normalized target domain.
pub const MAX_TARGET_LENGTH: usize = 253;

/// Maximum length of a single DNS label.
pub const MAX_LABEL_LENGTH: usize = 63;
