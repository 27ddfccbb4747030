//! Row types for the request store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which validation profile a request is for.
///
/// Only `EMAIL` is accepted at intake; `UI` is a retired alias that may
/// still exist in historical rows and is kept readable for the query path.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestType {
    /// Retired website-pointing profile.
    Ui,
    /// Email-forwarding profile.
    Email,
}

impl RequestType {
    /// Stable uppercase label, as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Ui => "UI",
            RequestType::Email => "EMAIL",
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a request.
///
/// `PENDING` is the only non-terminal state. `FAILED` is reserved; nothing
/// assigns it automatically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    /// Being polled.
    Pending,
    /// All checks passed.
    Active,
    /// Time budget elapsed before the checks passed.
    Expired,
    /// Reserved terminal state.
    Failed,
}

impl RequestStatus {
    /// Stable uppercase label, as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Active => "ACTIVE",
            RequestStatus::Expired => "EXPIRED",
            RequestStatus::Failed => "FAILED",
        }
    }

    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `dns_requests` row.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct DnsRequest {
    /// Primary key.
    pub id: u64,
    /// Normalized target domain.
    pub target: String,
    /// Request type.
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: RequestType,
    /// Lifecycle state.
    pub status: RequestStatus,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Set exactly once, on promotion to ACTIVE.
    pub activated_at: Option<DateTime<Utc>>,
    /// When the last validation ran.
    pub last_checked_at: Option<DateTime<Utc>>,
    /// When the next background tick is due.
    pub next_check_at: Option<DateTime<Utc>>,
    /// Deadline after which a PENDING request expires.
    pub expires_at: DateTime<Utc>,
    /// Bounded JSON blob of the last check result.
    pub last_check_result_json: Option<String>,
    /// Why the request failed or keeps failing.
    pub fail_reason: Option<String>,
}

impl DnsRequest {
    /// Scheduler key for this row: `{type}:{target}`.
    pub fn job_key(&self) -> String {
        format!("{}:{}", self.kind, self.target)
    }

    /// Whether the time budget has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
