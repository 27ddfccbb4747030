//! Read-only target status.
//!
//! `GET /api/checkdns/:target` reports the stored state of a target's
//! requests plus a unified per-requirement report. It never creates rows or
//! jobs. When a row has no stored check result, one read-only live check
//! may run, debounced both by the persisted `last_checked_at` and by an
//! in-memory per-key clock; throttled lookups fall back to a synthetic
//! report of the expected values.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use tokio::time::Instant;

use crate::config::constants::DEBOUNCE_MAP_MAX_ENTRIES;
use crate::dns::normalize_host;
use crate::domain::normalize_target;
use crate::server::error::ApiError;
use crate::server::AppState;
use crate::storage::{DnsRequest, RequestStatus, RequestType};
use crate::validation::{CheckKey, MissingEntry, Validator};

/// Per-key clock bounding read-only live checks.
pub struct DebounceMap {
    last_run: Mutex<HashMap<String, Instant>>,
    min_interval: Duration,
}

impl DebounceMap {
    /// Map with the configured minimum interval between live checks.
    pub fn new(min_interval: Duration) -> Self {
        DebounceMap {
            last_run: Mutex::new(HashMap::new()),
            min_interval,
        }
    }

    /// Returns whether a live check for `key` may run now, recording the
    /// attempt when allowed. Oversized bookkeeping is swept in place.
    pub fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut last_run = self.last_run.lock().unwrap();

        if last_run.len() > DEBOUNCE_MAP_MAX_ENTRIES {
            let stale_after = self.min_interval * 2;
            let before = last_run.len();
            last_run.retain(|_, at| now.duration_since(*at) <= stale_after);
            debug!(
                "Debounce map swept {} stale entries",
                before - last_run.len()
            );
        }

        match last_run.get(key) {
            Some(at) if now.duration_since(*at) < self.min_interval => false,
            _ => {
                last_run.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Number of tracked keys.
    pub fn tracked(&self) -> usize {
        self.last_run.lock().unwrap().len()
    }
}

/// One request row as reported to pollers.
#[derive(Debug, Serialize)]
pub struct RowView {
    status: RequestStatus,
    id: u64,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_checked_at: Option<DateTime<Utc>>,
    next_check_at: Option<DateTime<Utc>>,
    missing: Vec<MissingEntry>,
}

/// Aggregate view over a target's rows.
#[derive(Debug, Serialize)]
pub struct TargetSummary {
    has_ui: bool,
    has_email: bool,
    overall_status: String,
    expires_at_min: Option<DateTime<Utc>>,
    last_checked_at_max: Option<DateTime<Utc>>,
    next_check_at_min: Option<DateTime<Utc>>,
}

/// `GET /api/checkdns/:target` response body.
#[derive(Debug, Serialize)]
pub struct CheckDnsResponse {
    target: String,
    normalized_target: String,
    summary: TargetSummary,
    ui: Option<RowView>,
    email: Option<RowView>,
}

/// `GET /api/checkdns/:target`
pub async fn check_dns(
    State(state): State<AppState>,
    Path(target): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CheckDnsResponse>, ApiError> {
    if let Some(token) = &state.settings.checkdns.token {
        let presented = headers.get("x-api-key").and_then(|v| v.to_str().ok());
        if presented != Some(token.as_str()) {
            return Err(ApiError::Unauthorized);
        }
    }

    let normalized = normalize_target(&target)?;
    let rows = state.store.find_by_target(&normalized).await?;
    if rows.is_empty() {
        return Err(ApiError::NotFound);
    }

    let email_row = rows.iter().find(|r| r.kind == RequestType::Email).cloned();
    let ui_row = rows.iter().find(|r| r.kind == RequestType::Ui).cloned();

    // The EMAIL row is authoritative; the UI row only survives for
    // historical deployments.
    let selected_id = email_row
        .as_ref()
        .or(ui_row.as_ref())
        .map(|r| r.id)
        .unwrap_or_default();

    let mut views = HashMap::new();
    for row in email_row.iter().chain(ui_row.iter()) {
        let missing = if row.id == selected_id {
            missing_with_live_check(&state, row).await
        } else {
            missing_from_stored(&state.validator, row)
        };
        views.insert(row.id, row_view(row, missing));
    }

    let summary = summarize(ui_row.as_ref(), email_row.as_ref());
    Ok(Json(CheckDnsResponse {
        target: normalized.clone(),
        normalized_target: normalized,
        summary,
        ui: ui_row.and_then(|r| views.remove(&r.id)),
        email: email_row.and_then(|r| views.remove(&r.id)),
    }))
}

fn row_view(row: &DnsRequest, missing: Vec<MissingEntry>) -> RowView {
    RowView {
        status: row.status,
        id: row.id,
        created_at: row.created_at,
        expires_at: row.expires_at,
        last_checked_at: row.last_checked_at,
        next_check_at: row.next_check_at,
        missing,
    }
}

/// Report for the authoritative row: stored payload first, then one
/// debounced read-only live check, then the synthetic fallback.
async fn missing_with_live_check(state: &AppState, row: &DnsRequest) -> Vec<MissingEntry> {
    if let Some(parsed) = parse_stored_missing(row) {
        return unify_missing(&state.validator, &row.target, parsed);
    }

    if live_check_allowed(state, row) {
        match state.validator.check_target(&row.target).await {
            Ok(outcome) => {
                return unify_missing(&state.validator, &row.target, outcome.missing);
            }
            Err(e) => {
                warn!("Read-only live check failed for {}: {e}", row.target);
            }
        }
    }

    state.validator.fallback_missing(&row.target)
}

/// Report for the secondary row: stored payload or fallback, never a live
/// check.
fn missing_from_stored(validator: &Validator, row: &DnsRequest) -> Vec<MissingEntry> {
    match parse_stored_missing(row) {
        Some(parsed) => unify_missing(validator, &row.target, parsed),
        None => validator.fallback_missing(&row.target),
    }
}

fn parse_stored_missing(row: &DnsRequest) -> Option<Vec<MissingEntry>> {
    let json = row.last_check_result_json.as_deref()?;
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    let entries = value.get("missing")?.as_array()?;
    let parsed: Vec<MissingEntry> = entries
        .iter()
        .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
        .collect();
    (!parsed.is_empty()).then_some(parsed)
}

/// A live check is allowed only when both clocks agree: the persisted
/// `last_checked_at` and the in-memory per-key debounce.
fn live_check_allowed(state: &AppState, row: &DnsRequest) -> bool {
    let min_interval = chrono::Duration::from_std(state.settings.checkdns.min_interval)
        .unwrap_or_else(|_| chrono::Duration::seconds(60));
    if let Some(last_checked) = row.last_checked_at {
        if last_checked + min_interval > Utc::now() {
            return false;
        }
    }
    state.debounce.try_acquire(&row.job_key())
}

/// Produces the unified report: exactly one entry per requirement, in
/// order, with `name` and `type` re-derived from the key and gaps filled
/// from the synthetic fallback.
fn unify_missing(
    validator: &Validator,
    target: &str,
    entries: Vec<MissingEntry>,
) -> Vec<MissingEntry> {
    let apex = normalize_host(target);
    let selector = validator.profile().dkim_selector.clone();
    let mut by_key: HashMap<CheckKey, MissingEntry> = entries
        .into_iter()
        .map(|entry| (entry.key, entry))
        .collect();

    validator
        .fallback_missing(target)
        .into_iter()
        .map(|fallback| {
            let key = fallback.key;
            match by_key.remove(&key) {
                Some(mut entry) => {
                    entry.record_type = key.record_type().to_string();
                    entry.name = key.checked_name(&apex, &selector);
                    entry
                }
                None => fallback,
            }
        })
        .collect()
}

fn summarize(ui: Option<&DnsRequest>, email: Option<&DnsRequest>) -> TargetSummary {
    let rows: Vec<&DnsRequest> = ui.iter().chain(email.iter()).copied().collect();
    let overall_status = match (ui, email) {
        (None, None) => "NONE".to_string(),
        (Some(row), None) | (None, Some(row)) => row.status.to_string(),
        (Some(a), Some(b)) if a.status == b.status => a.status.to_string(),
        _ => "MIXED".to_string(),
    };
    TargetSummary {
        has_ui: ui.is_some(),
        has_email: email.is_some(),
        overall_status,
        expires_at_min: rows.iter().map(|r| r.expires_at).min(),
        last_checked_at_max: rows.iter().filter_map(|r| r.last_checked_at).max(),
        next_check_at_min: rows.iter().filter_map(|r| r.next_check_at).min(),
    }
}
