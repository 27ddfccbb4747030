//! Request intake.
//!
//! `POST /request/email` validates the submission, applies the cooldown,
//! inserts the row, runs one validation inline, and either answers `200
//! ACTIVE` on an immediate pass or `202 PENDING` with a background job
//! started. `POST /request/ui` is retired and answers `410`.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::json;

use crate::config::constants::MAX_INTAKE_BODY_BYTES;
use crate::domain::normalize_target;
use crate::server::error::ApiError;
use crate::server::AppState;
use crate::storage::{DnsRequest, RequestStatus, RequestType, Transition};
use crate::validation::payload::build_result_payload;

/// `POST /request/ui`: retired endpoint.
pub async fn create_ui_request() -> ApiError {
    ApiError::Gone
}

/// `POST /request/email`
pub async fn create_email_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_json_content_type(&headers)?;
    let target = parse_intake_body(&body)?;

    // Admission before any store work: a full scheduler means a new row
    // would sit unpolled past its cooldown.
    if state.scheduler.at_capacity() {
        return Err(ApiError::ServerBusy);
    }

    let now = Utc::now();
    let cooldown = chrono::Duration::from_std(state.settings.intake.target_cooldown)
        .unwrap_or_else(|_| chrono::Duration::seconds(60));
    if let Some(last) = state
        .store
        .find_last_created(&target, RequestType::Email)
        .await?
    {
        if last.created_at + cooldown > now {
            return Err(ApiError::Cooldown);
        }
    }

    let expires_at = now
        + chrono::Duration::from_std(state.settings.dns.job_max_age)
            .unwrap_or_else(|_| chrono::Duration::hours(48));
    let row = state
        .store
        .insert_request(&target, RequestType::Email, now, expires_at)
        .await?;
    info!("Request {} created for {} (expires {})", row.id, target, expires_at);

    // Fire-and-forget; a broken relay must not fail the request.
    let notifier = state.notifier.clone();
    let created_row = row.clone();
    tokio::spawn(async move {
        if let Err(e) = notifier.send_request_created(&created_row).await {
            warn!(
                "Failed to send request-created notification for {}: {e}",
                created_row.target
            );
        }
    });

    match immediate_check(&state, &row, now).await {
        Ok(Some(active_row)) => Ok(request_response(StatusCode::OK, &active_row)),
        Ok(None) => {
            state
                .scheduler
                .start_for_request(&row, std::time::Duration::ZERO);
            Ok(request_response(StatusCode::ACCEPTED, &row))
        }
        Err(e) => {
            // The background job is the retry path for a failed inline check.
            warn!("Immediate check failed for {target}: {e:#}");
            state
                .scheduler
                .start_for_request(&row, std::time::Duration::ZERO);
            Ok(request_response(StatusCode::ACCEPTED, &row))
        }
    }
}

/// Runs the inline validation. Returns the refreshed row when it ended up
/// `ACTIVE`, `None` when polling should take over.
async fn immediate_check(
    state: &AppState,
    row: &DnsRequest,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<DnsRequest>> {
    let outcome = state.validator.check_target(&row.target).await?;

    let next_check_at = now
        + chrono::Duration::from_std(state.settings.dns.poll_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
    let payload = build_result_payload(&outcome, state.settings.intake.result_json_max_bytes);
    state
        .store
        .update_check_result(row.id, now, next_check_at, &payload)
        .await?;

    if !outcome.ok {
        return Ok(None);
    }

    let promoted = state
        .store
        .conditional_transition(
            row.id,
            now,
            Transition::Activate { activated_at: now },
        )
        .await?;
    if promoted == 1 {
        info!("Request {} promoted to ACTIVE at intake", row.id);
        if let Err(e) = state.store.mark_domain_active(&row.target, now).await {
            warn!("Failed to record active domain {}: {e}", row.target);
        }
    }

    // Either we promoted or a racing background tick did; report whatever
    // the store says now.
    let current = state
        .store
        .find_by_id(row.id)
        .await?
        .unwrap_or_else(|| row.clone());
    if current.status == RequestStatus::Active {
        if promoted == 1 {
            let notifier = state.notifier.clone();
            let mail_row = current.clone();
            let last_result = serde_json::from_str::<serde_json::Value>(&payload).ok();
            tokio::spawn(async move {
                if let Err(e) = notifier
                    .send_status_change(&mail_row, last_result.as_ref())
                    .await
                {
                    warn!(
                        "Failed to send status notification for {}: {e}",
                        mail_row.target
                    );
                }
            });
        }
        Ok(Some(current))
    } else {
        Ok(None)
    }
}

fn require_json_content_type(headers: &HeaderMap) -> Result<(), ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|mime| mime.eq_ignore_ascii_case("application/json"))
    {
        Ok(())
    } else {
        Err(ApiError::UnsupportedMediaType)
    }
}

/// The body must be a JSON object with exactly one key, `target`.
fn parse_intake_body(body: &Bytes) -> Result<String, ApiError> {
    if body.len() > MAX_INTAKE_BODY_BYTES {
        return Err(ApiError::BadRequest("request body too large".into()));
    }
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|_| ApiError::BadRequest("request body must be valid JSON".into()))?;
    let object = value
        .as_object()
        .ok_or_else(|| ApiError::BadRequest("request body must be a JSON object".into()))?;
    for key in object.keys() {
        if key != "target" {
            return Err(ApiError::BadRequest(format!("unexpected field {key:?}")));
        }
    }
    let raw = object
        .get("target")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ApiError::BadRequest("target must be a string".into()))?;
    Ok(normalize_target(raw)?)
}

fn request_response(status: StatusCode, row: &DnsRequest) -> Response {
    (
        status,
        Json(json!({
            "id": row.id,
            "target": row.target,
            "type": row.kind,
            "status": row.status,
            "expires_at": row.expires_at,
        })),
    )
        .into_response()
}
