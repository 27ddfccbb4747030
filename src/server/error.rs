//! Handler-facing error envelope.
//!
//! Every error leaves the service as `{ "error": <code_or_message> }`. 4xx
//! messages are sanitized and length-capped; 5xx details stay in the logs
//! and the client sees only `internal_error`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::error;
use serde_json::json;

use crate::domain::TargetError;
use crate::error_handling::DatabaseError;
use crate::sanitize::sanitize_client_message;

/// Client-visible request failures.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed body or target (400).
    BadRequest(String),
    /// Missing or wrong API token (401).
    Unauthorized,
    /// No rows for the target (404).
    NotFound,
    /// Duplicate `(target, type)` (409).
    Conflict(String),
    /// Retired endpoint (410).
    Gone,
    /// Non-JSON content type on a JSON endpoint (415).
    UnsupportedMediaType,
    /// Target resubmitted inside its cooldown window (429).
    Cooldown,
    /// Per-IP window exhausted (429).
    RateLimited,
    /// Job capacity reached (503).
    ServerBusy,
    /// Anything unexpected (500).
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": sanitize_client_message(&message) }),
            ),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "unauthorized" }),
            ),
            ApiError::NotFound => (StatusCode::NOT_FOUND, json!({ "error": "not_found" })),
            ApiError::Conflict(message) => (
                StatusCode::CONFLICT,
                json!({ "error": sanitize_client_message(&message) }),
            ),
            ApiError::Gone => (
                StatusCode::GONE,
                json!({
                    "error": "endpoint_removed",
                    "message": "UI requests are no longer accepted; submit an email request instead",
                }),
            ),
            ApiError::UnsupportedMediaType => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                json!({ "error": "unsupported_media_type" }),
            ),
            ApiError::Cooldown => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": "target is in cooldown window" }),
            ),
            ApiError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": "rate_limited" }),
            ),
            ApiError::ServerBusy => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "server_busy" }),
            ),
            ApiError::Internal(e) => {
                error!("Internal error handling request: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal_error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<TargetError> for ApiError {
    fn from(e: TargetError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::DuplicateRequest { .. } => ApiError::Conflict(e.to_string()),
            other => ApiError::Internal(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_bad_request_carries_sanitized_message() {
        let response = ApiError::BadRequest("bad\u{0000} target".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "bad target");
    }

    #[tokio::test]
    async fn test_internal_error_is_opaque() {
        let response = ApiError::Internal(anyhow::anyhow!("secret detail")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "internal_error");
    }

    #[tokio::test]
    async fn test_duplicate_maps_to_conflict() {
        let err: ApiError = DatabaseError::DuplicateRequest {
            kind: "EMAIL".into(),
            target: "example.com".into(),
        }
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Duplicate request for EMAIL example.com");
    }

    #[tokio::test]
    async fn test_gone_body_shape() {
        let response = ApiError::Gone.into_response();
        assert_eq!(response.status(), StatusCode::GONE);
        let body = body_json(response).await;
        assert_eq!(body["error"], "endpoint_removed");
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_rate_limited_code() {
        let response = ApiError::RateLimited.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body["error"], "rate_limited");
    }
}
