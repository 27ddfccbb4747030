//! HTTP surface.
//!
//! Routes:
//! - `POST /request/email`: submit a target for validation
//! - `POST /request/ui`: retired, answers `410`
//! - `GET /api/checkdns/:target`: read-only status for pollers
//! - `GET /healthz`: liveness
//!
//! The request routes sit behind the per-IP rate limiter; the health
//! endpoint does not.

pub mod error;
mod handlers;
mod rate_limit;

pub use handlers::DebounceMap;
pub use rate_limit::IpRateLimiter;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use log::info;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::mailer::Notifier;
use crate::scheduler::JobScheduler;
use crate::server::error::ApiError;
use crate::storage::RequestStore;
use crate::validation::Validator;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub settings: Arc<Settings>,
    /// Request store.
    pub store: Arc<dyn RequestStore>,
    /// Validation engine.
    pub validator: Arc<Validator>,
    /// Outbound notifier.
    pub notifier: Arc<dyn Notifier>,
    /// Background job scheduler.
    pub scheduler: Arc<JobScheduler>,
    /// Read-only live-check debounce.
    pub debounce: Arc<DebounceMap>,
    /// Per-IP rate limiter.
    pub rate_limiter: Arc<IpRateLimiter>,
    /// Process start time, for `/healthz` uptime.
    pub started_at: Instant,
}

/// Builds the full router over `state`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/request/email", post(handlers::create_email_request))
        .route("/request/ui", post(handlers::create_ui_request))
        .route("/api/checkdns/:target", get(handlers::check_dns))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}

/// Per-IP admission ahead of every request route.
async fn rate_limit_middleware(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if state.rate_limiter.allow(addr.ip()) {
        next.run(request).await
    } else {
        ApiError::RateLimited.into_response()
    }
}

/// Binds and serves until `shutdown` cancels, then stops accepting
/// connections and lets in-flight requests finish.
pub async fn serve(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.settings.host, state.settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {addr}"))?;
    info!("HTTP server listening on http://{addr}/");

    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;
    Ok(())
}
