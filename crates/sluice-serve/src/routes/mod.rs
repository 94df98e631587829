//! HTTP route definitions.

mod health;
mod vars;
mod webhook;

use std::time::Duration;

use axum::Router;
use axum::http::{Request, Uri};
use axum::routing::{get, post};
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;

use crate::error::ApiError;
use crate::state::AppState;

/// Upper bound on handling one request, body included.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest wait for the next chunk of a request body.
pub const BODY_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the complete router.
///
/// # Route Structure
///
/// - `GET /v1/healthcheck` - Health check
/// - `GET /debug/vars` - Version, task count, uptime, queue lengths
/// - `POST /{name}` - Webhook delivery for the source system `name`
///
/// Anything else is a JSON 404.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthcheck", get(health::health_check))
        .route("/debug/vars", get(vars::debug_vars))
        .route("/{name}", post(webhook::receive))
        .fallback(not_found)
        .with_state(state)
        .layer(RequestBodyTimeoutLayer::new(BODY_READ_TIMEOUT))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                tracing::span!(
                    Level::INFO,
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }),
        )
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(format!("no route for {}", uri.path()))
}
