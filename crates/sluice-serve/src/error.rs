//! API error types and response formatting.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// API error type that converts to appropriate HTTP responses.
///
/// Webhook routes only ever answer 200 or 404; everything that goes wrong
/// after a delivery is accepted is logged, not returned.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No route or no source system with this name.
    #[error("not found: {0}")]
    NotFound(String),
}

/// JSON error response body.
#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg)),
        };

        (status, Json(ErrorResponse { error, message })).into_response()
    }
}
