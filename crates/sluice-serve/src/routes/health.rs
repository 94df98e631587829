//! Health check endpoint.

use axum::Json;
use serde::Serialize;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    system_info: SystemInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    version: &'static str,
}

/// Reports `available` for as long as the process accepts connections.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "available",
        system_info: SystemInfo {
            version: sluice_core::VERSION,
        },
    })
}
