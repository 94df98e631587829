//! Webhook ingestion endpoint.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use sluice_ingest::{Error, WebhookRequest};
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::state::AppState;

/// `POST /{name}`: hand the delivery to the source adapter called `name`.
///
/// The response is 200 once the delivery is accepted; decoding, mapping,
/// validation and the queue append run afterwards on their own task unless
/// the server acknowledges only after the write.
pub async fn receive(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let Some(source) = state.systems().source(&name) else {
        return Err(ApiError::NotFound(format!("no source system named '{name}'")));
    };

    let ingestor = state.ingestor().clone();
    let request = WebhookRequest { headers, body };
    let handle = async move {
        match source.handle_webhook(&ingestor, request).await {
            Ok(count) => debug!(system = %name, enqueued = count, "webhook handled"),
            // Already logged where they happened.
            Err(
                e @ (Error::Validation { .. }
                | Error::Enqueue { .. }
                | Error::UnknownObject(_)
                | Error::Webhook(_)),
            ) => debug!(system = %name, error = %e, "webhook dropped"),
            Err(e) => warn!(system = %name, error = %e, "webhook dropped"),
        }
    };

    if state.ack_after_write() {
        handle.await;
    } else {
        state.spawn_handler(handle);
    }

    Ok(StatusCode::OK)
}
