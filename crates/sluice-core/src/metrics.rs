//! Prometheus metrics helpers for sluice.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sluice_core::metrics::{init_metrics, start_metrics_server};
//!
//! let handle = init_metrics();
//! start_metrics_server(9090, handle).await?;
//!
//! metrics::counter!("ingest_webhooks_total", "system" => "stripe").increment(1);
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`ingest_`, `queue_`, `drain_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: `system`, `sink` or `object` only; never per-event values

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Returns `None` if a recorder is already installed (tests, or a second
/// call at startup).
pub fn init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server on `port`, serving `/metrics`.
///
/// Binds before returning so that a port conflict surfaces as an error at
/// startup; the server itself runs on a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

/// Register descriptions for every metric sluice records.
fn register_metrics() {
    // =========================================================================
    // Ingestion
    // =========================================================================

    describe_counter!(
        "ingest_webhooks_total",
        "Webhook deliveries received (label: system)"
    );
    describe_counter!(
        "ingest_events_enqueued_total",
        "Canonical objects appended to a queue (label: object)"
    );
    describe_counter!(
        "ingest_events_invalid_total",
        "Objects dropped because they failed schema validation (label: object)"
    );
    describe_counter!(
        "ingest_events_dropped_total",
        "Events dropped before validation: bad JSON, bad signature, unknown type"
    );
    describe_counter!(
        "ingest_enqueue_errors_total",
        "Queue append failures (label: object)"
    );

    // =========================================================================
    // Queues
    // =========================================================================

    describe_gauge!("queue_length", "Pending items per queue (label: object)");
    describe_counter!("queue_segments_sealed_total", "Queue segments sealed");
    describe_counter!(
        "queue_segments_deleted_total",
        "Fully consumed queue segments deleted"
    );

    // =========================================================================
    // Drain workers
    // =========================================================================

    describe_counter!(
        "drain_items_written_total",
        "Items written to a sink and dequeued (label: sink)"
    );
    describe_counter!(
        "drain_write_errors_total",
        "Failed sink batch writes (label: sink)"
    );
    describe_histogram!(
        "drain_write_duration_seconds",
        "Time spent in a sink batch write (label: sink)"
    );
}

/// Increment a counter carrying one label.
#[inline]
pub fn increment_labeled(name: &'static str, label: &'static str, value: &str, count: u64) {
    metrics::counter!(name, label => value.to_string()).increment(count);
}

/// Set the `queue_length` gauge for one object type.
#[inline]
pub fn set_queue_length(object: &str, length: usize) {
    metrics::gauge!("queue_length", "object" => object.to_string()).set(length as f64);
}
