//! Process variables for operators.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct VarsResponse {
    version: &'static str,
    /// Live runtime tasks (drain workers, in-flight webhook handlers, server).
    tasks: usize,
    timestamp: String,
    uptime_secs: u64,
    /// Pending envelopes per object type.
    queues: BTreeMap<String, usize>,
    systems: Vec<SystemVar>,
}

#[derive(Debug, Clone, Serialize)]
struct SystemVar {
    name: String,
    role: &'static str,
    state: String,
}

pub async fn debug_vars(State(state): State<AppState>) -> Json<VarsResponse> {
    let systems = state
        .systems()
        .iter()
        .map(|adapter| SystemVar {
            name: adapter.name().to_string(),
            role: adapter.handle().role().as_str(),
            state: adapter.state().to_string(),
        })
        .collect();

    Json(VarsResponse {
        version: sluice_core::VERSION,
        tasks: tokio::runtime::Handle::current().metrics().num_alive_tasks(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: state.started_at().elapsed().as_secs(),
        queues: state.ingestor().queues().lengths(),
        systems,
    })
}
