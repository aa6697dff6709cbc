use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const GIT_SHA: &str = env!("NEXUS_GIT_SHA");

/// GET /health — liveness probe, no auth (spec §6).
pub async fn handle_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let upstream_status = if state.config.upstream.base_url.is_empty() {
        "unconfigured"
    } else {
        "configured"
    };

    Json(json!({
        "status": "ok",
        "version": VERSION,
        "git_sha": GIT_SHA,
        "protocol_version": nexus_core::config::PROTOCOL_VERSION,
        "upstream": { "status": upstream_status },
    }))
}
