use axum::{extract::State, Json};
use jobkeeper_scheduler::LeaderState;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness probe, returns instance metadata and leadership.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("JOBKEEPER_GIT_SHA"),
        "instance": state.instance,
        "lease": state.config.scheduler.lease_id,
        "leader": state.leader_state() == LeaderState::Leader,
    }))
}
