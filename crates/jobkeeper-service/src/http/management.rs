//! Leader-only operations on the dispatch loop. The router gates these on
//! leadership, so handlers can assume this instance holds the lease.

use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::{api_error, ApiError};
use crate::app::AppState;

/// POST /management/tick: run one dispatch pass now instead of waiting for
/// the next interval. Dispatches continue in the background.
pub async fn tick_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let handles = state.scheduler.tick(Utc::now()).await.map_err(api_error)?;
    info!(dispatched = handles.len(), "manual tick");
    Ok(Json(json!({"dispatched": handles.len()})))
}

/// POST /management/recover: re-queue jobs stuck in EXECUTING.
pub async fn recover_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let recovered = state
        .scheduler
        .recover_stale(Utc::now())
        .await
        .map_err(api_error)?;
    Ok(Json(json!({"recovered": recovered})))
}
