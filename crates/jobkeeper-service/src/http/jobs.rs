//! Job endpoints, served by every instance.
//!
//! | Method   | Path          | Action                              |
//! |----------|---------------|-------------------------------------|
//! | `POST`   | `/jobs`       | validate and schedule a job         |
//! | `GET`    | `/jobs/{id}`  | current record                      |
//! | `DELETE` | `/jobs/{id}`  | cancel (no-op once terminal)        |
//! | `PATCH`  | `/jobs/{id}`  | replace the trigger and reschedule  |

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use jobkeeper_scheduler::{Job, JobDescription, Trigger};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::{api_error, ApiError};
use crate::app::AppState;

#[derive(Deserialize)]
pub struct RescheduleRequest {
    pub trigger: Trigger,
}

/// POST /jobs
pub async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Json(description): Json<JobDescription>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    info!(job_id = %description.id, "job submitted");
    let job = state.scheduler.schedule(description).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /jobs/{id}
pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    state.scheduler.get(&id).await.map(Json).map_err(api_error)
}

/// DELETE /jobs/{id}
pub async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    state.scheduler.cancel(&id).await.map(Json).map_err(api_error)
}

/// PATCH /jobs/{id}: body `{"trigger": {...}}`.
pub async fn reschedule_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<RescheduleRequest>,
) -> Result<Json<Job>, ApiError> {
    state
        .scheduler
        .reschedule(&id, request.trigger)
        .await
        .map(Json)
        .map_err(api_error)
}
