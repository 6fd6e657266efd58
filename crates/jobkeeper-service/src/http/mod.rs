pub mod health;
pub mod jobs;
pub mod management;

use axum::{http::StatusCode, Json};
use jobkeeper_scheduler::SchedulerError;
use serde_json::{json, Value};
use tracing::error;

pub type ApiError = (StatusCode, Json<Value>);

/// Map a scheduler error to its HTTP status and `{error, code}` body.
pub fn api_error(err: SchedulerError) -> ApiError {
    let status = match &err {
        SchedulerError::Validation(_) => StatusCode::BAD_REQUEST,
        SchedulerError::JobNotFound { .. } => StatusCode::NOT_FOUND,
        SchedulerError::JobExists { .. } | SchedulerError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        SchedulerError::Database(_)
        | SchedulerError::Repository(_)
        | SchedulerError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "request failed");
    }

    let mut body = json!({"error": err.to_string(), "code": err.code()});
    if let SchedulerError::Validation(details) = &err {
        body["details"] = json!(details);
    }
    (status, Json(body))
}
