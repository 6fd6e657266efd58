use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use jobkeeper_core::{JobkeeperConfig, JobkeeperError};
use jobkeeper_scheduler::{JobScheduler, LeaderState};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;

use crate::http::{health, jobs, management};

/// Central shared state: passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: JobkeeperConfig,
    pub scheduler: JobScheduler,
    /// Published by the leader elector.
    pub leader: watch::Receiver<LeaderState>,
    /// This instance's lease token.
    pub instance: String,
}

impl AppState {
    pub fn new(
        config: JobkeeperConfig,
        scheduler: JobScheduler,
        leader: watch::Receiver<LeaderState>,
        instance: String,
    ) -> Self {
        Self {
            config,
            scheduler,
            leader,
            instance,
        }
    }

    pub fn leader_state(&self) -> LeaderState {
        *self.leader.borrow()
    }
}

/// Assemble the full Axum router.
///
/// Job submission, lookup and cancellation are served by every instance.
/// `/management/*` operates the dispatch loop and only answers on the leader.
pub fn build_router(state: Arc<AppState>) -> Router {
    let management = Router::new()
        .route("/management/tick", post(management::tick_handler))
        .route("/management/recover", post(management::recover_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_leader,
        ));

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/jobs", post(jobs::submit_handler))
        .route(
            "/jobs/{id}",
            get(jobs::get_handler)
                .delete(jobs::cancel_handler)
                .patch(jobs::reschedule_handler),
        )
        .merge(management)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Rejects the request with 503 unless this instance holds the lease.
async fn require_leader(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.leader_state() != LeaderState::Leader {
        let err = JobkeeperError::NotLeader;
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": err.to_string(), "code": err.code()})),
        )
            .into_response();
    }
    next.run(request).await
}
