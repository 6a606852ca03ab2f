//! Liveness and sync overview.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use stockroom_engine::OpStatus;

use crate::sync::SyncPhase;
use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub phase: SyncPhase,
    /// Queued operations waiting to be pushed; absent when the queue
    /// could not be read
    pub pending: Option<usize>,
    pub remote_enabled: bool,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

/// GET /health - always 200 while the process serves requests.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let ctx = &state.ctx;
    let pending = match ctx.queue.count(OpStatus::Pending).await {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!("Health check could not read the queue: {}", e);
            None
        }
    };
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        phase: ctx.orchestrator.phase(),
        pending,
        remote_enabled: ctx.remote.is_enabled(),
    })
}

async fn root() -> &'static str {
    "Stockroom Agent"
}
