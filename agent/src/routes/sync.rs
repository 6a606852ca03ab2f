//! Sync control routes.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use crate::auth::ApiCaller;
use crate::error::Result;
use crate::handlers::{
    handle_clear_errors, handle_foreground, handle_force_sync, handle_invalidate, handle_offline,
    handle_status, handle_sync, ClearErrorsResponse, InvalidateRequest, OfflineRequest,
    OfflineResponse, TriggerResponse,
};
use crate::sync::{SyncOutcome, SyncState};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync", post(sync_handler))
        .route("/sync/force", post(force_handler))
        .route("/sync/status", get(status_handler))
        .route("/sync/errors/clear", post(clear_errors_handler))
        .route("/sync/offline", post(offline_handler))
        .route("/app/foreground", post(foreground_handler))
        .route("/cache/invalidate", post(invalidate_handler))
}

/// POST /sync - run a cycle and return its outcome.
async fn sync_handler(State(state): State<AppState>, _caller: ApiCaller) -> Json<SyncOutcome> {
    Json(handle_sync(&state.ctx).await)
}

/// POST /sync/force - retry errored operations, then run a cycle.
async fn force_handler(
    State(state): State<AppState>,
    _caller: ApiCaller,
) -> Result<Json<SyncOutcome>> {
    Ok(Json(handle_force_sync(&state.ctx).await?))
}

/// GET /sync/status
async fn status_handler(
    State(state): State<AppState>,
    _caller: ApiCaller,
) -> Result<Json<SyncState>> {
    Ok(Json(handle_status(&state.ctx).await?))
}

/// POST /sync/errors/clear - drop errored operations.
async fn clear_errors_handler(
    State(state): State<AppState>,
    _caller: ApiCaller,
) -> Result<Json<ClearErrorsResponse>> {
    Ok(Json(handle_clear_errors(&state.ctx).await?))
}

/// POST /sync/offline
async fn offline_handler(
    State(state): State<AppState>,
    _caller: ApiCaller,
    Json(request): Json<OfflineRequest>,
) -> Json<OfflineResponse> {
    Json(handle_offline(&state.ctx, request))
}

/// POST /app/foreground
async fn foreground_handler(
    State(state): State<AppState>,
    _caller: ApiCaller,
) -> Json<TriggerResponse> {
    Json(handle_foreground(&state.ctx))
}

/// POST /cache/invalidate
async fn invalidate_handler(
    State(state): State<AppState>,
    _caller: ApiCaller,
    Json(request): Json<InvalidateRequest>,
) -> StatusCode {
    handle_invalidate(&state.ctx, request);
    StatusCode::NO_CONTENT
}
