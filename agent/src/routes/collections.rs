//! Collection routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use stockroom_engine::ReconcileSummary;

use crate::auth::ApiCaller;
use crate::error::Result;
use crate::handlers::{
    create_record, delete_record, get_record, list_records, reconcile_collection, update_record,
};
use crate::AppState;

/// Create collection routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/collections/{name}", get(list_handler).post(create_handler))
        .route(
            "/collections/{name}/{id}",
            get(get_handler).patch(update_handler).delete(delete_handler),
        )
        .route("/collections/{name}/reconcile", post(reconcile_handler))
}

/// GET /collections/{name} - records of the signed-in user.
async fn list_handler(
    State(state): State<AppState>,
    _caller: ApiCaller,
    Path(name): Path<String>,
) -> Result<Json<Vec<Value>>> {
    Ok(Json(list_records(&state.ctx, &name).await?))
}

/// GET /collections/{name}/{id}
async fn get_handler(
    State(state): State<AppState>,
    _caller: ApiCaller,
    Path((name, id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    Ok(Json(get_record(&state.ctx, &name, &id).await?))
}

/// POST /collections/{name} - optimistic create.
async fn create_handler(
    State(state): State<AppState>,
    _caller: ApiCaller,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>)> {
    let record = create_record(&state.ctx, &name, body).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// PATCH /collections/{name}/{id} - optimistic partial update.
async fn update_handler(
    State(state): State<AppState>,
    _caller: ApiCaller,
    Path((name, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    Ok(Json(update_record(&state.ctx, &name, &id, body).await?))
}

/// DELETE /collections/{name}/{id} - optimistic delete.
async fn delete_handler(
    State(state): State<AppState>,
    _caller: ApiCaller,
    Path((name, id)): Path<(String, String)>,
) -> Result<StatusCode> {
    delete_record(&state.ctx, &name, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /collections/{name}/reconcile - remove duplicates and orphans now.
async fn reconcile_handler(
    State(state): State<AppState>,
    _caller: ApiCaller,
    Path(name): Path<String>,
) -> Result<Json<ReconcileSummary>> {
    Ok(Json(reconcile_collection(&state.ctx, &name).await?))
}
