//! # Stockroom Agent
//!
//! Offline-first sync for Stockroom's inventory data. Every write lands in
//! the durable local store first; a pending-operation queue and a
//! background sync cycle reconcile the device with the remote document
//! store whenever it is reachable.
//!
//! [`context::SyncContext`] wires the components for library use; the
//! binary exposes the same operations through a small control API.

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod local;
pub mod mapper;
pub mod queue;
pub mod reconciler;
pub mod remote;
pub mod routes;
pub mod storage;
pub mod sync;
pub mod writer;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::context::SyncContext;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<SyncContext>,
    pub config: Arc<Config>,
}

/// Control API router with tracing and CORS layers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
