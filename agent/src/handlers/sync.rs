//! Sync control handlers.

use serde::{Deserialize, Serialize};

use crate::context::SyncContext;
use crate::error::Result;
use crate::sync::{SyncOutcome, SyncState, Trigger};

/// Request body for the offline switch.
#[derive(Debug, Deserialize)]
pub struct OfflineRequest {
    pub offline: bool,
}

/// Request body for cache invalidation; no collection means all of them.
#[derive(Debug, Default, Deserialize)]
pub struct InvalidateRequest {
    #[serde(default)]
    pub collection: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineResponse {
    pub offline: bool,
    /// Whether a cycle was requested because the device came back online
    pub sync_requested: bool,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub accepted: bool,
}

#[derive(Debug, Serialize)]
pub struct ClearErrorsResponse {
    pub cleared: usize,
}

/// Run a cycle now and report how it went.
pub async fn handle_sync(ctx: &SyncContext) -> SyncOutcome {
    ctx.orchestrator.start_sync().await
}

pub async fn handle_force_sync(ctx: &SyncContext) -> Result<SyncOutcome> {
    Ok(ctx.orchestrator.force_sync().await?)
}

pub async fn handle_status(ctx: &SyncContext) -> Result<SyncState> {
    Ok(ctx.orchestrator.status().await?)
}

pub async fn handle_clear_errors(ctx: &SyncContext) -> Result<ClearErrorsResponse> {
    let cleared = ctx.orchestrator.clear_errors().await?;
    Ok(ClearErrorsResponse { cleared })
}

/// Switch offline mode. Going back online asks for a cycle.
pub fn handle_offline(ctx: &SyncContext, request: OfflineRequest) -> OfflineResponse {
    let was_offline = ctx.remote.is_offline();
    ctx.remote.set_offline(request.offline);

    let sync_requested = was_offline && !request.offline && ctx.request_sync(Trigger::Manual);
    OfflineResponse {
        offline: request.offline,
        sync_requested,
    }
}

/// The application came back to the foreground.
pub fn handle_foreground(ctx: &SyncContext) -> TriggerResponse {
    TriggerResponse {
        accepted: ctx.request_sync(Trigger::Foreground),
    }
}

pub fn handle_invalidate(ctx: &SyncContext, request: InvalidateRequest) {
    ctx.local.invalidate_cache(request.collection.as_deref());
    tracing::debug!(collection = ?request.collection, "Cache invalidated");
}
