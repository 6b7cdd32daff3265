//! Application endpoints
//!
//! - `GET /api/applications` - Status of every application
//! - `GET /api/applications/{name}` - Status of one application
//! - `GET /api/applications/{name}/history` - Recent sync operations, newest first
//! - `GET /api/applications/{name}/events` - Retained lifecycle events, oldest first
//! - `POST /api/applications/{name}/sync` - Request a manual sync
//! - `DELETE /api/applications/{name}/sync` - Cancel a queued sync
//! - `POST /api/applications/{name}/refresh` - Recompute drift without syncing

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use keel_events::{AppName, SyncEvent, SyncStatus};
use keel_reconciler::{AppStatus, SyncOperation, TriggerOutcome};
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::AppState;

/// Response for a sync request
#[derive(Debug, Serialize)]
pub struct SyncResponse {
    app: AppName,
    outcome: TriggerOutcome,
}

/// Response for a cancel request
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    app: AppName,
    cancelled: bool,
}

/// Response for a refresh request
#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    app: AppName,
    sync_status: SyncStatus,
}

/// GET /api/applications
pub async fn list_applications(State(state): State<AppState>) -> Json<Vec<AppStatus>> {
    Json(state.controller.list().await)
}

/// GET /api/applications/{name}
pub async fn get_application(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<AppStatus>> {
    let status = state.controller.status(&AppName::new(name)).await?;
    Ok(Json(status))
}

/// GET /api/applications/{name}/history
pub async fn get_history(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<SyncOperation>>> {
    let history = state.controller.history(&AppName::new(name)).await?;
    Ok(Json(history))
}

/// GET /api/applications/{name}/events
pub async fn get_events(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<SyncEvent>>> {
    let events = state.controller.events(&AppName::new(name)).await?;
    Ok(Json(events))
}

/// POST /api/applications/{name}/sync
pub async fn trigger_sync(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<SyncResponse>)> {
    let app = AppName::new(name);
    let outcome = state.controller.sync(&app).await?;
    info!(app = %app, ?outcome, "Manual sync requested");
    Ok((StatusCode::ACCEPTED, Json(SyncResponse { app, outcome })))
}

/// DELETE /api/applications/{name}/sync
pub async fn cancel_sync(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<CancelResponse>> {
    let app = AppName::new(name);
    let cancelled = state.controller.cancel_queued(&app).await?;
    Ok(Json(CancelResponse { app, cancelled }))
}

/// POST /api/applications/{name}/refresh
pub async fn refresh_application(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<RefreshResponse>> {
    let app = AppName::new(name);
    let sync_status = state.controller.refresh(&app).await?;
    Ok(Json(RefreshResponse { app, sync_status }))
}
