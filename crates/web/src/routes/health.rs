//! Liveness probe: GET /health

use axum::{extract::State, response::Json};
use keel_events::SyncStatus;
use keel_reconciler::AppStatus;
use serde::Serialize;

use crate::error::Result;
use crate::AppState;

/// Process liveness plus a fleet-wide count of applications needing attention.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    applications: usize,
    out_of_sync: usize,
    suspended: usize,
    stale: usize,
}

/// GET /health
///
/// Always 200 while the process serves requests; drifting or suspended
/// applications are reported, not treated as an unhealthy controller.
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    let statuses = state.controller.list().await;
    let count = |pred: fn(&AppStatus) -> bool| statuses.iter().filter(|s| pred(s)).count();
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        applications: statuses.len(),
        out_of_sync: count(|s| s.sync_status == SyncStatus::OutOfSync),
        suspended: count(|s| s.autosync_suspended),
        stale: count(|s| s.snapshot_stale),
    }))
}
