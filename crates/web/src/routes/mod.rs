//! REST API routes
//!
//! ## Route Structure
//!
//! - `GET /health` - Liveness probe
//! - `GET /api/applications` - List applications
//! - `GET /api/applications/{name}` - Application status
//! - `GET /api/applications/{name}/history` - Sync history
//! - `GET /api/applications/{name}/events` - Lifecycle events
//! - `POST /api/applications/{name}/sync` - Manual sync
//! - `DELETE /api/applications/{name}/sync` - Cancel a queued sync
//! - `POST /api/applications/{name}/refresh` - Refresh from source
//! - `POST /api/webhook` - Repository push notification
//!
//! Errors are RFC 7807 problem details.

use axum::{
    routing::{get, post},
    Router,
};

use crate::AppState;

pub mod applications;
pub mod health;
pub mod webhook;

/// Create the router with every endpoint registered.
pub fn create_router() -> Router<AppState> {
    let api_routes = Router::new()
        .route("/applications", get(applications::list_applications))
        .route("/applications/{name}", get(applications::get_application))
        .route("/applications/{name}/history", get(applications::get_history))
        .route("/applications/{name}/events", get(applications::get_events))
        .route(
            "/applications/{name}/sync",
            post(applications::trigger_sync).delete(applications::cancel_sync),
        )
        .route(
            "/applications/{name}/refresh",
            post(applications::refresh_application),
        )
        .route("/webhook", post(webhook::handle_webhook));

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api", api_routes)
}
