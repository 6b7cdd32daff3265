//! Push webhook: POST /api/webhook
//!
//! Source hosts call this when a repository changes. Automated applications
//! sourced from the repository sync; the others are refreshed.

use axum::{extract::State, response::Json};
use keel_reconciler::WebhookReport;
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::AppState;

/// Webhook payload
#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    repo_url: String,
}

/// POST /api/webhook
pub async fn handle_webhook(
    State(state): State<AppState>,
    Json(request): Json<WebhookRequest>,
) -> Result<Json<WebhookReport>> {
    let repo_url = request.repo_url.trim();
    if repo_url.is_empty() {
        return Err(AppError::BadRequest("repo_url must not be empty".to_string()));
    }
    Ok(Json(state.controller.webhook(repo_url).await))
}
