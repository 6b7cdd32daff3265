//! Middleware for the keel HTTP API.
//!
//! Every request is logged once it completes. Requests addressed to one
//! application carry its name as the `app` field, so a sync triggered over
//! HTTP can be followed into the controller's own log lines.

use std::time::Instant;

use axum::{
    extract::Request,
    http::{Method, StatusCode},
    middleware::Next,
    response::Response,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APPLICATIONS_PREFIX: &str = "/api/applications/";

/// CORS middleware layer
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Application named by a `/api/applications/{name}[/...]` path.
pub fn application_of(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(APPLICATIONS_PREFIX)?;
    let name = rest.split('/').next().unwrap_or_default();
    (!name.is_empty()).then_some(name)
}

#[derive(Debug)]
struct AccessLog {
    method: Method,
    path: String,
    app: Option<String>,
    start: Instant,
}

impl AccessLog {
    fn begin(req: &Request) -> Self {
        let path = req.uri().path().to_string();
        let app = application_of(&path).map(str::to_string);
        Self {
            method: req.method().clone(),
            path,
            app,
            start: Instant::now(),
        }
    }

    fn finish(self, status: StatusCode) {
        let elapsed_ms = self.start.elapsed().as_millis();
        let app = self.app.as_deref().unwrap_or("-");
        let status = status.as_u16();
        match status {
            500..=u16::MAX => error!(method = %self.method, path = %self.path, app, status, elapsed_ms, "Request failed"),
            400..=499 => warn!(method = %self.method, path = %self.path, app, status, elapsed_ms, "Request rejected"),
            _ => info!(method = %self.method, path = %self.path, app, status, elapsed_ms, "Request served"),
        }
    }
}

/// Log each request with its application, status and latency.
pub async fn logging_middleware(req: Request, next: Next) -> Response {
    let log = AccessLog::begin(&req);
    let response = next.run(req).await;
    log.finish(response.status());
    response
}

/// Layer logging and CORS onto a router.
pub fn apply_middleware(app: Router) -> Router {
    app.layer(axum::middleware::from_fn(logging_middleware))
        .layer(cors_layer())
}
