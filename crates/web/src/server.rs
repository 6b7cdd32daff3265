//! Server setup with Tower middleware

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use keel_reconciler::Controller;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::middleware::apply_middleware;
use crate::routes;
use crate::AppState;

/// Build the application router over `controller`.
pub fn create_app(controller: Arc<Controller>) -> Router {
    let app = routes::create_router().with_state(AppState::new(controller));
    apply_middleware(app).layer(TraceLayer::new_for_http())
}

/// Serve the API on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns the I/O error that stopped the server.
pub async fn serve<F>(
    listener: TcpListener,
    controller: Arc<Controller>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "keel API listening");
    axum::serve(listener, create_app(controller))
        .with_graceful_shutdown(shutdown)
        .await
}
