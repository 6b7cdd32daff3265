//! keel HTTP API
//!
//! Status queries, manual sync and cancel, and the repository webhook,
//! served by axum over a shared [`Controller`].

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use std::sync::Arc;

use keel_reconciler::Controller;

pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;

pub use error::{AppError, ErrorResponse};
pub use server::{create_app, serve};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
}

impl AppState {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }
}
