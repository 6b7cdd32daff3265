//! # keel - declarative GitOps reconciliation
//!
//! Entry point for the keel binary.
//!
//! ## Startup
//!
//! 1. **Tracing** - `RUST_LOG`, overridden by `--log-level`
//! 2. **Config** - the file named by `--config`, plus environment overrides
//! 3. **Command** - `run`, `validate` or `diff`
//!
//! ## Shutdown
//!
//! `run` stops on Ctrl+C: the API drains in-flight requests, then every
//! application's background tasks are stopped. A sync already applying
//! finishes its current resource call before its worker exits.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;
mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::Cli;
use crate::config::KeelConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = KeelConfig::load(&cli.config)?;
    debug!(
        config = %cli.config.display(),
        applications = config.applications.len(),
        "Configuration loaded"
    );

    commands::execute_command(cli.command, config).await
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing(level: Option<&str>) {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn env_filter(level: Option<&str>) -> EnvFilter {
    level
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_level_wins() {
        assert_eq!(env_filter(Some("debug")).to_string(), "debug");
    }

    #[test]
    fn test_invalid_level_falls_back() {
        let filter = env_filter(Some("keel=[unclosed"));
        assert!(!filter.to_string().contains("unclosed"));
    }
}
