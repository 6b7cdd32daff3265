//! keel configuration file.
//!
//! ```toml
//! [controller]
//! sync_interval = 180
//! suspend_on_degraded = true
//!
//! [source]
//! root = "/var/lib/keel/repos"
//!
//! [server]
//! bind_address = "127.0.0.1:8080"
//!
//! [[applications]]
//! name = "guestbook"
//! source = { repo_url = "guestbook", path = "deploy" }
//! policy = { automated = true, prune = true }
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use keel_reconciler::{Application, ControllerConfig};
use serde::{Deserialize, Serialize};

/// Overrides `[source] root`.
pub const ENV_SOURCE_ROOT: &str = "KEEL_SOURCE_ROOT";
/// Overrides `[server] bind_address`.
pub const ENV_BIND_ADDRESS: &str = "KEEL_BIND_ADDRESS";

/// Where the directory source reads repositories from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub root: PathBuf,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("repos"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub controller: ControllerConfig,
    pub source: SourceSettings,
    pub server: ServerSettings,
    pub applications: Vec<Application>,
}

impl KeelConfig {
    /// Load, apply environment overrides and validate.
    ///
    /// A relative `[source] root` is resolved against the config file's
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = keel_core::load_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;
        let config = config
            .with_overrides(|key| std::env::var(key).ok())
            .relative_to(path.parent().unwrap_or_else(|| Path::new("")));
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, keyed by environment variable name.
    #[must_use]
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_SOURCE_ROOT).filter(|v| !v.trim().is_empty()) {
            self.source.root = PathBuf::from(root);
        }
        if let Some(bind) = lookup(ENV_BIND_ADDRESS).filter(|v| !v.trim().is_empty()) {
            self.server.bind_address = bind;
        }
        self
    }

    #[must_use]
    fn relative_to(mut self, base: &Path) -> Self {
        if self.source.root.is_relative() {
            self.source.root = base.join(&self.source.root);
        }
        self
    }

    /// Parsed `[server] bind_address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not `host:port`.
    pub fn bind_address(&self) -> Result<SocketAddr> {
        self.server
            .bind_address
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", self.server.bind_address))
    }

    /// Check everything the controller would otherwise reject at startup.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.controller
            .validate()
            .context("Invalid [controller] section")?;
        self.bind_address()?;

        let mut seen = HashSet::new();
        for app in &self.applications {
            app.validate()
                .with_context(|| format!("Invalid application '{}'", app.name))?;
            if !seen.insert(app.name.as_str()) {
                bail!("Application '{}' is declared twice", app.name);
            }
        }
        Ok(())
    }
}
