//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// keel - declarative GitOps reconciliation
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version)]
#[command(about = "Keep cluster state converged on the manifests in a source repository")]
#[command(
    long_about = "keel watches application sources, diffs them against live cluster state and applies the differences, manually or automatically."
)]
pub struct Cli {
    /// Configuration file (.toml, .yaml or .json)
    #[arg(short, long, default_value = "keel.toml", global = true)]
    pub config: PathBuf,

    /// Log filter, overriding RUST_LOG (e.g. "debug" or "keel_reconciler=trace")
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller and serve the HTTP API
    Run {
        /// Address to bind, overriding [server] bind_address
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Check the configuration and fetch every application's manifests
    Validate,

    /// Show what a sync of one application would change
    Diff {
        /// Application name
        app: String,

        /// Print the diff as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["keel", "validate"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("keel.toml"));
        assert!(cli.log_level.is_none());
        assert!(matches!(cli.command, Commands::Validate));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "keel",
            "run",
            "--bind",
            "0.0.0.0:9000",
            "--config",
            "demos/keel.toml",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("demos/keel.toml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Run { bind } => assert_eq!(bind.as_deref(), Some("0.0.0.0:9000")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_diff_requires_app() {
        assert!(Cli::try_parse_from(["keel", "diff"]).is_err());
        let cli = Cli::try_parse_from(["keel", "diff", "guestbook", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Diff { ref app, json: true } if app == "guestbook"
        ));
    }
}
