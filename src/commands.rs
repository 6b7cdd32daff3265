//! CLI command handlers.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use keel_events::{EventBus, InMemoryEventStore};
use keel_reconciler::{
    diff, Application, ChangeRecord, ClusterClient, Controller, DeltaKind, DiffOptions,
    DiffSummary, DirectorySource, IgnoreRules, InMemoryCluster, LiveStateObserver,
    ManifestFetcher, ResourceDelta, SourceRepository, TracingSink,
};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use crate::cli::Commands;
use crate::config::KeelConfig;

/// Execute a CLI command.
pub async fn execute_command(command: Commands, config: KeelConfig) -> Result<()> {
    match command {
        Commands::Run { bind } => cmd_run(config, bind).await,
        Commands::Validate => cmd_validate(&config).await,
        Commands::Diff { app, json } => cmd_diff(&config, &app, json).await,
    }
}

/// Run the controller with every configured application and serve the API.
async fn cmd_run(mut config: KeelConfig, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind_address = bind;
    }
    let addr = config.bind_address()?;

    let bus = Arc::new(EventBus::new(Arc::new(InMemoryEventStore::new())));
    let controller = Controller::builder()
        .with_source(Arc::new(DirectorySource::new(&config.source.root)) as Arc<dyn SourceRepository>)
        .with_cluster(
            keel_reconciler::IN_CLUSTER,
            Arc::new(InMemoryCluster::new()) as Arc<dyn ClusterClient>,
        )
        .with_config(config.controller.clone())
        .with_bus(bus)
        .with_sink(Arc::new(TracingSink))
        .build()
        .context("Failed to build controller")?;

    for app in config.applications {
        let name = app.name.clone();
        controller
            .register(app)
            .await
            .with_context(|| format!("Failed to register application '{name}'"))?;
    }
    info!(
        applications = controller.list().await.len(),
        source_root = %config.source.root.display(),
        "Controller started"
    );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let served = keel_web::serve(listener, Arc::clone(&controller), wait_for_shutdown()).await;

    info!("Stopping controller");
    controller.shutdown().await;
    served.context("API server failed")?;
    info!("keel stopped gracefully");
    Ok(())
}

/// Result of fetching one application's manifests.
#[derive(Debug)]
struct FetchSummary {
    app: String,
    outcome: std::result::Result<(String, usize), String>,
}

async fn fetch_summaries(config: &KeelConfig) -> Vec<FetchSummary> {
    let fetcher = fetcher(config);
    let mut summaries = Vec::with_capacity(config.applications.len());
    for app in &config.applications {
        let outcome = fetch_for(&fetcher, app)
            .await
            .map(|set| (set.revision().to_string(), set.len()))
            .map_err(|e| format!("{e:#}"));
        summaries.push(FetchSummary {
            app: app.name.to_string(),
            outcome,
        });
    }
    summaries
}

/// Check the configuration and every application's manifests.
async fn cmd_validate(config: &KeelConfig) -> Result<()> {
    let summaries = fetch_summaries(config).await;
    let mut failures = 0_usize;
    for summary in &summaries {
        match &summary.outcome {
            Ok((revision, count)) => {
                println!("ok    {:<24} {revision:<16} {count} resources", summary.app);
            }
            Err(reason) => {
                failures = failures.saturating_add(1);
                println!("FAIL  {:<24} {reason}", summary.app);
            }
        }
    }
    if failures > 0 {
        bail!("{failures} of {} applications failed validation", summaries.len());
    }
    info!(applications = summaries.len(), "Configuration is valid");
    Ok(())
}

/// Diff one application against an empty in-memory cluster.
async fn cmd_diff(config: &KeelConfig, name: &str, json: bool) -> Result<()> {
    let app = config
        .applications
        .iter()
        .find(|app| app.name.as_str() == name)
        .with_context(|| format!("No application named '{name}' in the config"))?;

    let deltas = diff_application(config, app, Arc::new(InMemoryCluster::new())).await?;
    if json {
        let records: Vec<ChangeRecord> = deltas
            .iter()
            .filter(|d| d.kind != DeltaKind::Unchanged)
            .map(ChangeRecord::from)
            .collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print!("{}", render_diff(&deltas));
    }
    Ok(())
}

async fn diff_application(
    config: &KeelConfig,
    app: &Application,
    cluster: Arc<dyn ClusterClient>,
) -> Result<Vec<ResourceDelta>> {
    let desired = fetch_for(&fetcher(config), app).await?;
    let live = LiveStateObserver::new(cluster)
        .observe(&app.selector())
        .await
        .context("Failed to observe cluster")?;
    let options = DiffOptions::default()
        .with_prune(app.policy.prune)
        .with_ignore(
            IgnoreRules::default().extend(config.controller.ignore_differences.iter().cloned()),
        );
    Ok(diff(&desired, &live, &options))
}

fn fetcher(config: &KeelConfig) -> ManifestFetcher {
    ManifestFetcher::new(
        Arc::new(DirectorySource::new(&config.source.root)),
        config.controller.manifest_cache_capacity,
    )
}

async fn fetch_for(
    fetcher: &ManifestFetcher,
    app: &Application,
) -> Result<keel_reconciler::ManifestSet> {
    let set = fetcher
        .fetch_current(&app.source)
        .await
        .with_context(|| format!("Failed to fetch manifests for '{}'", app.name))?;
    set.for_destination(&app.destination)
        .with_context(|| format!("Invalid manifests for '{}'", app.name))
}

/// Human-readable diff, one line per changed resource plus a summary.
fn render_diff(deltas: &[ResourceDelta]) -> String {
    let mut out = String::new();
    for delta in deltas {
        let line = match delta.kind {
            DeltaKind::Create => format!("+ {}", delta.key),
            DeltaKind::Update => format!("~ {} [{}]", delta.key, delta.changed_fields.join(", ")),
            DeltaKind::Delete => format!("- {}", delta.key),
            DeltaKind::Ignored => format!("? {} (not declared, prune disabled)", delta.key),
            DeltaKind::Unchanged => continue,
        };
        let _ = writeln!(out, "{line}");
    }
    let summary = DiffSummary::of(deltas);
    let _ = writeln!(
        out,
        "{} to create, {} to update, {} to delete, {} ignored, {} unchanged",
        summary.create, summary.update, summary.delete, summary.ignored, summary.unchanged
    );
    out
}

/// Wait for shutdown signal (Ctrl+C).
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => {
            error!("Failed to listen for shutdown signal: {}", err);
            warn!("Running until the process is killed");
            std::future::pending::<()>().await;
        }
    }
}
