//! The reconciliation controller.
//!
//! Holds the application registry and wires the engine together. Each
//! registered application gets three periodic tasks (observe, evaluate
//! health, refresh from source) and a scheduler worker that runs its syncs
//! through [`SyncRunner`]. Tasks hold the controller weakly, so dropping
//! the last handle ends them.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use keel_core::LogResultExt;
use keel_events::{
    AppName, EventBus, HealthStatus, Revision, SyncEvent, SyncPhase, SyncStatus, TriggerCause,
};
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::config::ControllerConfig;
use crate::diff::{diff, DeltaKind, DiffOptions, DiffSummary, IgnoreRules, ResourceDelta};
use crate::error::{Error, Result};
use crate::executor::{ApplyExecutor, ApplyReport};
use crate::health::{ApplicationHealth, HealthEvaluator};
use crate::notify::NotificationSink;
use crate::observer::{LiveStateObserver, ObserverTask, PollOutcome};
use crate::operation::{ChangeRecord, OperationHistory, SyncFailure, SyncOperation};
use crate::scheduler::{SyncRunner, SyncScheduler, TriggerOutcome};
use crate::source::{ManifestFetcher, SourceRepository};
use crate::types::{
    Application, Destination, LiveSnapshot, ManifestSet, ResourceKey, SourceRef, SyncPolicy,
};

/// Externally visible state of one application.
#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub name: AppName,
    pub source: SourceRef,
    pub destination: Destination,
    pub policy: SyncPolicy,
    pub sync_status: SyncStatus,
    pub phase: SyncPhase,
    pub pending: Option<TriggerCause>,
    pub health: HealthStatus,
    /// Revision the source pointer resolved to on the last refresh.
    pub target_revision: Option<Revision>,
    /// Revision of the last successful sync.
    pub synced_revision: Option<Revision>,
    pub drift: DiffSummary,
    pub out_of_sync: Vec<ChangeRecord>,
    pub last_operation: Option<SyncOperation>,
    pub last_failure: Option<SyncFailure>,
    pub autosync_suspended: bool,
    pub snapshot_stale: bool,
}

/// What a webhook did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WebhookReport {
    /// Automated applications a sync was requested for.
    pub triggered: Vec<AppName>,
    /// Manual applications whose drift was recomputed.
    pub refreshed: Vec<AppName>,
}

struct AppState {
    app: Application,
    sync_status: SyncStatus,
    desired: Option<Arc<ManifestSet>>,
    target_revision: Option<Revision>,
    synced_revision: Option<Revision>,
    drift: Vec<ResourceDelta>,
    health: ApplicationHealth,
    history: OperationHistory,
    last_failure: Option<SyncFailure>,
    autosync_suspended: bool,
}

impl AppState {
    fn expected(&self) -> BTreeSet<ResourceKey> {
        self.desired
            .as_ref()
            .map(|desired| desired.keys())
            .unwrap_or_default()
    }

    fn autosync_allowed(&self) -> bool {
        self.app.policy.automated && !self.autosync_suspended
    }
}

struct AppEntry {
    name: AppName,
    cluster: Arc<dyn ClusterClient>,
    observer: Arc<ObserverTask>,
    evaluator: Mutex<HealthEvaluator>,
    state: RwLock<AppState>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Copy)]
enum Job {
    Observe,
    EvaluateHealth,
    Refresh,
}

/// Builder for [`Controller`].
#[derive(Default)]
pub struct ControllerBuilder {
    source: Option<Arc<dyn SourceRepository>>,
    clusters: HashMap<String, Arc<dyn ClusterClient>>,
    config: ControllerConfig,
    bus: Option<Arc<EventBus>>,
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source repository backend.
    pub fn with_source(mut self, source: Arc<dyn SourceRepository>) -> Self {
        self.source = Some(source);
        self
    }

    /// Register a cluster under the name destinations refer to.
    pub fn with_cluster(mut self, name: impl Into<String>, client: Arc<dyn ClusterClient>) -> Self {
        self.clusters.insert(name.into(), client);
        self
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish lifecycle events on `bus`.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Notify `sink` of sync outcomes.
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Build the controller.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when no source or cluster was given or the
    /// configuration does not validate.
    pub fn build(self) -> Result<Arc<Controller>> {
        self.config.validate()?;
        let source = self
            .source
            .ok_or_else(|| Error::invalid_config("a source repository is required"))?;
        if self.clusters.is_empty() {
            return Err(Error::invalid_config("at least one cluster is required"));
        }

        let config = self.config;
        let ignore = IgnoreRules::default().extend(config.ignore_differences.iter().cloned());
        let fetcher = ManifestFetcher::new(source, config.manifest_cache_capacity);
        let executor = ApplyExecutor::new(config.retry.clone(), config.apply_timeout)
            .with_converge_timeout(config.converge_timeout);
        let bus = self.bus;
        let clusters = self.clusters;
        let sinks = self.sinks;

        Ok(Arc::new_cyclic(|me: &Weak<Controller>| {
            let runner: Weak<dyn SyncRunner> = me.clone();
            Controller {
                scheduler: SyncScheduler::new(runner, bus.clone()),
                config,
                ignore,
                fetcher,
                executor,
                clusters,
                bus,
                sinks,
                apps: RwLock::new(HashMap::new()),
                stopped: AtomicBool::new(false),
                me: me.clone(),
            }
        }))
    }
}

/// Registry of applications and owner of their background tasks.
pub struct Controller {
    config: ControllerConfig,
    ignore: IgnoreRules,
    fetcher: ManifestFetcher,
    executor: ApplyExecutor,
    clusters: HashMap<String, Arc<dyn ClusterClient>>,
    scheduler: SyncScheduler,
    bus: Option<Arc<EventBus>>,
    sinks: Vec<Arc<dyn NotificationSink>>,
    apps: RwLock<HashMap<AppName, Arc<AppEntry>>>,
    stopped: AtomicBool,
    me: Weak<Controller>,
}

impl Controller {
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::new()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Register an application and start its tasks.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a malformed application or unknown
    /// cluster, `ApplicationExists` for a duplicate name, and `Stopped`
    /// after shutdown.
    pub async fn register(&self, app: Application) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        app.validate()?;
        let cluster = self.cluster_for(&app.destination)?;
        let name = app.name.clone();

        let mut observer = ObserverTask::new(
            name.clone(),
            LiveStateObserver::new(Arc::clone(&cluster)),
            app.selector(),
            self.config.stale_after,
            Utc::now(),
        );
        if let Some(bus) = &self.bus {
            observer = observer.with_bus(Arc::clone(bus));
        }
        let (stop, _) = watch::channel(false);
        let entry = Arc::new(AppEntry {
            name: name.clone(),
            cluster,
            observer: Arc::new(observer),
            evaluator: Mutex::new(HealthEvaluator::new(self.config.health_grace_period)),
            state: RwLock::new(AppState {
                app,
                sync_status: SyncStatus::Unknown,
                desired: None,
                target_revision: None,
                synced_revision: None,
                drift: Vec::new(),
                health: ApplicationHealth::default(),
                history: OperationHistory::new(self.config.history_limit),
                last_failure: None,
                autosync_suspended: false,
            }),
            stop,
            tasks: Mutex::new(Vec::new()),
        });

        {
            let mut apps = self.apps.write().await;
            if apps.contains_key(&name) {
                return Err(Error::application_exists(name.as_str()));
            }
            self.scheduler.register(name.clone()).await?;
            apps.insert(name.clone(), Arc::clone(&entry));
        }

        let handles = vec![
            self.spawn_job(&entry, Job::Observe, self.config.poll_interval),
            self.spawn_job(&entry, Job::EvaluateHealth, self.config.health_interval),
            self.spawn_job(&entry, Job::Refresh, self.config.sync_interval),
        ];
        *entry.tasks.lock().await = handles;

        info!(app = %name, "Application registered");
        self.publish(SyncEvent::registered(name)).await;
        Ok(())
    }

    /// Unregister an application, stopping its tasks. With `cascade` every
    /// live resource it manages is deleted.
    ///
    /// # Errors
    ///
    /// Returns `ApplicationNotFound`, or the delete failure of a cascade.
    /// The application is unregistered either way.
    pub async fn unregister(&self, name: &AppName, cascade: bool) -> Result<()> {
        let entry = self
            .apps
            .write()
            .await
            .remove(name)
            .ok_or_else(|| Error::application_not_found(name.as_str()))?;
        stop_tasks(&entry).await;
        self.scheduler
            .unregister(name)
            .await
            .debug_on_err("Scheduler had no worker");

        let result = if cascade {
            self.prune_all(&entry).await
        } else {
            Ok(())
        };

        info!(app = %name, cascade, "Application unregistered");
        self.publish(SyncEvent::unregistered(name.clone(), cascade))
            .await;
        result
    }

    async fn prune_all(&self, entry: &AppEntry) -> Result<()> {
        let snapshot = entry.observer.observe_now().await?;
        let deltas: Vec<ResourceDelta> = snapshot
            .iter()
            .map(|live| ResourceDelta {
                key: live.key().clone(),
                kind: DeltaKind::Delete,
                desired: None,
                live: Some(live.clone()),
                changed_fields: Vec::new(),
            })
            .collect();
        let destination = entry.state.read().await.app.destination.clone();
        let report = self
            .executor
            .execute(entry.cluster.as_ref(), &entry.name, &destination, &deltas)
            .await;
        match report.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Replace the sync policy of an application.
    ///
    /// # Errors
    ///
    /// Returns `ApplicationNotFound` for an unknown application.
    pub async fn update_policy(&self, name: &AppName, policy: SyncPolicy) -> Result<()> {
        let entry = self.entry(name).await?;
        let mut state = entry.state.write().await;
        // Suspension outlives policy edits; only a manual sync or turning
        // automation off lifts it.
        if !policy.automated {
            state.autosync_suspended = false;
        }
        state.app.policy = policy;
        info!(
            app = %name,
            automated = policy.automated,
            prune = policy.prune,
            self_heal = policy.self_heal,
            "Sync policy updated"
        );
        Ok(())
    }

    /// Status of one application.
    ///
    /// # Errors
    ///
    /// Returns `ApplicationNotFound` for an unknown application.
    pub async fn status(&self, name: &AppName) -> Result<AppStatus> {
        let entry = self.entry(name).await?;
        self.status_of(&entry).await
    }

    /// Status of every application, ordered by name.
    pub async fn list(&self) -> Vec<AppStatus> {
        let mut entries: Vec<Arc<AppEntry>> = self.apps.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let mut statuses = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Ok(status) = self.status_of(&entry).await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Recent operations of an application, newest first.
    ///
    /// # Errors
    ///
    /// Returns `ApplicationNotFound` for an unknown application.
    pub async fn history(&self, name: &AppName) -> Result<Vec<SyncOperation>> {
        let entry = self.entry(name).await?;
        let state = entry.state.read().await;
        Ok(state.history.newest_first())
    }

    /// Retained lifecycle events of an application, oldest first. Empty
    /// when the controller publishes to no bus.
    ///
    /// # Errors
    ///
    /// Returns `ApplicationNotFound` for an unknown application.
    pub async fn events(&self, name: &AppName) -> Result<Vec<SyncEvent>> {
        self.entry(name).await?;
        let Some(bus) = &self.bus else {
            return Ok(Vec::new());
        };
        Ok(bus
            .history(name)
            .await
            .warn_on_err("Failed to read application events")
            .unwrap_or_default())
    }

    /// Latest live snapshot of an application.
    ///
    /// # Errors
    ///
    /// Returns `ApplicationNotFound` for an unknown application.
    pub async fn snapshot(&self, name: &AppName) -> Result<Arc<LiveSnapshot>> {
        Ok(self.entry(name).await?.observer.current())
    }

    /// Latest health evaluation of an application.
    ///
    /// # Errors
    ///
    /// Returns `ApplicationNotFound` for an unknown application.
    pub async fn health(&self, name: &AppName) -> Result<ApplicationHealth> {
        let entry = self.entry(name).await?;
        let health = entry.state.read().await.health.clone();
        Ok(health)
    }

    /// Request a sync. Automatic causes are dropped, returning `None`,
    /// unless the application is automated and not suspended.
    ///
    /// # Errors
    ///
    /// Returns `ApplicationNotFound` for an unknown application.
    pub async fn trigger(&self, name: &AppName, cause: TriggerCause) -> Result<Option<TriggerOutcome>> {
        let entry = self.entry(name).await?;
        if cause.is_automatic() && !entry.state.read().await.autosync_allowed() {
            debug!(app = %name, %cause, "Automated sync not allowed, trigger dropped");
            return Ok(None);
        }
        self.scheduler.trigger(name, cause).await.map(Some)
    }

    /// Request a manual sync.
    ///
    /// # Errors
    ///
    /// Returns `ApplicationNotFound` for an unknown application.
    pub async fn sync(&self, name: &AppName) -> Result<TriggerOutcome> {
        self.entry(name).await?;
        self.scheduler.trigger(name, TriggerCause::Manual).await
    }

    /// Drop a queued sync that has not started.
    ///
    /// # Errors
    ///
    /// Returns `ApplicationNotFound` for an unknown application.
    pub async fn cancel_queued(&self, name: &AppName) -> Result<bool> {
        self.scheduler.cancel_queued(name).await
    }

    /// Handle a push notification for `repo_url`. Automated applications
    /// sourced from it are synced; the others are refreshed.
    pub async fn webhook(&self, repo_url: &str) -> WebhookReport {
        let wanted = normalize_repo_url(repo_url);
        let entries: Vec<Arc<AppEntry>> = self.apps.read().await.values().cloned().collect();
        let mut report = WebhookReport::default();
        for entry in entries {
            let (matches, automated) = {
                let state = entry.state.read().await;
                (
                    normalize_repo_url(&state.app.source.repo_url) == wanted,
                    state.autosync_allowed(),
                )
            };
            if !matches {
                continue;
            }
            if automated {
                match self.scheduler.trigger(&entry.name, TriggerCause::Webhook).await {
                    Ok(_) => report.triggered.push(entry.name.clone()),
                    Err(e) => warn!(app = %entry.name, error = %e, "Webhook trigger failed"),
                }
            } else {
                match self.refresh_entry(&entry, false).await {
                    Ok(_) => report.refreshed.push(entry.name.clone()),
                    Err(e) => warn!(app = %entry.name, error = %e, "Webhook refresh failed"),
                }
            }
        }
        report.triggered.sort();
        report.refreshed.sort();
        info!(
            repo_url,
            triggered = report.triggered.len(),
            refreshed = report.refreshed.len(),
            "Webhook handled"
        );
        report
    }

    /// Re-resolve the source of an application and recompute its drift
    /// without syncing.
    ///
    /// # Errors
    ///
    /// Returns `ApplicationNotFound`, or the source error.
    pub async fn refresh(&self, name: &AppName) -> Result<SyncStatus> {
        let entry = self.entry(name).await?;
        self.refresh_entry(&entry, false).await
    }

    /// Stop every application task and scheduler worker. Running syncs
    /// finish first.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries: Vec<Arc<AppEntry>> = self.apps.read().await.values().cloned().collect();
        for entry in &entries {
            stop_tasks(entry).await;
        }
        self.scheduler.shutdown().await;
        info!(applications = entries.len(), "Controller stopped");
    }

    async fn entry(&self, name: &AppName) -> Result<Arc<AppEntry>> {
        self.apps
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::application_not_found(name.as_str()))
    }

    fn cluster_for(&self, destination: &Destination) -> Result<Arc<dyn ClusterClient>> {
        self.clusters
            .get(&destination.cluster)
            .cloned()
            .ok_or_else(|| {
                Error::invalid_config(format!("unknown cluster '{}'", destination.cluster))
            })
    }

    fn diff_options(&self, policy: &SyncPolicy) -> DiffOptions {
        DiffOptions::default()
            .with_prune(policy.prune)
            .with_ignore(self.ignore.clone())
    }

    async fn status_of(&self, entry: &AppEntry) -> Result<AppStatus> {
        let scheduler = self.scheduler.state(&entry.name).await?;
        let snapshot = entry.observer.current();
        let state = entry.state.read().await;
        Ok(AppStatus {
            name: entry.name.clone(),
            source: state.app.source.clone(),
            destination: state.app.destination.clone(),
            policy: state.app.policy,
            sync_status: state.sync_status,
            phase: scheduler.phase,
            pending: scheduler.pending,
            health: state.health.status,
            target_revision: state.target_revision.clone(),
            synced_revision: state.synced_revision.clone(),
            drift: DiffSummary::of(&state.drift),
            out_of_sync: state
                .drift
                .iter()
                .filter(|d| d.kind.is_out_of_sync())
                .map(ChangeRecord::from)
                .collect(),
            last_operation: state.history.last().cloned(),
            last_failure: state.last_failure.clone(),
            autosync_suspended: state.autosync_suspended,
            snapshot_stale: snapshot.is_stale(),
        })
    }

    fn spawn_job(&self, entry: &Arc<AppEntry>, job: Job, period: Duration) -> JoinHandle<()> {
        let me = self.me.clone();
        let entry = Arc::clone(entry);
        let mut stop = entry.stop.subscribe();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(controller) = me.upgrade() else {
                            break;
                        };
                        controller.run_job(&entry, job).await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(app = %entry.name, ?job, "Application task stopped");
        })
    }

    async fn run_job(&self, entry: &Arc<AppEntry>, job: Job) {
        match job {
            Job::Observe => self.observe(entry).await,
            Job::EvaluateHealth => self.evaluate_health(entry).await,
            Job::Refresh => {
                if let Err(e) = self.refresh_entry(entry, true).await {
                    warn!(app = %entry.name, error = %e, "Refresh failed");
                }
            }
        }
    }

    /// Poll live state and, on a fresh snapshot, recompute drift.
    async fn observe(&self, entry: &Arc<AppEntry>) {
        let outcome = entry.observer.poll_once(Utc::now()).await;
        if !matches!(outcome, PollOutcome::Fresh { .. }) {
            return;
        }
        let snapshot = entry.observer.current();
        let actionable = self.recompute_drift(entry, &snapshot).await;
        if actionable > 0 {
            self.maybe_self_heal(entry).await;
        }
    }

    async fn maybe_self_heal(&self, entry: &AppEntry) {
        let heal = {
            let state = entry.state.read().await;
            state.autosync_allowed() && state.app.policy.self_heal
        };
        if heal {
            match self.scheduler.trigger(&entry.name, TriggerCause::SelfHeal).await {
                Ok(outcome) => debug!(app = %entry.name, ?outcome, "Self-heal requested"),
                Err(e) => warn!(app = %entry.name, error = %e, "Self-heal trigger failed"),
            }
        }
    }

    /// Diff the cached desired set against `snapshot` and store the result.
    /// Returns the number of actionable deltas.
    async fn recompute_drift(&self, entry: &AppEntry, snapshot: &LiveSnapshot) -> usize {
        let mut state = entry.state.write().await;
        let Some(desired) = state.desired.clone() else {
            return 0;
        };
        let deltas = diff(&desired, snapshot, &self.diff_options(&state.app.policy));
        let summary = DiffSummary::of(&deltas);
        let previous = state.sync_status;
        state.sync_status = if summary.out_of_sync() == 0 {
            SyncStatus::Synced
        } else {
            SyncStatus::OutOfSync
        };
        state.drift = deltas;
        let drifted = state.sync_status == SyncStatus::OutOfSync && previous == SyncStatus::Synced;
        drop(state);

        if drifted {
            info!(app = %entry.name, out_of_sync = summary.out_of_sync(), "Drift detected");
            self.publish(SyncEvent::drift_detected(
                entry.name.clone(),
                summary.out_of_sync(),
            ))
            .await;
        }
        summary.actionable()
    }

    /// Resolve the source pointer, refetch and recompute drift. With
    /// `auto_trigger`, automated applications are synced when the revision
    /// moved, and self-healing ones when drift exists.
    async fn refresh_entry(&self, entry: &Arc<AppEntry>, auto_trigger: bool) -> Result<SyncStatus> {
        let (source, destination) = {
            let state = entry.state.read().await;
            (state.app.source.clone(), state.app.destination.clone())
        };
        let desired = match self.fetcher.fetch_current(&source).await {
            Ok(desired) => Arc::new(desired.for_destination(&destination)?),
            Err(e) => {
                entry.state.write().await.sync_status = SyncStatus::Unknown;
                return Err(e);
            }
        };
        let revision = desired.revision().clone();
        {
            let mut state = entry.state.write().await;
            state.target_revision = Some(revision.clone());
            state.desired = Some(desired);
        }
        let snapshot = entry.observer.current();
        let actionable = self.recompute_drift(entry, &snapshot).await;

        let (sync_status, moved, automated) = {
            let state = entry.state.read().await;
            (
                state.sync_status,
                state.synced_revision.as_ref() != Some(&revision),
                state.autosync_allowed(),
            )
        };
        debug!(app = %entry.name, %revision, %sync_status, "Refreshed");

        if auto_trigger && automated {
            if moved {
                if let Err(e) = self.scheduler.trigger(&entry.name, TriggerCause::Scheduled).await {
                    warn!(app = %entry.name, error = %e, "Scheduled trigger failed");
                }
            } else if actionable > 0 {
                self.maybe_self_heal(entry).await;
            }
        }
        Ok(sync_status)
    }

    async fn evaluate_health(&self, entry: &AppEntry) {
        let snapshot = entry.observer.current();
        let expected = entry.state.read().await.expected();
        let health = entry
            .evaluator
            .lock()
            .await
            .evaluate(&snapshot, &expected, Utc::now());

        let mut state = entry.state.write().await;
        let previous = state.health.status;
        let current = health.status;
        state.health = health;
        let suspend = self.config.suspend_on_degraded
            && current == HealthStatus::Degraded
            && state.autosync_allowed();
        if suspend {
            state.autosync_suspended = true;
        }
        drop(state);

        if previous != current {
            info!(app = %entry.name, from = %previous, to = %current, "Health changed");
            self.publish(SyncEvent::health_changed(entry.name.clone(), previous, current))
                .await;
        }
        if suspend {
            warn!(app = %entry.name, "Application degraded, automated sync suspended");
            self.announce(SyncEvent::autosync_suspended(
                entry.name.clone(),
                "application health is degraded",
            ))
            .await;
        }
    }

    /// One sync: resolve, fetch, observe, diff, apply, re-observe.
    async fn sync_cycle(&self, entry: &AppEntry, op: &mut SyncOperation) -> Result<()> {
        let (source, destination, policy) = {
            let state = entry.state.read().await;
            (
                state.app.source.clone(),
                state.app.destination.clone(),
                state.app.policy,
            )
        };

        let revision = self.fetcher.resolve_revision(&source).await?;
        op.resolved(revision.clone());
        let desired = self.fetcher.fetch(&source, &revision).await?;
        let desired = Arc::new(desired.for_destination(&destination)?);
        {
            let mut state = entry.state.write().await;
            state.target_revision = Some(revision.clone());
            state.desired = Some(Arc::clone(&desired));
        }

        let snapshot = entry.observer.observe_now().await?;
        let deltas = diff(&desired, &snapshot, &self.diff_options(&policy));
        op.record_changes(&deltas);
        let report = self
            .executor
            .execute(entry.cluster.as_ref(), &entry.name, &destination, &deltas)
            .await;
        let error = report.error.clone();
        self.settle(entry, report, op).await;
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Record an apply report and refresh live state after it.
    async fn settle(&self, entry: &AppEntry, report: ApplyReport, op: &mut SyncOperation) {
        op.finish(report);
        match entry.observer.observe_now().await {
            Ok(snapshot) => {
                self.recompute_drift(entry, &snapshot).await;
            }
            Err(e) => warn!(app = %entry.name, error = %e, "Post-sync observation failed"),
        }
    }

    async fn record(&self, entry: &AppEntry, op: SyncOperation) {
        let event = {
            let mut state = entry.state.write().await;
            let event = if op.succeeded() {
                state.synced_revision = op.revision.clone();
                state.last_failure = None;
                if op.cause == TriggerCause::Manual && state.autosync_suspended {
                    state.autosync_suspended = false;
                    info!(app = %entry.name, "Automated sync resumed after manual sync");
                }
                op.revision.clone().map(|revision| {
                    SyncEvent::sync_succeeded(entry.name.clone(), op.id, revision, op.applied())
                })
            } else {
                state.last_failure = op.failure.clone();
                op.failure.as_ref().map(|failure| {
                    SyncEvent::sync_failed(
                        entry.name.clone(),
                        op.id,
                        op.revision.clone(),
                        failure.cause,
                        failure.message.clone(),
                    )
                })
            };
            state.history.push(op);
            event
        };
        if let Some(event) = event {
            self.announce(event).await;
        }
    }

    async fn publish(&self, event: SyncEvent) {
        let Some(bus) = &self.bus else {
            return;
        };
        bus.publish(event).await.warn_on_err("Failed to publish event");
    }

    /// Publish and hand to every notification sink.
    async fn announce(&self, event: SyncEvent) {
        for sink in &self.sinks {
            sink.notify(&event).await;
        }
        self.publish(event).await;
    }
}

#[async_trait]
impl SyncRunner for Controller {
    async fn run_sync(&self, app: &AppName, cause: TriggerCause) -> Result<()> {
        let entry = self.entry(app).await?;
        let mut op = SyncOperation::start(app.clone(), cause);
        info!(app = %app, %cause, operation = ?op.id, "Sync started");
        self.publish(SyncEvent::sync_started(app.clone(), op.id, cause))
            .await;

        let result = self.sync_cycle(&entry, &mut op).await;
        if let Err(e) = &result {
            if op.finished_at.is_none() {
                op.fail(e);
            }
        }
        self.record(&entry, op).await;
        result
    }
}

async fn stop_tasks(entry: &AppEntry) {
    entry.stop.send_replace(true);
    let handles: Vec<JoinHandle<()>> = entry.tasks.lock().await.drain(..).collect();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(app = %entry.name, error = %e, "Application task ended abnormally");
        }
    }
}

fn normalize_repo_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    trimmed.strip_suffix(".git").unwrap_or(trimmed).to_ascii_lowercase()
}
