//! Live-state observation.
//!
//! [`LiveStateObserver`] reads an application's managed resources once.
//! [`ObserverTask`] owns the published snapshot of one application: every
//! poll either replaces it with a fresh observation or keeps the previous
//! one, marking it stale once observation has been failing for longer than
//! `stale_after`. Failures are reported as events and logged, never returned.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_core::LogResultExt;
use keel_events::{AppName, EventBus, SyncEvent};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::cluster::ClusterClient;
use crate::error::{Error, Result};
use crate::types::{LiveSnapshot, Selector};

/// Reads live resources through a cluster client.
#[derive(Clone)]
pub struct LiveStateObserver {
    cluster: Arc<dyn ClusterClient>,
}

impl LiveStateObserver {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    /// Observe every resource matching `selector`.
    ///
    /// # Errors
    ///
    /// Returns the cluster client's error unchanged.
    pub async fn observe(&self, selector: &Selector) -> Result<LiveSnapshot> {
        let resources = self.cluster.get(selector).await?;
        Ok(LiveSnapshot::new(resources, Utc::now()))
    }
}

/// Result of one poll.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// A fresh snapshot was published.
    Fresh { resources: usize },
    /// Observation failed; the previous snapshot is still current.
    Retained { error: Error },
    /// Observation failed for too long; the previous snapshot was
    /// republished marked stale.
    Stale { error: Error },
}

impl PollOutcome {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh { .. })
    }
}

/// Publishes the live snapshot of one application.
pub struct ObserverTask {
    app: AppName,
    observer: LiveStateObserver,
    selector: Selector,
    stale_after: chrono::Duration,
    last_success: Mutex<DateTime<Utc>>,
    snapshot: watch::Sender<Arc<LiveSnapshot>>,
    bus: Option<Arc<EventBus>>,
}

impl ObserverTask {
    /// Create a task whose snapshot starts empty at `started_at`. The stale
    /// threshold is measured from `started_at` until the first success.
    pub fn new(
        app: AppName,
        observer: LiveStateObserver,
        selector: Selector,
        stale_after: Duration,
        started_at: DateTime<Utc>,
    ) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(LiveSnapshot::empty(started_at)));
        Self {
            app,
            observer,
            selector,
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
            last_success: Mutex::new(started_at),
            snapshot,
            bus: None,
        }
    }

    /// Publish observation failures on `bus`.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Receiver that always holds the latest complete snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<LiveSnapshot>> {
        self.snapshot.subscribe()
    }

    /// The current snapshot.
    pub fn current(&self) -> Arc<LiveSnapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Observe now and publish the result.
    ///
    /// # Errors
    ///
    /// Returns the observation error; the published snapshot is left as is.
    pub async fn observe_now(&self) -> Result<Arc<LiveSnapshot>> {
        let snapshot = Arc::new(self.observer.observe(&self.selector).await?);
        *self.last_success.lock().await = snapshot.observed_at();
        self.snapshot.send_replace(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Poll once at `now`.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> PollOutcome {
        match self.observer.observe(&self.selector).await {
            Ok(snapshot) => {
                let resources = snapshot.len();
                *self.last_success.lock().await = now;
                self.snapshot.send_replace(Arc::new(snapshot));
                debug!(app = %self.app, resources, "Live state observed");
                PollOutcome::Fresh { resources }
            }
            Err(error) => {
                let last_success = *self.last_success.lock().await;
                let stale = now.signed_duration_since(last_success) > self.stale_after;
                warn!(
                    app = %self.app,
                    error = %error,
                    stale,
                    "Live state observation failed"
                );
                if stale {
                    let marked = self.current().mark_stale(error.to_string());
                    self.snapshot.send_replace(Arc::new(marked));
                }
                self.report(&error, stale).await;
                if stale {
                    PollOutcome::Stale { error }
                } else {
                    PollOutcome::Retained { error }
                }
            }
        }
    }

    async fn report(&self, error: &Error, stale: bool) {
        let Some(bus) = &self.bus else {
            return;
        };
        let event = SyncEvent::observation_failed(self.app.clone(), error.to_string(), stale);
        bus.publish(event)
            .await
            .warn_on_err("Failed to publish observation failure");
    }
}
