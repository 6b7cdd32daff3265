//! Apply executor.
//!
//! Applies a diff to a cluster in dependency order: creates and updates by
//! ascending kind priority, then deletes by descending priority. Transient
//! failures are retried with backoff; the first non-transient failure aborts
//! the operation. Nothing is rolled back on abort.
//!
//! Each cluster call is bounded by the attempt timeout. A call that does not
//! answer in time counts as `ClusterUnreachable`, so it is retried like any
//! other transient failure and never reported as applied. Once the cluster
//! has accepted a workload the executor waits up to the convergence timeout
//! for it to become ready, and reports it `Progressing` if it does not.

use std::time::Duration;

use keel_events::AppName;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::config::RetryPolicy;
use crate::diff::{DeltaKind, ResourceDelta};
use crate::error::Error;
use crate::health::{assess, Assessment};
use crate::types::{Destination, Resource, ResourceKey, Selector, TRACKING_LABEL};

/// Pause between reads while waiting for a workload to converge.
const CONVERGE_POLL: Duration = Duration::from_millis(100);

/// Apply order of a kind. Lower goes first.
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" | "Role" | "ClusterRole" | "RoleBinding" | "ClusterRoleBinding" => 2,
        "ConfigMap" | "Secret" | "PersistentVolumeClaim" => 3,
        "Service" => 4,
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" | "CronJob" | "Pod" => 5,
        "Ingress" => 6,
        _ => 7,
    }
}

/// Order actionable deltas for execution.
///
/// Creates and updates come first by ascending priority, deletes last by
/// descending priority. Ties keep key order.
pub fn plan(deltas: &[ResourceDelta]) -> Vec<&ResourceDelta> {
    let (mut deletes, mut upserts): (Vec<_>, Vec<_>) = deltas
        .iter()
        .filter(|d| d.kind.requires_action())
        .partition(|d| d.kind == DeltaKind::Delete);
    upserts.sort_by(|a, b| {
        kind_priority(&a.key.kind)
            .cmp(&kind_priority(&b.key.kind))
            .then_with(|| a.key.cmp(&b.key))
    });
    deletes.sort_by(|a, b| {
        kind_priority(&b.key.kind)
            .cmp(&kind_priority(&a.key.kind))
            .then_with(|| a.key.cmp(&b.key))
    });
    upserts.extend(deletes);
    upserts
}

/// What happened to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Applied,
    Deleted,
    /// Accepted by the cluster but not ready within the convergence wait.
    Progressing,
    Failed,
    /// Not attempted because the operation aborted earlier.
    Skipped,
}

/// Per-resource result of an apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceResult {
    pub key: ResourceKey,
    pub action: DeltaKind,
    pub status: ApplyStatus,
    pub attempts: u32,
    pub message: Option<String>,
}

/// Outcome of executing one diff.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub results: Vec<ResourceResult>,
    /// Set when the operation aborted.
    pub error: Option<Error>,
}

impl ApplyReport {
    /// Number of resources the cluster accepted.
    pub fn applied(&self) -> usize {
        self.results
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    ApplyStatus::Applied | ApplyStatus::Deleted | ApplyStatus::Progressing
                )
            })
            .count()
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

enum Attempt {
    Done,
    Converging,
}

/// Executes diffs against a cluster.
#[derive(Debug, Clone)]
pub struct ApplyExecutor {
    retry: RetryPolicy,
    attempt_timeout: Duration,
    converge_timeout: Duration,
}

impl ApplyExecutor {
    /// Create an executor that does not wait for applied workloads to
    /// converge.
    pub fn new(retry: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            retry,
            attempt_timeout,
            converge_timeout: Duration::ZERO,
        }
    }

    /// Wait up to `timeout` for each applied workload to become ready.
    pub fn with_converge_timeout(mut self, timeout: Duration) -> Self {
        self.converge_timeout = timeout;
        self
    }

    /// Apply every actionable delta for `app` into `destination`.
    pub async fn execute(
        &self,
        cluster: &dyn ClusterClient,
        app: &AppName,
        destination: &Destination,
        deltas: &[ResourceDelta],
    ) -> ApplyReport {
        let ordered = plan(deltas);
        info!(app = %app, actions = ordered.len(), "Applying changes");

        let mut report = ApplyReport::default();
        let mut remaining = ordered.into_iter();
        while let Some(delta) = remaining.next() {
            let (outcome, attempts) = match delta.kind {
                DeltaKind::Delete => self.delete(cluster, app, &delta.key).await,
                _ => match delta.desired.as_ref() {
                    Some(desired) => {
                        let resource = desired
                            .clone()
                            .with_default_namespace(&destination.namespace)
                            .with_label(TRACKING_LABEL, app.as_str());
                        self.apply(cluster, app, &resource).await
                    }
                    None => (
                        Err(Error::invalid_config(format!(
                            "{} has no desired body",
                            delta.key
                        ))),
                        0,
                    ),
                },
            };

            match outcome {
                Ok(attempt) => {
                    let status = match (attempt, delta.kind) {
                        (Attempt::Converging, _) => ApplyStatus::Progressing,
                        (Attempt::Done, DeltaKind::Delete) => ApplyStatus::Deleted,
                        (Attempt::Done, _) => ApplyStatus::Applied,
                    };
                    report.results.push(ResourceResult {
                        key: delta.key.clone(),
                        action: delta.kind,
                        status,
                        attempts,
                        message: (status == ApplyStatus::Progressing)
                            .then(|| "accepted, not yet ready".to_string()),
                    });
                }
                Err(error) => {
                    warn!(
                        app = %app,
                        resource = %delta.key,
                        error = %error,
                        "Apply aborted"
                    );
                    report.results.push(ResourceResult {
                        key: delta.key.clone(),
                        action: delta.kind,
                        status: ApplyStatus::Failed,
                        attempts,
                        message: Some(error.to_string()),
                    });
                    report.results.extend(remaining.by_ref().map(|skipped| ResourceResult {
                        key: skipped.key.clone(),
                        action: skipped.kind,
                        status: ApplyStatus::Skipped,
                        attempts: 0,
                        message: None,
                    }));
                    let applied = report.applied();
                    report.error = Some(if applied > 0 {
                        Error::partial_apply(applied, error)
                    } else {
                        error
                    });
                    break;
                }
            }
        }
        report
    }

    fn no_response(&self, what: &str, key: &ResourceKey) -> Error {
        Error::cluster_unreachable(format!(
            "{what} {key}: no response within {} ms",
            self.attempt_timeout.as_millis()
        ))
    }

    async fn apply(
        &self,
        cluster: &dyn ClusterClient,
        app: &AppName,
        resource: &Resource,
    ) -> (Result<Attempt, Error>, u32) {
        let mut attempt = 0_u32;
        loop {
            attempt = attempt.saturating_add(1);
            let outcome = tokio::time::timeout(self.attempt_timeout, cluster.apply(resource))
                .await
                .unwrap_or_else(|_elapsed| Err(self.no_response("apply", resource.key())));
            match outcome {
                Ok(stored) => {
                    debug!(app = %app, resource = %resource.key(), attempt, "Applied");
                    return (Ok(self.await_convergence(cluster, app, stored).await), attempt);
                }
                Err(error) if error.is_transient() && self.retry.is_retryable(attempt) => {
                    let backoff = self.retry.calculate_backoff(attempt);
                    warn!(
                        app = %app,
                        resource = %resource.key(),
                        attempt,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "Transient apply failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => return (Err(error), attempt),
            }
        }
    }

    /// Re-read `stored` until its kind rule no longer reports it below
    /// target, or the convergence timeout passes.
    async fn await_convergence(
        &self,
        cluster: &dyn ClusterClient,
        app: &AppName,
        stored: Resource,
    ) -> Attempt {
        let deadline = Instant::now() + self.converge_timeout;
        let selector = Selector::default().with_label(TRACKING_LABEL, app.as_str());
        let mut current = stored;
        loop {
            if !matches!(
                assess(&current),
                Assessment::BelowTarget(_) | Assessment::Progressing(_)
            ) {
                return Attempt::Done;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(app = %app, resource = %current.key(), "Not ready within the convergence wait");
                return Attempt::Converging;
            }
            tokio::time::sleep(CONVERGE_POLL.min(deadline - now)).await;

            let read = tokio::time::timeout(self.attempt_timeout, cluster.get(&selector)).await;
            match read {
                Ok(Ok(live)) => match live.into_iter().find(|r| r.key() == current.key()) {
                    Some(latest) => current = latest,
                    None => return Attempt::Converging,
                },
                Ok(Err(error)) => {
                    debug!(app = %app, resource = %current.key(), error = %error, "Convergence read failed");
                }
                Err(_elapsed) => {
                    debug!(app = %app, resource = %current.key(), "Convergence read timed out");
                }
            }
        }
    }

    async fn delete(
        &self,
        cluster: &dyn ClusterClient,
        app: &AppName,
        key: &ResourceKey,
    ) -> (Result<Attempt, Error>, u32) {
        let mut attempt = 0_u32;
        loop {
            attempt = attempt.saturating_add(1);
            let outcome = tokio::time::timeout(self.attempt_timeout, cluster.delete(key))
                .await
                .unwrap_or_else(|_elapsed| Err(self.no_response("delete", key)));
            match outcome {
                Ok(()) | Err(Error::ResourceNotFound { .. }) => {
                    debug!(app = %app, resource = %key, attempt, "Deleted");
                    return (Ok(Attempt::Done), attempt);
                }
                Err(error) if error.is_transient() && self.retry.is_retryable(attempt) => {
                    warn!(
                        app = %app,
                        resource = %key,
                        attempt,
                        error = %error,
                        "Transient delete failure, retrying"
                    );
                    tokio::time::sleep(self.retry.calculate_backoff(attempt)).await;
                }
                Err(error) => return (Err(error), attempt),
            }
        }
    }
}
