//! Resource and application health.
//!
//! Each resource is assessed by kind-specific rules. Workloads below their
//! target are Progressing for a grace period measured from the first
//! observation below target, then Degraded. Declared resources absent from
//! the live snapshot are Missing. The application's health is the worst of
//! its declared resources; live objects it no longer declares are left to
//! the diff, which reports them as ignored or pruned.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use keel_events::HealthStatus;
use serde::Serialize;
use serde_json::Value;

use crate::types::{LiveSnapshot, Resource, ResourceKey};

/// Health of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceHealth {
    pub key: ResourceKey,
    pub status: HealthStatus,
    pub message: String,
    pub observed_at: DateTime<Utc>,
}

/// Health of an application at one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationHealth {
    pub status: HealthStatus,
    pub resources: Vec<ResourceHealth>,
    /// Whether the evaluation ran on a stale snapshot.
    pub stale: bool,
    pub evaluated_at: Option<DateTime<Utc>>,
}

impl Default for ApplicationHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            resources: Vec::new(),
            stale: false,
            evaluated_at: None,
        }
    }
}

/// Outcome of a kind rule, before the grace period is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assessment {
    Healthy(String),
    /// Still moving towards its target; may degrade after the grace period.
    BelowTarget(String),
    /// Making progress with no deadline (e.g. a running job).
    Progressing(String),
    Degraded(String),
}

fn u64_at(resource: &Resource, pointer: &str) -> Option<u64> {
    resource.get(pointer).and_then(Value::as_u64)
}

fn str_at<'a>(resource: &'a Resource, pointer: &str) -> Option<&'a str> {
    resource.get(pointer).and_then(Value::as_str)
}

/// Whether a Deployment reports it has given up rolling out.
fn progress_deadline_exceeded(resource: &Resource) -> bool {
    resource
        .get("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some("Progressing")
                    && c.get("reason").and_then(Value::as_str) == Some("ProgressDeadlineExceeded")
            })
        })
}

/// Apply the kind rule for `resource`.
pub fn assess(resource: &Resource) -> Assessment {
    match resource.kind() {
        "Deployment" | "StatefulSet" | "ReplicaSet" => {
            let desired = u64_at(resource, "/spec/replicas").unwrap_or(1);
            let ready = u64_at(resource, "/status/readyReplicas").unwrap_or(0);
            if progress_deadline_exceeded(resource) {
                Assessment::Degraded(format!("progress deadline exceeded ({ready}/{desired} ready)"))
            } else if ready >= desired {
                Assessment::Healthy(format!("{ready}/{desired} replicas ready"))
            } else {
                Assessment::BelowTarget(format!("{ready}/{desired} replicas ready"))
            }
        }
        "DaemonSet" => {
            let desired = u64_at(resource, "/status/desiredNumberScheduled").unwrap_or(0);
            let ready = u64_at(resource, "/status/numberReady").unwrap_or(0);
            if ready >= desired {
                Assessment::Healthy(format!("{ready}/{desired} pods ready"))
            } else {
                Assessment::BelowTarget(format!("{ready}/{desired} pods ready"))
            }
        }
        "Pod" => match str_at(resource, "/status/phase") {
            Some("Running") | Some("Succeeded") => Assessment::Healthy("pod running".to_string()),
            Some("Failed") => Assessment::Degraded("pod failed".to_string()),
            Some(phase) => Assessment::BelowTarget(format!("pod {}", phase.to_lowercase())),
            None => Assessment::BelowTarget("pod has no phase yet".to_string()),
        },
        "Job" => {
            if u64_at(resource, "/status/failed").unwrap_or(0) > 0 {
                Assessment::Degraded("job failed".to_string())
            } else if u64_at(resource, "/status/succeeded").unwrap_or(0) > 0 {
                Assessment::Healthy("job succeeded".to_string())
            } else {
                Assessment::Progressing("job running".to_string())
            }
        }
        "PersistentVolumeClaim" => match str_at(resource, "/status/phase") {
            Some("Bound") => Assessment::Healthy("claim bound".to_string()),
            Some("Lost") => Assessment::Degraded("claim lost".to_string()),
            _ => Assessment::Progressing("claim pending".to_string()),
        },
        _ => Assessment::Healthy("present".to_string()),
    }
}

/// Stateful evaluator for one application.
///
/// Remembers when each resource was first seen below target so the grace
/// period spans evaluations.
#[derive(Debug)]
pub struct HealthEvaluator {
    grace_period: Duration,
    below_target_since: HashMap<ResourceKey, DateTime<Utc>>,
}

impl HealthEvaluator {
    /// Create an evaluator with the given grace period.
    pub fn new(grace_period: std::time::Duration) -> Self {
        Self {
            grace_period: Duration::from_std(grace_period).unwrap_or_else(|_| Duration::days(36_500)),
            below_target_since: HashMap::new(),
        }
    }

    /// Evaluate `snapshot` against the declared keys at `now`.
    pub fn evaluate(
        &mut self,
        snapshot: &LiveSnapshot,
        expected: &BTreeSet<ResourceKey>,
        now: DateTime<Utc>,
    ) -> ApplicationHealth {
        let mut resources: Vec<ResourceHealth> = expected
            .iter()
            .filter(|key| !snapshot.contains(key))
            .map(|key| ResourceHealth {
                key: key.clone(),
                status: HealthStatus::Missing,
                message: "resource not found in cluster".to_string(),
                observed_at: snapshot.observed_at(),
            })
            .collect();

        let mut still_below = BTreeSet::new();
        for resource in snapshot.iter().filter(|r| expected.contains(r.key())) {
            let (status, message) = match assess(resource) {
                Assessment::Healthy(msg) => (HealthStatus::Healthy, msg),
                Assessment::Progressing(msg) => (HealthStatus::Progressing, msg),
                Assessment::Degraded(msg) => (HealthStatus::Degraded, msg),
                Assessment::BelowTarget(msg) => {
                    still_below.insert(resource.key().clone());
                    let since = *self
                        .below_target_since
                        .entry(resource.key().clone())
                        .or_insert(now);
                    if now.signed_duration_since(since) > self.grace_period {
                        (HealthStatus::Degraded, format!("{msg} after grace period"))
                    } else {
                        (HealthStatus::Progressing, msg)
                    }
                }
            };
            resources.push(ResourceHealth {
                key: resource.key().clone(),
                status,
                message,
                observed_at: snapshot.observed_at(),
            });
        }
        self.below_target_since
            .retain(|key, _| still_below.contains(key));
        resources.sort_by(|a, b| a.key.cmp(&b.key));

        ApplicationHealth {
            status: HealthStatus::aggregate(resources.iter().map(|r| r.status)),
            resources,
            stale: snapshot.is_stale(),
            evaluated_at: Some(now),
        }
    }
}
