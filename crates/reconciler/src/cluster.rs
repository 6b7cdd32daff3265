//! Cluster access.
//!
//! [`ClusterClient`] is the seam between the reconciler and a cluster
//! control plane. [`InMemoryCluster`] behaves like a small API server:
//! it stamps server-owned metadata, keeps `status` under its own control,
//! and supports fault injection for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::types::{Resource, ResourceKey, Selector};

/// Trait for reading and writing cluster resources.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List resources matching `selector`.
    async fn get(&self, selector: &Selector) -> Result<Vec<Resource>>;

    /// Create or update a resource, returning the stored object.
    async fn apply(&self, resource: &Resource) -> Result<Resource>;

    /// Delete a resource. Returns `ResourceNotFound` if it does not exist.
    async fn delete(&self, key: &ResourceKey) -> Result<()>;
}

/// Operation a fault is injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Apply,
    Delete,
}

/// Kinds whose status reports ready replicas.
const REPLICATED_KINDS: &[&str] = &["Deployment", "StatefulSet", "ReplicaSet"];

/// In-memory cluster.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    objects: RwLock<BTreeMap<ResourceKey, Resource>>,
    faults: Mutex<HashMap<(FaultOp, ResourceKey), VecDeque<Error>>>,
    unreachable: AtomicBool,
    latency_ms: AtomicU64,
    resource_version: AtomicU64,
    applies: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `ClusterUnreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Fail the next `op` on `key` with `error`. Faults queue up in order.
    pub async fn inject_fault(&self, op: FaultOp, key: ResourceKey, error: Error) {
        self.faults
            .lock()
            .await
            .entry((op, key))
            .or_default()
            .push_back(error);
    }

    /// Insert an object with its status as given, stamping server metadata.
    /// Used to seed pre-existing or out-of-band state.
    pub async fn seed(&self, resource: Resource) {
        let status = resource.get("/status").cloned();
        let mut stored = self.stamp(resource, None);
        if let (Some(status), Some(body)) = (status, stored.body_mut().as_object_mut()) {
            body.insert("status".to_string(), status);
        }
        self.objects
            .write()
            .await
            .insert(stored.key().clone(), stored);
    }

    /// Replace the status of an object.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if the object does not exist.
    pub async fn set_status(&self, key: &ResourceKey, status: Value) -> Result<()> {
        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(key)
            .ok_or_else(|| Error::resource_not_found(key.to_string()))?;
        if let Some(body) = object.body_mut().as_object_mut() {
            body.insert("status".to_string(), status);
        }
        Ok(())
    }

    /// Mark every workload as fully rolled out.
    pub async fn converge_workloads(&self) {
        let mut objects = self.objects.write().await;
        for object in objects.values_mut() {
            if let Some(status) = converged_status(object) {
                if let Some(body) = object.body_mut().as_object_mut() {
                    body.insert("status".to_string(), status);
                }
            }
        }
    }

    /// Edit a live object out of band, as a human with cluster access would.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if the object does not exist.
    pub async fn mutate<F>(&self, key: &ResourceKey, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Value) + Send,
    {
        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(key)
            .ok_or_else(|| Error::resource_not_found(key.to_string()))?;
        edit(object.body_mut());
        Ok(())
    }

    /// Fetch one object by key.
    pub async fn object(&self, key: &ResourceKey) -> Option<Resource> {
        self.objects.read().await.get(key).cloned()
    }

    /// All stored objects in key order.
    pub async fn objects(&self) -> Vec<Resource> {
        self.objects.read().await.values().cloned().collect()
    }

    /// Number of successful apply calls.
    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    /// Number of successful delete calls.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    async fn enter(&self, op: Option<(FaultOp, &ResourceKey)>) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::cluster_unreachable("connection refused"));
        }
        if let Some((op, key)) = op {
            let mut faults = self.faults.lock().await;
            let injected = faults
                .get_mut(&(op, key.clone()))
                .and_then(VecDeque::pop_front);
            if let Some(error) = injected {
                debug!(resource = %key, ?op, error = %error, "Injected cluster fault");
                return Err(error);
            }
        }
        Ok(())
    }

    /// Fill in server-owned fields, carrying identity over from `existing`.
    fn stamp(&self, resource: Resource, existing: Option<&Resource>) -> Resource {
        let version = self
            .resource_version
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        let mut stored = resource;
        let spec_changed = existing.map_or(true, |e| e.get("/spec") != stored.get("/spec"));

        let (uid, created, generation, status) = match existing {
            Some(prev) => (
                prev.get("/metadata/uid").cloned(),
                prev.get("/metadata/creationTimestamp").cloned(),
                prev.get("/metadata/generation").and_then(Value::as_u64),
                prev.get("/status").cloned(),
            ),
            None => (None, None, None, None),
        };
        let generation = match (generation, spec_changed) {
            (Some(g), true) => g.saturating_add(1),
            (Some(g), false) => g,
            (None, _) => 1,
        };
        let status = status.or_else(|| initial_status(&stored));

        if let Some(body) = stored.body_mut().as_object_mut() {
            if let Some(Value::Object(metadata)) = body.get_mut("metadata") {
                metadata.insert(
                    "uid".to_string(),
                    uid.unwrap_or_else(|| Value::String(Ulid::new().to_string().to_lowercase())),
                );
                metadata.insert(
                    "creationTimestamp".to_string(),
                    created.unwrap_or_else(|| Value::String(Utc::now().to_rfc3339())),
                );
                metadata.insert("resourceVersion".to_string(), json!(version.to_string()));
                metadata.insert("generation".to_string(), json!(generation));
            }
            body.remove("status");
            if let Some(status) = status {
                body.insert("status".to_string(), status);
            }
        }
        stored
    }
}

fn desired_replicas(resource: &Resource) -> u64 {
    resource
        .get("/spec/replicas")
        .and_then(Value::as_u64)
        .unwrap_or(1)
}

/// Status a freshly created object starts with.
fn initial_status(resource: &Resource) -> Option<Value> {
    match resource.kind() {
        kind if REPLICATED_KINDS.contains(&kind) => Some(json!({
            "replicas": desired_replicas(resource),
            "readyReplicas": 0
        })),
        "DaemonSet" => Some(json!({ "desiredNumberScheduled": 1, "numberReady": 0 })),
        "Pod" => Some(json!({ "phase": "Pending" })),
        "Job" => Some(json!({ "active": 1 })),
        "PersistentVolumeClaim" => Some(json!({ "phase": "Pending" })),
        _ => None,
    }
}

/// Status of an object once its controller has caught up.
fn converged_status(resource: &Resource) -> Option<Value> {
    match resource.kind() {
        kind if REPLICATED_KINDS.contains(&kind) => {
            let replicas = desired_replicas(resource);
            Some(json!({
                "replicas": replicas,
                "readyReplicas": replicas,
                "updatedReplicas": replicas,
                "availableReplicas": replicas
            }))
        }
        "DaemonSet" => Some(json!({ "desiredNumberScheduled": 1, "numberReady": 1 })),
        "Pod" => Some(json!({ "phase": "Running" })),
        "Job" => Some(json!({ "succeeded": 1 })),
        "PersistentVolumeClaim" => Some(json!({ "phase": "Bound" })),
        _ => None,
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get(&self, selector: &Selector) -> Result<Vec<Resource>> {
        self.enter(None).await?;
        let objects = self.objects.read().await;
        Ok(objects
            .values()
            .filter(|object| selector.matches(object))
            .cloned()
            .collect())
    }

    async fn apply(&self, resource: &Resource) -> Result<Resource> {
        self.enter(Some((FaultOp::Apply, resource.key()))).await?;
        let mut objects = self.objects.write().await;
        let stored = self.stamp(resource.clone(), objects.get(resource.key()));
        objects.insert(stored.key().clone(), stored.clone());
        self.applies.fetch_add(1, Ordering::SeqCst);
        debug!(resource = %resource.key(), "Applied");
        Ok(stored)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        self.enter(Some((FaultOp::Delete, key))).await?;
        let removed = self.objects.write().await.remove(key);
        match removed {
            Some(_) => {
                self.deletes.fetch_add(1, Ordering::SeqCst);
                debug!(resource = %key, "Deleted");
                Ok(())
            }
            None => Err(Error::resource_not_found(key.to_string())),
        }
    }
}
