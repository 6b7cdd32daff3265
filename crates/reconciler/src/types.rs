//! Core types for the reconciler.
//!
//! Resources are carried as JSON values keyed by [`ResourceKey`]. Desired
//! state arrives as a [`ManifestSet`] pinned to a revision, live state as a
//! [`LiveSnapshot`] taken at a point in time.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use im::OrdMap;
use keel_events::{AppName, Revision};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Label stamped on every resource applied on behalf of an application.
pub const TRACKING_LABEL: &str = "app.keel.dev/instance";

/// Kinds that never carry a namespace.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "StorageClass",
    "PriorityClass",
    "APIService",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
];

/// Identity of a resource: `(group, kind, namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub group: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    /// Create a new resource key.
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Whether resources of this kind are cluster-scoped.
    pub fn is_cluster_scoped(&self) -> bool {
        is_cluster_scoped_kind(&self.kind)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.group.is_empty() {
            write!(f, "{}/", self.group)?;
        }
        write!(f, "{}/", self.kind)?;
        if let Some(ns) = &self.namespace {
            write!(f, "{ns}/")?;
        }
        write!(f, "{}", self.name)
    }
}

/// Whether `kind` names a cluster-scoped resource kind.
pub fn is_cluster_scoped_kind(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// API group of an `apiVersion` string. The core group is empty.
fn group_of(api_version: &str) -> &str {
    api_version
        .rsplit_once('/')
        .map_or("", |(group, _version)| group)
}

/// A single declarative resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    key: ResourceKey,
    body: Value,
}

impl Resource {
    /// Build a resource from its JSON body.
    ///
    /// # Errors
    ///
    /// Returns `MalformedManifest` if the body is not an object or lacks
    /// `apiVersion`, `kind` or `metadata.name`.
    pub fn from_value(body: Value) -> Result<Self> {
        let key = key_of(&body)?;
        Ok(Self { key, body })
    }

    /// The identity of this resource.
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// The full resource body.
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Consume the resource, returning its body.
    pub fn into_body(self) -> Value {
        self.body
    }

    pub fn kind(&self) -> &str {
        &self.key.kind
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.key.namespace.as_deref()
    }

    /// Look up a value by JSON pointer.
    pub fn get(&self, pointer: &str) -> Option<&Value> {
        self.body.pointer(pointer)
    }

    /// Value of a metadata label.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.body
            .pointer("/metadata/labels")
            .and_then(|labels| labels.get(name))
            .and_then(Value::as_str)
    }

    /// All metadata labels.
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.body
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Place a namespaced resource without an explicit namespace into
    /// `namespace`. Cluster-scoped resources are returned unchanged.
    pub fn with_default_namespace(mut self, namespace: &str) -> Self {
        if self.key.is_cluster_scoped() || self.key.namespace.is_some() {
            return self;
        }
        if let Some(metadata) = metadata_mut(&mut self.body) {
            metadata.insert(
                "namespace".to_string(),
                Value::String(namespace.to_string()),
            );
            self.key.namespace = Some(namespace.to_string());
        }
        self
    }

    /// Set a metadata label.
    pub fn with_label(mut self, name: &str, value: &str) -> Self {
        if let Some(metadata) = metadata_mut(&mut self.body) {
            let labels = metadata
                .entry("labels")
                .or_insert_with(|| Value::Object(Map::new()));
            if !labels.is_object() {
                *labels = Value::Object(Map::new());
            }
            if let Some(labels) = labels.as_object_mut() {
                labels.insert(name.to_string(), Value::String(value.to_string()));
            }
        }
        self
    }

    /// Mutable access to the body for callers that own server-side fields.
    ///
    /// The key fields (`apiVersion`, `kind`, `metadata.name`,
    /// `metadata.namespace`) must not be changed through this handle.
    pub fn body_mut(&mut self) -> &mut Value {
        &mut self.body
    }
}

fn metadata_mut(body: &mut Value) -> Option<&mut Map<String, Value>> {
    let metadata = body
        .as_object_mut()?
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if !metadata.is_object() {
        *metadata = Value::Object(Map::new());
    }
    metadata.as_object_mut()
}

fn key_of(body: &Value) -> Result<ResourceKey> {
    if !body.is_object() {
        return Err(Error::malformed_manifest("resource is not a mapping"));
    }
    let api_version = body
        .get("apiVersion")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::malformed_manifest("resource is missing apiVersion"))?;
    let kind = body
        .get("kind")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::malformed_manifest("resource is missing kind"))?;
    let name = body
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::malformed_manifest(format!("{kind} is missing metadata.name")))?;
    let namespace = if is_cluster_scoped_kind(kind) {
        None
    } else {
        body.pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    };

    Ok(ResourceKey::new(group_of(api_version), kind, namespace, name))
}

/// Desired state: the resources declared at one revision of a source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestSet {
    revision: Revision,
    resources: Vec<Resource>,
}

impl ManifestSet {
    /// Create a manifest set, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns `MalformedManifest` if two resources share a key.
    pub fn new(revision: Revision, mut resources: Vec<Resource>) -> Result<Self> {
        resources.sort_by(|a, b| a.key().cmp(b.key()));
        let duplicate = resources
            .windows(2)
            .find_map(|pair| match pair {
                [a, b] if a.key() == b.key() => Some(a.key().clone()),
                _ => None,
            });
        if let Some(key) = duplicate {
            return Err(Error::malformed_manifest(format!(
                "duplicate resource {key}"
            )));
        }
        Ok(Self {
            revision,
            resources,
        })
    }

    /// The revision these resources were read at.
    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    /// Find a resource by key.
    pub fn get(&self, key: &ResourceKey) -> Option<&Resource> {
        self.resources
            .binary_search_by(|r| r.key().cmp(key))
            .ok()
            .and_then(|idx| self.resources.get(idx))
    }

    /// Keys of all declared resources.
    pub fn keys(&self) -> BTreeSet<ResourceKey> {
        self.resources.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resolve the set against a destination, defaulting namespaces.
    ///
    /// # Errors
    ///
    /// Returns `MalformedManifest` if defaulting makes two keys collide.
    pub fn for_destination(&self, destination: &Destination) -> Result<Self> {
        let resources = self
            .resources
            .iter()
            .cloned()
            .map(|r| r.with_default_namespace(&destination.namespace))
            .collect();
        Self::new(self.revision.clone(), resources)
    }
}

/// Live state: the managed resources observed in a cluster at one instant.
#[derive(Debug, Clone)]
pub struct LiveSnapshot {
    resources: OrdMap<ResourceKey, Resource>,
    observed_at: DateTime<Utc>,
    stale: bool,
    last_error: Option<String>,
}

impl LiveSnapshot {
    /// Create a snapshot from observed resources.
    pub fn new(resources: impl IntoIterator<Item = Resource>, observed_at: DateTime<Utc>) -> Self {
        Self {
            resources: resources
                .into_iter()
                .map(|r| (r.key().clone(), r))
                .collect(),
            observed_at,
            stale: false,
            last_error: None,
        }
    }

    /// An empty snapshot that has never been observed.
    pub fn empty(observed_at: DateTime<Utc>) -> Self {
        Self::new(Vec::new(), observed_at)
    }

    /// Copy of this snapshot flagged stale with the error that caused it.
    pub fn mark_stale(&self, error: impl Into<String>) -> Self {
        Self {
            resources: self.resources.clone(),
            observed_at: self.observed_at,
            stale: true,
            last_error: Some(error.into()),
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&Resource> {
        self.resources.get(key)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.resources.contains_key(key)
    }

    /// Resources ordered by key.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.resources.keys()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// When the cluster was last read successfully.
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    /// Whether observation has failed for longer than the staleness bound.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// Where an application's manifests come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Repository location.
    pub repo_url: String,
    /// Directory inside the repository.
    #[serde(default)]
    pub path: String,
    /// Revision pointer: a branch, tag or revision id.
    #[serde(default = "default_revision")]
    pub revision: String,
}

fn default_revision() -> String {
    "HEAD".to_string()
}

impl SourceRef {
    /// Track `HEAD` of the repository root.
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            path: String::new(),
            revision: default_revision(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }
}

/// Where an application's resources are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Name of a configured cluster.
    #[serde(default = "default_cluster")]
    pub cluster: String,
    /// Namespace for resources that do not declare one.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Name of the cluster the controller runs in.
pub const IN_CLUSTER: &str = "in-cluster";

fn default_cluster() -> String {
    IN_CLUSTER.to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for Destination {
    fn default() -> Self {
        Self {
            cluster: default_cluster(),
            namespace: default_namespace(),
        }
    }
}

/// How an application is kept in sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Sync automatically when the source moves.
    pub automated: bool,
    /// Delete live resources that are no longer declared.
    pub prune: bool,
    /// Sync automatically when live state drifts.
    pub self_heal: bool,
}

/// A registered application: source, destination and policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: AppName,
    pub source: SourceRef,
    #[serde(default)]
    pub destination: Destination,
    #[serde(default)]
    pub policy: SyncPolicy,
}

impl Application {
    /// Create an application with a default destination and manual policy.
    pub fn new(name: impl Into<AppName>, source: SourceRef) -> Self {
        Self {
            name: name.into(),
            source,
            destination: Destination::default(),
            policy: SyncPolicy::default(),
        }
    }

    /// Set the destination.
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Set the sync policy.
    pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Selector matching every live resource managed by this application.
    pub fn selector(&self) -> Selector {
        Selector::default().with_label(TRACKING_LABEL, self.name.as_str())
    }

    /// Check that the application is well formed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first empty required field.
    pub fn validate(&self) -> Result<()> {
        if self.name.as_str().trim().is_empty() {
            return Err(Error::invalid_config("application name is empty"));
        }
        if self.source.repo_url.trim().is_empty() {
            return Err(Error::invalid_config(format!(
                "application '{}' has an empty repo_url",
                self.name
            )));
        }
        if self.source.revision.trim().is_empty() {
            return Err(Error::invalid_config(format!(
                "application '{}' has an empty revision",
                self.name
            )));
        }
        if self.destination.namespace.trim().is_empty() {
            return Err(Error::invalid_config(format!(
                "application '{}' has an empty destination namespace",
                self.name
            )));
        }
        Ok(())
    }
}

/// Label and namespace filter for reading live resources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    /// Restrict to one namespace. `None` matches every namespace and
    /// cluster-scoped resources.
    pub namespace: Option<String>,
    /// Labels that must all be present with equal values.
    pub labels: BTreeMap<String, String>,
}

impl Selector {
    /// Restrict to one namespace.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Require a label value.
    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    /// Whether a resource passes this selector.
    pub fn matches(&self, resource: &Resource) -> bool {
        let namespace_ok = self
            .namespace
            .as_deref()
            .map_or(true, |ns| resource.namespace() == Some(ns));
        namespace_ok
            && self
                .labels
                .iter()
                .all(|(k, v)| resource.label(k) == Some(v.as_str()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(name: &str, namespace: Option<&str>) -> Resource {
        let mut body = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": name },
            "spec": { "replicas": 2 }
        });
        if let Some(ns) = namespace {
            body["metadata"]["namespace"] = json!(ns);
        }
        Resource::from_value(body).unwrap()
    }

    #[test]
    fn test_key_from_body() {
        let r = deployment("web", Some("prod"));
        assert_eq!(r.key(), &ResourceKey::new("apps", "Deployment", Some("prod"), "web"));
        assert_eq!(r.key().to_string(), "apps/Deployment/prod/web");
    }

    #[test]
    fn test_core_group_is_empty() {
        let r = Resource::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cfg" }
        }))
        .unwrap();
        assert_eq!(r.key().group, "");
        assert_eq!(r.key().to_string(), "ConfigMap/cfg");
    }

    #[test]
    fn test_missing_fields_rejected() {
        let missing_name = Resource::from_value(json!({"apiVersion": "v1", "kind": "Service"}));
        assert!(matches!(missing_name, Err(Error::MalformedManifest { .. })));
        let scalar = Resource::from_value(json!("nope"));
        assert!(scalar.is_err());
    }

    #[test]
    fn test_cluster_scoped_namespace_ignored() {
        let ns = Resource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": "prod", "namespace": "ignored" }
        }))
        .unwrap();
        assert_eq!(ns.namespace(), None);
        let defaulted = ns.with_default_namespace("other");
        assert_eq!(defaulted.namespace(), None);
    }

    #[test]
    fn test_default_namespace_and_label() {
        let r = deployment("web", None)
            .with_default_namespace("staging")
            .with_label(TRACKING_LABEL, "guestbook");
        assert_eq!(r.namespace(), Some("staging"));
        assert_eq!(r.get("/metadata/namespace"), Some(&json!("staging")));
        assert_eq!(r.label(TRACKING_LABEL), Some("guestbook"));
    }

    #[test]
    fn test_manifest_set_rejects_duplicates() {
        let result = ManifestSet::new(
            Revision::from("r1"),
            vec![deployment("web", Some("a")), deployment("web", Some("a"))],
        );
        assert!(matches!(result, Err(Error::MalformedManifest { .. })));
    }

    #[test]
    fn test_manifest_set_duplicate_after_defaulting() {
        let set = ManifestSet::new(
            Revision::from("r1"),
            vec![deployment("web", Some("prod")), deployment("web", None)],
        )
        .unwrap();
        let dest = Destination {
            cluster: IN_CLUSTER.to_string(),
            namespace: "prod".to_string(),
        };
        assert!(set.for_destination(&dest).is_err());
    }

    #[test]
    fn test_manifest_set_lookup() {
        let set = ManifestSet::new(
            Revision::from("r1"),
            vec![deployment("b", Some("x")), deployment("a", Some("x"))],
        )
        .unwrap();
        let first = set.resources().first().map(Resource::name);
        assert_eq!(first, Some("a"));
        let key = ResourceKey::new("apps", "Deployment", Some("x"), "b");
        assert!(set.get(&key).is_some());
    }

    #[test]
    fn test_selector_matches_labels() {
        let app = Application::new(
            "guestbook",
            SourceRef {
                repo_url: "repo".to_string(),
                path: String::new(),
                revision: "HEAD".to_string(),
            },
        );
        let tracked = deployment("web", Some("a")).with_label(TRACKING_LABEL, "guestbook");
        let other = deployment("web", Some("a")).with_label(TRACKING_LABEL, "other");
        assert!(app.selector().matches(&tracked));
        assert!(!app.selector().matches(&other));
        assert!(!app.selector().in_namespace("b").matches(&tracked));
    }

    #[test]
    fn test_snapshot_stale_keeps_resources() {
        let snap = LiveSnapshot::new(vec![deployment("web", Some("a"))], Utc::now());
        let stale = snap.mark_stale("connection refused");
        assert!(stale.is_stale());
        assert_eq!(stale.len(), 1);
        assert_eq!(stale.last_error(), Some("connection refused"));
    }

    #[test]
    fn test_application_validate() {
        let app = Application::new(
            "",
            SourceRef {
                repo_url: "repo".to_string(),
                path: String::new(),
                revision: "HEAD".to_string(),
            },
        );
        assert!(app.validate().is_err());
    }
}
