//! Structural diff of desired against live state.
//!
//! [`diff`] is a pure function: it reads a [`ManifestSet`] and a
//! [`LiveSnapshot`] and never mutates either. Bodies are normalized with
//! [`IgnoreRules`] before comparison so server-populated fields never show
//! up as drift.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{LiveSnapshot, ManifestSet, Resource, ResourceKey};

/// Pointers stripped from both sides before comparison.
pub const DEFAULT_IGNORED_POINTERS: &[&str] = &[
    "/metadata/uid",
    "/metadata/resourceVersion",
    "/metadata/generation",
    "/metadata/creationTimestamp",
    "/metadata/managedFields",
    "/metadata/selfLink",
    "/status",
    "/metadata/annotations/kubectl.kubernetes.io~1last-applied-configuration",
    "/metadata/labels/app.keel.dev~1instance",
];

/// Classification of one resource in a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    /// Declared but not live.
    Create,
    /// Declared and live, with differing normalized bodies.
    Update,
    /// Live but no longer declared, and pruning is enabled.
    Delete,
    /// Live but no longer declared, and pruning is disabled.
    Ignored,
    /// Declared and live with equal normalized bodies.
    Unchanged,
}

impl DeltaKind {
    /// Whether the apply executor acts on this delta.
    pub fn requires_action(self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Delete)
    }

    /// Whether this delta makes the application OutOfSync.
    pub fn is_out_of_sync(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// The diff result for one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDelta {
    pub key: ResourceKey,
    pub kind: DeltaKind,
    /// Declared resource, if any.
    pub desired: Option<Resource>,
    /// Live object as observed, if any.
    pub live: Option<Resource>,
    /// JSON pointers of changed fields, for Update.
    pub changed_fields: Vec<String>,
}

/// Explicit ignore list applied to both sides of a comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreRules {
    pointers: Vec<String>,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self {
            pointers: DEFAULT_IGNORED_POINTERS
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
        }
    }
}

impl IgnoreRules {
    /// Rules that ignore nothing.
    pub fn none() -> Self {
        Self {
            pointers: Vec::new(),
        }
    }

    /// Also ignore `pointer`.
    pub fn with_pointer(mut self, pointer: impl Into<String>) -> Self {
        let pointer = pointer.into();
        if !self.pointers.contains(&pointer) {
            self.pointers.push(pointer);
        }
        self
    }

    /// Also ignore every pointer in `pointers`.
    pub fn extend<I, S>(self, pointers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        pointers.into_iter().fold(self, Self::with_pointer)
    }

    pub fn pointers(&self) -> &[String] {
        &self.pointers
    }

    /// Copy of `value` with ignored fields, nulls and empty objects removed.
    pub fn normalize(&self, value: &Value) -> Value {
        let mut out = value.clone();
        for pointer in &self.pointers {
            remove_pointer(&mut out, pointer);
        }
        prune_empty(&mut out);
        out
    }
}

/// Options for one diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffOptions {
    /// Report undeclared live resources as Delete instead of Ignored.
    pub prune: bool,
    pub ignore: IgnoreRules,
}

impl DiffOptions {
    pub fn with_prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    pub fn with_ignore(mut self, ignore: IgnoreRules) -> Self {
        self.ignore = ignore;
        self
    }
}

/// Diff desired state against live state.
///
/// The result holds one delta per key in either input, ordered by key.
pub fn diff(desired: &ManifestSet, live: &LiveSnapshot, options: &DiffOptions) -> Vec<ResourceDelta> {
    let keys: BTreeSet<&ResourceKey> = desired
        .iter()
        .map(Resource::key)
        .chain(live.keys())
        .collect();

    keys.into_iter()
        .map(|key| compare(key, desired.get(key), live.get(key), options))
        .collect()
}

fn compare(
    key: &ResourceKey,
    desired: Option<&Resource>,
    live: Option<&Resource>,
    options: &DiffOptions,
) -> ResourceDelta {
    let (kind, changed_fields) = match (desired, live) {
        (Some(_), None) => (DeltaKind::Create, Vec::new()),
        (Some(want), Some(have)) => {
            let want = options.ignore.normalize(want.body());
            let have = options.ignore.normalize(have.body());
            let mut changed = Vec::new();
            changed_paths(&want, &have, "", &mut changed);
            if changed.is_empty() {
                (DeltaKind::Unchanged, changed)
            } else {
                (DeltaKind::Update, changed)
            }
        }
        (None, Some(_)) if options.prune => (DeltaKind::Delete, Vec::new()),
        (None, _) => (DeltaKind::Ignored, Vec::new()),
    };

    ResourceDelta {
        key: key.clone(),
        kind,
        desired: desired.cloned(),
        live: live.cloned(),
        changed_fields,
    }
}

/// Count deltas per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub ignored: usize,
    pub unchanged: usize,
}

impl DiffSummary {
    /// Summarize a diff.
    pub fn of(deltas: &[ResourceDelta]) -> Self {
        deltas.iter().fold(Self::default(), |mut acc, delta| {
            let slot = match delta.kind {
                DeltaKind::Create => &mut acc.create,
                DeltaKind::Update => &mut acc.update,
                DeltaKind::Delete => &mut acc.delete,
                DeltaKind::Ignored => &mut acc.ignored,
                DeltaKind::Unchanged => &mut acc.unchanged,
            };
            *slot = slot.saturating_add(1);
            acc
        })
    }

    /// Number of deltas the executor would act on.
    pub fn actionable(&self) -> usize {
        self.create
            .saturating_add(self.update)
            .saturating_add(self.delete)
    }

    /// Number of resources that make the application OutOfSync.
    pub fn out_of_sync(&self) -> usize {
        self.actionable().saturating_add(self.ignored)
    }
}

/// Whether a diff shows live state matching desired state.
pub fn is_synced(deltas: &[ResourceDelta]) -> bool {
    deltas.iter().all(|d| !d.kind.is_out_of_sync())
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn remove_pointer(value: &mut Value, pointer: &str) {
    let Some((parent, last)) = pointer.rsplit_once('/') else {
        return;
    };
    let target = if parent.is_empty() {
        Some(value)
    } else {
        value.pointer_mut(parent)
    };
    if let Some(Value::Object(map)) = target {
        map.remove(&unescape(last));
    }
}

fn prune_empty(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                prune_empty(child);
            }
            map.retain(|_, v| !is_empty_leaf(v));
        }
        Value::Array(items) => items.iter_mut().for_each(prune_empty),
        _ => {}
    }
}

fn is_empty_leaf(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Collect JSON pointers at which `want` and `have` differ.
fn changed_paths(want: &Value, have: &Value, prefix: &str, out: &mut Vec<String>) {
    match (want, have) {
        (Value::Object(a), Value::Object(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                let path = format!("{prefix}/{}", escape(key));
                match (a.get(key), b.get(key)) {
                    (Some(x), Some(y)) => changed_paths(x, y, &path, out),
                    _ => out.push(path),
                }
            }
        }
        _ if want == have => {}
        _ => out.push(if prefix.is_empty() {
            "/".to_string()
        } else {
            prefix.to_string()
        }),
    }
}
