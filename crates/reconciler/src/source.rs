//! Desired-state fetching.
//!
//! A [`SourceRepository`] resolves revision pointers and returns raw
//! manifest bytes. [`ManifestFetcher`] parses those bytes into a
//! [`ManifestSet`] and caches the result per `(repo, path, revision)`;
//! revisions are immutable so cached sets never go stale.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use keel_events::Revision;
use moka::future::Cache;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{ManifestSet, Resource, SourceRef};

/// Trait for version-control backends holding manifests.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Resolve the revision pointer of `source` to an immutable revision.
    async fn resolve_revision(&self, source: &SourceRef) -> Result<Revision>;

    /// Read the manifest bytes under `source.path` at `revision`.
    async fn resolve(&self, source: &SourceRef, revision: &Revision) -> Result<Vec<u8>>;
}

/// Parse multi-document YAML (or JSON) into resources.
///
/// Empty documents are skipped and `kind: List` documents are flattened
/// into their items.
///
/// # Errors
///
/// Returns `MalformedManifest` if the bytes are not UTF-8, a document is
/// not valid YAML, or a document is not a well-formed resource.
pub fn parse_manifests(bytes: &[u8]) -> Result<Vec<Resource>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::malformed_manifest(format!("manifest is not UTF-8: {e}")))?;

    let mut resources = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = Value::deserialize(document).map_err(|e| {
            Error::malformed_manifest(format!("document {}: {e}", index.saturating_add(1)))
        })?;
        match value {
            Value::Null => continue,
            Value::Object(ref map) if map.get("kind").and_then(Value::as_str) == Some("List") => {
                let items = map
                    .get("items")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for item in items {
                    resources.push(Resource::from_value(item)?);
                }
            }
            Value::Object(_) => resources.push(Resource::from_value(value)?),
            _ => {
                return Err(Error::malformed_manifest(format!(
                    "document {} is not a mapping",
                    index.saturating_add(1)
                )))
            }
        }
    }
    Ok(resources)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    repo_url: String,
    path: String,
    revision: Revision,
}

/// Fetches and caches parsed manifest sets.
pub struct ManifestFetcher {
    source: Arc<dyn SourceRepository>,
    cache: Cache<CacheKey, Arc<ManifestSet>>,
}

impl ManifestFetcher {
    /// Create a fetcher keeping at most `capacity` manifest sets.
    pub fn new(source: Arc<dyn SourceRepository>, capacity: u64) -> Self {
        Self {
            source,
            cache: Cache::builder().max_capacity(capacity).build(),
        }
    }

    /// Resolve the revision pointer of `source`.
    ///
    /// # Errors
    ///
    /// Propagates `SourceUnreachable` and `RevisionNotFound` from the backend.
    pub async fn resolve_revision(&self, source: &SourceRef) -> Result<Revision> {
        self.source.resolve_revision(source).await
    }

    /// Fetch the manifest set for `source` at `revision`.
    ///
    /// Concurrent fetches of the same key share one backend read.
    ///
    /// # Errors
    ///
    /// Returns the backend error or `MalformedManifest` if parsing fails.
    /// Failures are not cached.
    pub async fn fetch(&self, source: &SourceRef, revision: &Revision) -> Result<Arc<ManifestSet>> {
        let key = CacheKey {
            repo_url: source.repo_url.clone(),
            path: source.path.clone(),
            revision: revision.clone(),
        };
        let backend = Arc::clone(&self.source);
        let init = async move {
            debug!(
                repo_url = %source.repo_url,
                path = %source.path,
                revision = %revision,
                "Fetching manifests"
            );
            let bytes = backend.resolve(source, revision).await?;
            let resources = parse_manifests(&bytes)?;
            ManifestSet::new(revision.clone(), resources).map(Arc::new)
        };
        self.cache
            .try_get_with(key, init)
            .await
            .map_err(|e: Arc<Error>| (*e).clone())
    }

    /// Resolve the current revision of `source` and fetch it.
    ///
    /// # Errors
    ///
    /// Returns any error from [`Self::resolve_revision`] or [`Self::fetch`].
    pub async fn fetch_current(&self, source: &SourceRef) -> Result<Arc<ManifestSet>> {
        let revision = self.resolve_revision(source).await?;
        self.fetch(source, &revision).await
    }

    /// Number of cached manifest sets.
    pub async fn cached_entries(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}

/// Source backed by a directory tree.
///
/// Layout: `<root>/<repo>/refs/<pointer>` holds the revision a pointer
/// resolves to, and `<root>/<repo>/<revision>/<path>/` holds the manifest
/// files (`.yaml`, `.yml`, `.json`) read in file-name order. A pointer
/// without a ref file resolves to itself when a matching revision
/// directory exists.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    /// Create a source rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo_dir(&self, repo_url: &str) -> Result<PathBuf> {
        let location = repo_url.strip_prefix("file://").unwrap_or(repo_url);
        let location = Path::new(location);
        if location.is_absolute() {
            return Ok(location.to_path_buf());
        }
        relative(location)
            .map(|rel| self.root.join(rel))
            .ok_or_else(|| Error::source_unreachable(repo_url, "invalid repository location"))
    }
}

/// Return `path` if it is relative and never climbs out of its base.
fn relative(path: &Path) -> Option<&Path> {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        .then_some(path)
}

#[async_trait]
impl SourceRepository for DirectorySource {
    async fn resolve_revision(&self, source: &SourceRef) -> Result<Revision> {
        let repo = self.repo_dir(&source.repo_url)?;
        if !tokio::fs::try_exists(&repo).await.unwrap_or(false) {
            return Err(Error::source_unreachable(
                &source.repo_url,
                format!("{} does not exist", repo.display()),
            ));
        }
        let pointer = relative(Path::new(&source.revision))
            .ok_or_else(|| Error::revision_not_found(&source.repo_url, &source.revision))?;

        let ref_file = repo.join("refs").join(pointer);
        if let Ok(content) = tokio::fs::read_to_string(&ref_file).await {
            let target = content.trim();
            if !target.is_empty() {
                return Ok(Revision::new(target));
            }
        }
        if tokio::fs::try_exists(repo.join(pointer)).await.unwrap_or(false) {
            return Ok(Revision::new(source.revision.clone()));
        }
        Err(Error::revision_not_found(&source.repo_url, &source.revision))
    }

    async fn resolve(&self, source: &SourceRef, revision: &Revision) -> Result<Vec<u8>> {
        let repo = self.repo_dir(&source.repo_url)?;
        let revision_dir = relative(Path::new(revision.as_str()))
            .map(|rev| repo.join(rev))
            .ok_or_else(|| Error::revision_not_found(&source.repo_url, revision.as_str()))?;
        if !tokio::fs::try_exists(&revision_dir).await.unwrap_or(false) {
            return Err(Error::revision_not_found(&source.repo_url, revision.as_str()));
        }
        let dir = relative(Path::new(&source.path))
            .map(|p| revision_dir.join(p))
            .ok_or_else(|| {
                Error::malformed_manifest(format!("invalid manifest path '{}'", source.path))
            })?;

        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            Error::malformed_manifest(format!("cannot read '{}': {e}", source.path))
        })?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::source_unreachable(&source.repo_url, e.to_string()))?
        {
            let path = entry.path();
            let is_manifest = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| matches!(ext, "yaml" | "yml" | "json"));
            if is_manifest {
                files.push(path);
            }
        }
        files.sort();

        let mut out = Vec::new();
        for file in files {
            let content = tokio::fs::read(&file)
                .await
                .map_err(|e| Error::source_unreachable(&source.repo_url, e.to_string()))?;
            if !out.is_empty() {
                out.extend_from_slice(b"\n---\n");
            }
            out.extend_from_slice(&content);
        }
        Ok(out)
    }
}

#[derive(Debug, Default)]
struct RepoState {
    refs: HashMap<String, Revision>,
    revisions: HashMap<Revision, HashMap<String, String>>,
}

/// In-memory source for tests and demos.
#[derive(Debug, Default)]
pub struct InMemorySource {
    repos: RwLock<HashMap<String, RepoState>>,
    unreachable: AtomicBool,
    reads: AtomicUsize,
}

impl InMemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `content` at `path` in `revision` of `repo_url`.
    pub async fn commit(
        &self,
        repo_url: &str,
        revision: impl Into<Revision>,
        path: &str,
        content: impl Into<String>,
    ) {
        let mut repos = self.repos.write().await;
        repos
            .entry(repo_url.to_string())
            .or_default()
            .revisions
            .entry(revision.into())
            .or_default()
            .insert(path.to_string(), content.into());
    }

    /// Point `pointer` at `revision`.
    pub async fn set_ref(&self, repo_url: &str, pointer: &str, revision: impl Into<Revision>) {
        let mut repos = self.repos.write().await;
        repos
            .entry(repo_url.to_string())
            .or_default()
            .refs
            .insert(pointer.to_string(), revision.into());
    }

    /// Make every call fail with `SourceUnreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of manifest reads served.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn check_reachable(&self, repo_url: &str) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::source_unreachable(repo_url, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceRepository for InMemorySource {
    async fn resolve_revision(&self, source: &SourceRef) -> Result<Revision> {
        self.check_reachable(&source.repo_url)?;
        let repos = self.repos.read().await;
        let repo = repos
            .get(&source.repo_url)
            .ok_or_else(|| Error::source_unreachable(&source.repo_url, "unknown repository"))?;
        if let Some(revision) = repo.refs.get(&source.revision) {
            return Ok(revision.clone());
        }
        let direct = Revision::new(source.revision.clone());
        if repo.revisions.contains_key(&direct) {
            return Ok(direct);
        }
        Err(Error::revision_not_found(&source.repo_url, &source.revision))
    }

    async fn resolve(&self, source: &SourceRef, revision: &Revision) -> Result<Vec<u8>> {
        self.check_reachable(&source.repo_url)?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let repos = self.repos.read().await;
        let files = repos
            .get(&source.repo_url)
            .ok_or_else(|| Error::source_unreachable(&source.repo_url, "unknown repository"))?
            .revisions
            .get(revision)
            .ok_or_else(|| Error::revision_not_found(&source.repo_url, revision.as_str()))?;
        files
            .get(&source.path)
            .map(|content| content.clone().into_bytes())
            .ok_or_else(|| {
                Error::malformed_manifest(format!("path '{}' not found", source.path))
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const GUESTBOOK: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: web
spec:
  ports:
    - port: 80
---
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 3
"#;

    fn source_ref(repo: &str, path: &str, revision: &str) -> SourceRef {
        SourceRef {
            repo_url: repo.to_string(),
            path: path.to_string(),
            revision: revision.to_string(),
        }
    }

    #[test]
    fn test_parse_skips_empty_documents() {
        let resources = parse_manifests(GUESTBOOK.as_bytes()).unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[1].get("/spec/replicas"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn test_parse_flattens_lists() {
        let yaml = r#"
apiVersion: v1
kind: List
items:
  - apiVersion: v1
    kind: ConfigMap
    metadata: { name: a }
  - apiVersion: v1
    kind: ConfigMap
    metadata: { name: b }
"#;
        let resources = parse_manifests(yaml.as_bytes()).unwrap();
        let names: Vec<_> = resources.iter().map(Resource::name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_parse_rejects_scalars_and_bad_yaml() {
        assert!(matches!(
            parse_manifests(b"just a string"),
            Err(Error::MalformedManifest { .. })
        ));
        assert!(matches!(
            parse_manifests(b"kind: [unclosed"),
            Err(Error::MalformedManifest { .. })
        ));
    }

    #[test]
    fn test_parse_accepts_json() {
        let json = br#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"cfg"}}"#;
        assert_eq!(parse_manifests(json).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_caches_by_revision() {
        let source = Arc::new(InMemorySource::new());
        source.commit("repo", "r1", "app", GUESTBOOK).await;
        source.set_ref("repo", "main", "r1").await;
        let fetcher = ManifestFetcher::new(source.clone(), 16);
        let src = source_ref("repo", "app", "main");

        let first = fetcher.fetch_current(&src).await.unwrap();
        let second = fetcher.fetch_current(&src).await.unwrap();

        assert_eq!(first.revision().as_str(), "r1");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.reads(), 1);
    }

    #[tokio::test]
    async fn test_fetch_follows_moved_pointer() {
        let source = Arc::new(InMemorySource::new());
        source.commit("repo", "r1", "app", GUESTBOOK).await;
        source.commit("repo", "r2", "app", "").await;
        source.set_ref("repo", "main", "r1").await;
        let fetcher = ManifestFetcher::new(source.clone(), 16);
        let src = source_ref("repo", "app", "main");

        assert_eq!(fetcher.fetch_current(&src).await.unwrap().len(), 2);
        source.set_ref("repo", "main", "r2").await;
        let moved = fetcher.fetch_current(&src).await.unwrap();
        assert_eq!(moved.revision().as_str(), "r2");
        assert!(moved.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_errors_are_not_cached() {
        let source = Arc::new(InMemorySource::new());
        source.commit("repo", "r1", "app", GUESTBOOK).await;
        let fetcher = ManifestFetcher::new(source.clone(), 16);
        let src = source_ref("repo", "app", "r1");

        source.set_unreachable(true);
        let err = fetcher.fetch_current(&src).await;
        assert!(matches!(err, Err(Error::SourceUnreachable { .. })));

        source.set_unreachable(false);
        assert!(fetcher.fetch_current(&src).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_revision() {
        let source = Arc::new(InMemorySource::new());
        source.commit("repo", "r1", "app", GUESTBOOK).await;
        let err = source.resolve_revision(&source_ref("repo", "app", "nope")).await;
        assert!(matches!(err, Err(Error::RevisionNotFound { .. })));
    }

    #[tokio::test]
    async fn test_directory_source_layout() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("guestbook");
        std::fs::create_dir_all(repo.join("refs")).unwrap();
        std::fs::create_dir_all(repo.join("abc123").join("deploy")).unwrap();
        std::fs::write(repo.join("refs").join("main"), "abc123\n").unwrap();
        std::fs::write(
            repo.join("abc123").join("deploy").join("10-deploy.yaml"),
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n",
        )
        .unwrap();
        std::fs::write(
            repo.join("abc123").join("deploy").join("00-svc.yml"),
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n",
        )
        .unwrap();
        std::fs::write(repo.join("abc123").join("deploy").join("README.md"), "# x").unwrap();

        let source = DirectorySource::new(dir.path());
        let src = source_ref("guestbook", "deploy", "main");
        let revision = source.resolve_revision(&src).await.unwrap();
        assert_eq!(revision.as_str(), "abc123");

        let bytes = source.resolve(&src, &revision).await.unwrap();
        let resources = parse_manifests(&bytes).unwrap();
        let kinds: Vec<_> = resources.iter().map(Resource::kind).collect();
        assert_eq!(kinds, vec!["Service", "Deployment"]);
    }

    #[tokio::test]
    async fn test_directory_source_missing_repo_and_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path());

        let missing = source.resolve_revision(&source_ref("absent", "", "main")).await;
        assert!(matches!(missing, Err(Error::SourceUnreachable { .. })));

        let escape = source.resolve_revision(&source_ref("../etc", "", "main")).await;
        assert!(matches!(escape, Err(Error::SourceUnreachable { .. })));
    }

    #[tokio::test]
    async fn test_directory_source_pointer_is_revision() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("repo").join("v1.0.0")).unwrap();
        let source = DirectorySource::new(dir.path());
        let revision = source
            .resolve_revision(&source_ref("repo", "", "v1.0.0"))
            .await
            .unwrap();
        assert_eq!(revision.as_str(), "v1.0.0");
    }
}
