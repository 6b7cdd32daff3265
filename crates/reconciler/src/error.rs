//! Error types for the reconciler crate.

use keel_events::ErrorKind;
use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The version-control source could not be reached.
    #[error("source '{repo_url}' unreachable: {reason}")]
    SourceUnreachable { repo_url: String, reason: String },

    /// The requested revision does not exist in the source.
    #[error("revision '{revision}' not found in '{repo_url}'")]
    RevisionNotFound { repo_url: String, revision: String },

    /// Manifest content could not be parsed into resources.
    #[error("malformed manifest: {reason}")]
    MalformedManifest { reason: String },

    /// The cluster control plane could not be reached.
    #[error("cluster unreachable: {reason}")]
    ClusterUnreachable { reason: String },

    /// The cluster refused the credentials.
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// The cluster rejected a resource as invalid.
    #[error("resource '{resource}' rejected: {reason}")]
    ValidationRejected { resource: String, reason: String },

    /// The cluster asked us to slow down.
    #[error("rate limited: {reason}")]
    RateLimited { reason: String },

    /// A resource addressed by key does not exist in the cluster.
    #[error("resource '{resource}' not found")]
    ResourceNotFound { resource: String },

    /// Some resources were applied before the operation aborted.
    #[error("partial apply: {applied} resource(s) applied before failure: {cause}")]
    PartialApplyFailure { applied: usize, cause: Box<Error> },

    /// No application with this name is registered.
    #[error("application '{name}' not found")]
    ApplicationNotFound { name: String },

    /// An application with this name is already registered.
    #[error("application '{name}' already registered")]
    ApplicationExists { name: String },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The controller or scheduler has been shut down.
    #[error("controller stopped")]
    Stopped,
}

impl Error {
    /// Create a source unreachable error.
    pub fn source_unreachable(repo_url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceUnreachable {
            repo_url: repo_url.into(),
            reason: reason.into(),
        }
    }

    /// Create a revision not found error.
    pub fn revision_not_found(repo_url: impl Into<String>, revision: impl Into<String>) -> Self {
        Self::RevisionNotFound {
            repo_url: repo_url.into(),
            revision: revision.into(),
        }
    }

    /// Create a malformed manifest error.
    pub fn malformed_manifest(reason: impl Into<String>) -> Self {
        Self::MalformedManifest {
            reason: reason.into(),
        }
    }

    /// Create a cluster unreachable error.
    pub fn cluster_unreachable(reason: impl Into<String>) -> Self {
        Self::ClusterUnreachable {
            reason: reason.into(),
        }
    }

    /// Create an unauthorized error.
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    /// Create a validation rejected error.
    pub fn validation_rejected(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationRejected {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Create a rate limited error.
    pub fn rate_limited(reason: impl Into<String>) -> Self {
        Self::RateLimited {
            reason: reason.into(),
        }
    }

    /// Create a resource not found error.
    pub fn resource_not_found(resource: impl Into<String>) -> Self {
        Self::ResourceNotFound {
            resource: resource.into(),
        }
    }

    /// Wrap `cause` as a partial apply failure.
    pub fn partial_apply(applied: usize, cause: Error) -> Self {
        Self::PartialApplyFailure {
            applied,
            cause: Box::new(cause),
        }
    }

    /// Create an application not found error.
    pub fn application_not_found(name: impl Into<String>) -> Self {
        Self::ApplicationNotFound { name: name.into() }
    }

    /// Create an application exists error.
    pub fn application_exists(name: impl Into<String>) -> Self {
        Self::ApplicationExists { name: name.into() }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Classify this error in the sync failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceUnreachable { .. } => ErrorKind::SourceUnreachable,
            Self::RevisionNotFound { .. } => ErrorKind::RevisionNotFound,
            Self::MalformedManifest { .. } => ErrorKind::MalformedManifest,
            Self::ClusterUnreachable { .. } => ErrorKind::ClusterUnreachable,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::ValidationRejected { .. } => ErrorKind::ValidationRejected,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::PartialApplyFailure { .. } => ErrorKind::PartialApplyFailure,
            Self::ResourceNotFound { .. }
            | Self::ApplicationNotFound { .. }
            | Self::ApplicationExists { .. }
            | Self::InvalidConfig { .. }
            | Self::Stopped => ErrorKind::Internal,
        }
    }

    /// The innermost error, unwrapping partial apply failures.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::PartialApplyFailure { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}
