//! Core types shared between the events crate and the engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Name of a registered application. Unique within a controller.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppName(String);

impl AppName {
    /// Create an application name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AppName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Ulid);

impl EventId {
    /// Create a new random event ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Get the inner ULID.
    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Ulid);

impl OperationId {
    /// Create a new random operation ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Get the inner ULID.
    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A concrete, content-addressed source revision (e.g. a commit id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Create a revision.
    pub fn new(rev: impl Into<String>) -> Self {
        Self(rev.into())
    }

    /// Borrow the revision as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Revision {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// What caused a sync to be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCause {
    /// Periodic refresh timer.
    Scheduled,
    /// External push notification.
    Webhook,
    /// Operator request.
    Manual,
    /// Drift detected on a self-healing application.
    SelfHeal,
}

impl TriggerCause {
    /// Whether the trigger came from automation rather than an operator.
    pub fn is_automatic(&self) -> bool {
        matches!(self, Self::Scheduled | Self::SelfHeal)
    }
}

impl fmt::Display for TriggerCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Webhook => "webhook",
            Self::Manual => "manual",
            Self::SelfHeal => "self_heal",
        };
        write!(f, "{s}")
    }
}

/// Scheduler phase of an application.
///
/// ```text
/// Idle -> Queued -> Syncing -> Idle
///                      \-> Failed -> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Nothing pending or running.
    Idle,
    /// A trigger is admitted and waiting for the worker.
    Queued,
    /// A sync operation is running.
    Syncing,
    /// The last operation failed.
    Failed,
}

impl SyncPhase {
    /// Check if transition to target phase is valid.
    pub fn can_transition_to(&self, target: SyncPhase) -> bool {
        use SyncPhase::*;
        matches!(
            (self, target),
            (Idle, Queued)
                | (Queued, Syncing)
                | (Queued, Idle) // cancelled
                | (Syncing, Idle)
                | (Syncing, Queued) // succeeded with a coalesced trigger pending
                | (Syncing, Failed)
                | (Failed, Idle)
                | (Failed, Queued)
        )
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Queued => "queued",
            Self::Syncing => "syncing",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Health of a resource or of a whole application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Missing,
    Progressing,
    Degraded,
}

impl HealthStatus {
    /// Severity used for aggregation; higher is worse.
    pub fn severity(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Missing => 1,
            Self::Progressing => 2,
            Self::Degraded => 3,
        }
    }

    /// Worst status of a set; an empty set is healthy.
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = HealthStatus>,
    {
        statuses
            .into_iter()
            .max_by_key(HealthStatus::severity)
            .unwrap_or(Self::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Missing => "missing",
            Self::Progressing => "progressing",
            Self::Degraded => "degraded",
        };
        write!(f, "{s}")
    }
}

/// Whether live state matches desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    OutOfSync,
    Unknown,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Synced => "synced",
            Self::OutOfSync => "out_of_sync",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Failure taxonomy surfaced on sync operations and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnreachable,
    RevisionNotFound,
    MalformedManifest,
    ClusterUnreachable,
    Unauthorized,
    ValidationRejected,
    RateLimited,
    PartialApplyFailure,
    Internal,
}

impl ErrorKind {
    /// Transient kinds are retried by the apply executor.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ClusterUnreachable | Self::RateLimited)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SourceUnreachable => "source_unreachable",
            Self::RevisionNotFound => "revision_not_found",
            Self::MalformedManifest => "malformed_manifest",
            Self::ClusterUnreachable => "cluster_unreachable",
            Self::Unauthorized => "unauthorized",
            Self::ValidationRejected => "validation_rejected",
            Self::RateLimited => "rate_limited",
            Self::PartialApplyFailure => "partial_apply_failure",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}
