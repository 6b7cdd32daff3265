//! Sync operation records and the bounded per-application history.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use keel_events::{AppName, ErrorKind, OperationId, Revision, TriggerCause};
use serde::Serialize;

use crate::diff::{DeltaKind, ResourceDelta};
use crate::error::Error;
use crate::executor::{ApplyReport, ResourceResult};
use crate::types::ResourceKey;

/// Outcome phase of a sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPhase {
    Running,
    Succeeded,
    Failed,
}

/// One computed change, as recorded on the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    pub key: ResourceKey,
    pub kind: DeltaKind,
    /// Changed field paths for updates.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

impl From<&ResourceDelta> for ChangeRecord {
    fn from(delta: &ResourceDelta) -> Self {
        Self {
            key: delta.key.clone(),
            kind: delta.kind,
            fields: delta.changed_fields.clone(),
        }
    }
}

/// Why an operation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    /// Root cause kind.
    pub cause: ErrorKind,
    pub message: String,
    /// Whether some resources were applied before the failure.
    pub partial: bool,
}

impl From<&Error> for SyncFailure {
    fn from(error: &Error) -> Self {
        Self {
            cause: error.root_cause().kind(),
            message: error.to_string(),
            partial: matches!(error, Error::PartialApplyFailure { .. }),
        }
    }
}

/// One sync attempt of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOperation {
    pub id: OperationId,
    pub app: AppName,
    /// Concrete revision, once resolved.
    pub revision: Option<Revision>,
    pub cause: TriggerCause,
    pub changes: Vec<ChangeRecord>,
    pub results: Vec<ResourceResult>,
    pub phase: OperationPhase,
    pub failure: Option<SyncFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncOperation {
    /// Start a new operation.
    pub fn start(app: AppName, cause: TriggerCause) -> Self {
        Self {
            id: OperationId::new(),
            app,
            revision: None,
            cause,
            changes: Vec::new(),
            results: Vec::new(),
            phase: OperationPhase::Running,
            failure: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Record the resolved revision.
    pub fn resolved(&mut self, revision: Revision) {
        self.revision = Some(revision);
    }

    /// Record the computed deltas; unchanged resources are left out.
    pub fn record_changes(&mut self, deltas: &[ResourceDelta]) {
        self.changes = deltas
            .iter()
            .filter(|d| d.kind != DeltaKind::Unchanged)
            .map(ChangeRecord::from)
            .collect();
    }

    /// Finish from an apply report.
    pub fn finish(&mut self, report: ApplyReport) {
        self.results = report.results;
        match report.error {
            Some(error) => self.fail(&error),
            None => {
                self.phase = OperationPhase::Succeeded;
                self.finished_at = Some(Utc::now());
            }
        }
    }

    /// Finish as failed.
    pub fn fail(&mut self, error: &Error) {
        self.phase = OperationPhase::Failed;
        self.failure = Some(SyncFailure::from(error));
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.phase == OperationPhase::Succeeded
    }

    /// Number of resources the cluster accepted.
    pub fn applied(&self) -> usize {
        ApplyReport {
            results: self.results.clone(),
            error: None,
        }
        .applied()
    }
}

/// Most recent operations of one application, newest last.
#[derive(Debug, Clone)]
pub struct OperationHistory {
    limit: usize,
    entries: VecDeque<SyncOperation>,
}

impl OperationHistory {
    /// Create a history holding at most `limit` operations.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            entries: VecDeque::with_capacity(limit),
        }
    }

    /// Record a finished operation, evicting the oldest past the limit.
    pub fn push(&mut self, operation: SyncOperation) {
        self.entries.push_back(operation);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    pub fn last(&self) -> Option<&SyncOperation> {
        self.entries.back()
    }

    /// The most recent successful operation.
    pub fn last_succeeded(&self) -> Option<&SyncOperation> {
        self.entries.iter().rev().find(|op| op.succeeded())
    }

    /// Operations newest first.
    pub fn newest_first(&self) -> Vec<SyncOperation> {
        self.entries.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
