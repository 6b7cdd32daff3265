//! Sync lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AppName, ErrorKind, EventId, HealthStatus, OperationId, Revision, SyncPhase, TriggerCause,
};

/// Events emitted by the reconciliation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// An application was registered.
    Registered {
        event_id: EventId,
        app: AppName,
        timestamp: DateTime<Utc>,
    },
    /// An application was unregistered.
    Unregistered {
        event_id: EventId,
        app: AppName,
        cascade: bool,
        timestamp: DateTime<Utc>,
    },
    /// The scheduler phase of an application changed.
    PhaseChanged {
        event_id: EventId,
        app: AppName,
        from: SyncPhase,
        to: SyncPhase,
        timestamp: DateTime<Utc>,
    },
    /// A sync operation started.
    SyncStarted {
        event_id: EventId,
        app: AppName,
        operation_id: OperationId,
        cause: TriggerCause,
        timestamp: DateTime<Utc>,
    },
    /// A sync operation finished successfully.
    SyncSucceeded {
        event_id: EventId,
        app: AppName,
        operation_id: OperationId,
        revision: Revision,
        applied: usize,
        timestamp: DateTime<Utc>,
    },
    /// A sync operation failed.
    SyncFailed {
        event_id: EventId,
        app: AppName,
        operation_id: OperationId,
        revision: Option<Revision>,
        cause: ErrorKind,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Live state diverged from desired state.
    DriftDetected {
        event_id: EventId,
        app: AppName,
        out_of_sync: usize,
        timestamp: DateTime<Utc>,
    },
    /// Aggregate health of an application changed.
    HealthChanged {
        event_id: EventId,
        app: AppName,
        from: HealthStatus,
        to: HealthStatus,
        timestamp: DateTime<Utc>,
    },
    /// The live-state observer could not reach the cluster.
    ObservationFailed {
        event_id: EventId,
        app: AppName,
        reason: String,
        stale: bool,
        timestamp: DateTime<Utc>,
    },
    /// Automated sync was suspended for an application.
    AutosyncSuspended {
        event_id: EventId,
        app: AppName,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl SyncEvent {
    /// Create a Registered event.
    pub fn registered(app: AppName) -> Self {
        Self::Registered {
            event_id: EventId::new(),
            app,
            timestamp: Utc::now(),
        }
    }

    /// Create an Unregistered event.
    pub fn unregistered(app: AppName, cascade: bool) -> Self {
        Self::Unregistered {
            event_id: EventId::new(),
            app,
            cascade,
            timestamp: Utc::now(),
        }
    }

    /// Create a PhaseChanged event.
    pub fn phase_changed(app: AppName, from: SyncPhase, to: SyncPhase) -> Self {
        Self::PhaseChanged {
            event_id: EventId::new(),
            app,
            from,
            to,
            timestamp: Utc::now(),
        }
    }

    /// Create a SyncStarted event.
    pub fn sync_started(app: AppName, operation_id: OperationId, cause: TriggerCause) -> Self {
        Self::SyncStarted {
            event_id: EventId::new(),
            app,
            operation_id,
            cause,
            timestamp: Utc::now(),
        }
    }

    /// Create a SyncSucceeded event.
    pub fn sync_succeeded(
        app: AppName,
        operation_id: OperationId,
        revision: Revision,
        applied: usize,
    ) -> Self {
        Self::SyncSucceeded {
            event_id: EventId::new(),
            app,
            operation_id,
            revision,
            applied,
            timestamp: Utc::now(),
        }
    }

    /// Create a SyncFailed event.
    pub fn sync_failed(
        app: AppName,
        operation_id: OperationId,
        revision: Option<Revision>,
        cause: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::SyncFailed {
            event_id: EventId::new(),
            app,
            operation_id,
            revision,
            cause,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a DriftDetected event.
    pub fn drift_detected(app: AppName, out_of_sync: usize) -> Self {
        Self::DriftDetected {
            event_id: EventId::new(),
            app,
            out_of_sync,
            timestamp: Utc::now(),
        }
    }

    /// Create a HealthChanged event.
    pub fn health_changed(app: AppName, from: HealthStatus, to: HealthStatus) -> Self {
        Self::HealthChanged {
            event_id: EventId::new(),
            app,
            from,
            to,
            timestamp: Utc::now(),
        }
    }

    /// Create an ObservationFailed event.
    pub fn observation_failed(app: AppName, reason: impl Into<String>, stale: bool) -> Self {
        Self::ObservationFailed {
            event_id: EventId::new(),
            app,
            reason: reason.into(),
            stale,
            timestamp: Utc::now(),
        }
    }

    /// Create an AutosyncSuspended event.
    pub fn autosync_suspended(app: AppName, reason: impl Into<String>) -> Self {
        Self::AutosyncSuspended {
            event_id: EventId::new(),
            app,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// Get the event ID.
    pub fn event_id(&self) -> EventId {
        match self {
            Self::Registered { event_id, .. }
            | Self::Unregistered { event_id, .. }
            | Self::PhaseChanged { event_id, .. }
            | Self::SyncStarted { event_id, .. }
            | Self::SyncSucceeded { event_id, .. }
            | Self::SyncFailed { event_id, .. }
            | Self::DriftDetected { event_id, .. }
            | Self::HealthChanged { event_id, .. }
            | Self::ObservationFailed { event_id, .. }
            | Self::AutosyncSuspended { event_id, .. } => *event_id,
        }
    }

    /// Get the application this event concerns.
    pub fn app(&self) -> &AppName {
        match self {
            Self::Registered { app, .. }
            | Self::Unregistered { app, .. }
            | Self::PhaseChanged { app, .. }
            | Self::SyncStarted { app, .. }
            | Self::SyncSucceeded { app, .. }
            | Self::SyncFailed { app, .. }
            | Self::DriftDetected { app, .. }
            | Self::HealthChanged { app, .. }
            | Self::ObservationFailed { app, .. }
            | Self::AutosyncSuspended { app, .. } => app,
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Registered { timestamp, .. }
            | Self::Unregistered { timestamp, .. }
            | Self::PhaseChanged { timestamp, .. }
            | Self::SyncStarted { timestamp, .. }
            | Self::SyncSucceeded { timestamp, .. }
            | Self::SyncFailed { timestamp, .. }
            | Self::DriftDetected { timestamp, .. }
            | Self::HealthChanged { timestamp, .. }
            | Self::ObservationFailed { timestamp, .. }
            | Self::AutosyncSuspended { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::Unregistered { .. } => "unregistered",
            Self::PhaseChanged { .. } => "phase_changed",
            Self::SyncStarted { .. } => "sync_started",
            Self::SyncSucceeded { .. } => "sync_succeeded",
            Self::SyncFailed { .. } => "sync_failed",
            Self::DriftDetected { .. } => "drift_detected",
            Self::HealthChanged { .. } => "health_changed",
            Self::ObservationFailed { .. } => "observation_failed",
            Self::AutosyncSuspended { .. } => "autosync_suspended",
        }
    }

    /// Whether this event ends a sync operation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SyncSucceeded { .. } | Self::SyncFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let event = SyncEvent::drift_detected(AppName::from("guestbook"), 2);
        assert_eq!(event.event_type(), "drift_detected");
        assert_eq!(event.app().as_str(), "guestbook");
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_terminal_events() {
        let op = OperationId::new();
        let ok = SyncEvent::sync_succeeded(AppName::from("a"), op, Revision::from("abc"), 3);
        let failed = SyncEvent::sync_failed(
            AppName::from("a"),
            op,
            None,
            ErrorKind::ValidationRejected,
            "bad spec",
        );
        assert!(ok.is_terminal());
        assert!(failed.is_terminal());
    }

    #[test]
    fn test_json_round_trip_keeps_identity() {
        let event = SyncEvent::phase_changed(AppName::from("a"), SyncPhase::Idle, SyncPhase::Queued);
        let json = serde_json::to_string(&event).map_err(|e| e.to_string());
        let back: Result<SyncEvent, String> =
            json.and_then(|j| serde_json::from_str(&j).map_err(|e| e.to_string()));
        assert_eq!(back.map(|e| e.event_id()).ok(), Some(event.event_id()));
    }
}
