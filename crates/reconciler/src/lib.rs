//! Declarative GitOps reconciliation engine.
//!
//! Applications bind a versioned manifest source to a cluster destination.
//! For each one the engine keeps converging live state towards the desired
//! manifests:
//!
//! - **Fetch**: resolve the revision pointer and parse the manifests at it
//! - **Observe**: poll the cluster for the resources the application manages
//! - **Diff**: compare both sides after normalization
//! - **Sync**: apply the differences under a per-application state machine
//! - **Health**: assess the live resources kind by kind
//!
//! # Sync phases
//!
//! ```text
//! Idle -> Queued -> Syncing -> Idle
//!                      \-> Failed -> Idle
//! ```
//!
//! At most one sync runs per application; triggers that arrive while one is
//! queued coalesce into it.
//!
//! # Example
//!
//! ```ignore
//! use keel_reconciler::{
//!     Application, Controller, InMemoryCluster, InMemorySource, SourceRef, IN_CLUSTER,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> keel_reconciler::Result<()> {
//!     let source = Arc::new(InMemorySource::new());
//!     source.commit("guestbook", "rev-1", "", "kind: ConfigMap ...").await;
//!     source.set_ref("guestbook", "HEAD", "rev-1").await;
//!
//!     let controller = Controller::builder()
//!         .with_source(source)
//!         .with_cluster(IN_CLUSTER, Arc::new(InMemoryCluster::new()))
//!         .build()?;
//!
//!     let app = Application::new("guestbook", SourceRef::new("guestbook"));
//!     controller.register(app.clone()).await?;
//!     controller.sync(&app.name).await?;
//!     controller.shutdown().await;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod cluster;
pub mod config;
pub mod controller;
pub mod diff;
pub mod error;
pub mod executor;
pub mod health;
pub mod notify;
pub mod observer;
pub mod operation;
pub mod scheduler;
pub mod source;
pub mod types;

pub use cluster::{ClusterClient, FaultOp, InMemoryCluster};
pub use config::{ControllerConfig, RetryPolicy};
pub use controller::{AppStatus, Controller, ControllerBuilder, WebhookReport};
pub use diff::{diff, is_synced, DeltaKind, DiffOptions, DiffSummary, IgnoreRules, ResourceDelta};
pub use error::{Error, Result};
pub use executor::{ApplyExecutor, ApplyReport, ApplyStatus, ResourceResult};
pub use health::{assess, ApplicationHealth, HealthEvaluator, ResourceHealth};
pub use notify::{ChannelSink, NotificationSink, TracingSink};
pub use observer::{LiveStateObserver, ObserverTask, PollOutcome};
pub use operation::{ChangeRecord, OperationHistory, OperationPhase, SyncFailure, SyncOperation};
pub use scheduler::{SchedulerState, SyncRunner, SyncScheduler, TriggerOutcome};
pub use source::{
    parse_manifests, DirectorySource, InMemorySource, ManifestFetcher, SourceRepository,
};
pub use types::{
    Application, Destination, LiveSnapshot, ManifestSet, Resource, ResourceKey, Selector,
    SourceRef, SyncPolicy, IN_CLUSTER, TRACKING_LABEL,
};
