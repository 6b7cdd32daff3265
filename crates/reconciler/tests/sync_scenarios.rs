//! End-to-end sync scenarios against the in-memory source and cluster.
//!
//! Following BDD naming convention: given_<context>_when_<action>_then_<outcome>

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use keel_events::{
    AppName, ErrorKind, EventBus, EventPattern, EventStore, HealthStatus, InMemoryEventStore, SyncEvent,
    SyncPhase, SyncStatus, TriggerCause,
};
use keel_reconciler::{
    AppStatus, Application, ChannelSink, ClusterClient, Controller, ControllerConfig, Error,
    FaultOp, InMemoryCluster, InMemorySource, OperationPhase, Resource, ResourceKey,
    SourceRef, SourceRepository, SyncPolicy, IN_CLUSTER, TRACKING_LABEL,
};
use serde_json::json;

const REPO: &str = "https://git.example.com/shop.git";

const WEB: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 3
  template:
    spec:
      containers:
        - name: web
          image: shop/web:1.0
"#;

const WEB_AND_SETTINGS: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  theme: dark
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 3
  template:
    spec:
      containers:
        - name: web
          image: shop/web:2.0
"#;

struct Harness {
    controller: Arc<Controller>,
    source: Arc<InMemorySource>,
    cluster: Arc<InMemoryCluster>,
}

fn fast_config() -> ControllerConfig {
    ControllerConfig {
        sync_interval: Duration::from_secs(3600),
        poll_interval: Duration::from_millis(50),
        health_interval: Duration::from_millis(50),
        converge_timeout: Duration::ZERO,
        ..ControllerConfig::default()
    }
}

async fn harness(config: ControllerConfig, manifests: &str) -> Result<Harness, String> {
    harness_with(config, manifests, |builder| builder).await
}

async fn harness_with<F>(
    config: ControllerConfig,
    manifests: &str,
    customize: F,
) -> Result<Harness, String>
where
    F: FnOnce(keel_reconciler::ControllerBuilder) -> keel_reconciler::ControllerBuilder,
{
    let source = Arc::new(InMemorySource::new());
    source.commit(REPO, "rev-1", "deploy", manifests).await;
    source.set_ref(REPO, "main", "rev-1").await;
    let cluster = Arc::new(InMemoryCluster::new());

    let builder = Controller::builder()
        .with_source(Arc::clone(&source) as Arc<dyn SourceRepository>)
        .with_cluster(IN_CLUSTER, Arc::clone(&cluster) as Arc<dyn ClusterClient>)
        .with_config(config);
    let controller = customize(builder)
        .build()
        .map_err(|e| format!("build failed: {e}"))?;
    Ok(Harness {
        controller,
        source,
        cluster,
    })
}

fn shop(policy: SyncPolicy) -> Application {
    Application::new(
        "shop",
        SourceRef::new(REPO)
            .with_path("deploy")
            .with_revision("main"),
    )
    .with_policy(policy)
}

fn key(group: &str, kind: &str, name: &str) -> ResourceKey {
    ResourceKey::new(group, kind, Some("default"), name)
}

/// Poll the status of `name` until `done` holds.
async fn wait_for<F>(controller: &Controller, name: &AppName, what: &str, done: F) -> Result<AppStatus, String>
where
    F: Fn(&AppStatus) -> bool,
{
    for _ in 0..300 {
        let status = controller
            .status(name)
            .await
            .map_err(|e| format!("status failed: {e}"))?;
        if done(&status) {
            return Ok(status);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err(format!("timed out waiting for {what}"))
}

fn settled(status: &AppStatus) -> bool {
    status.phase == SyncPhase::Idle && status.pending.is_none() && status.last_operation.is_some()
}

async fn sync_and_wait(controller: &Controller, name: &AppName) -> Result<AppStatus, String> {
    let before = controller
        .status(name)
        .await
        .map_err(|e| e.to_string())?
        .last_operation
        .map(|op| op.id);
    controller.sync(name).await.map_err(|e| e.to_string())?;
    wait_for(controller, name, "manual sync", |s| {
        settled(s) && s.last_operation.as_ref().map(|op| op.id) != before
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_new_deployment_when_synced_then_health_moves_from_progressing_to_healthy(
) -> Result<(), String> {
    // GIVEN: desired has a Deployment with 3 replicas, live has nothing
    let h = harness(fast_config(), WEB).await?;
    let name = AppName::from("shop");
    h.controller
        .register(shop(SyncPolicy::default()))
        .await
        .map_err(|e| e.to_string())?;

    let status = h
        .controller
        .refresh(&name)
        .await
        .map_err(|e| e.to_string())?;
    assert_eq!(status, SyncStatus::OutOfSync);
    let status = h.controller.status(&name).await.map_err(|e| e.to_string())?;
    assert_eq!(status.drift.create, 1, "diff should yield one Create");

    // WHEN: the sync applies it
    let status = sync_and_wait(&h.controller, &name).await?;
    let op = status.last_operation.ok_or("no operation recorded")?;
    assert_eq!(op.phase, OperationPhase::Succeeded);
    assert_eq!(op.cause, TriggerCause::Manual);

    // THEN: 0/3 ready is Progressing
    wait_for(&h.controller, &name, "progressing", |s| {
        s.health == HealthStatus::Progressing
    })
    .await?;
    let live = h
        .cluster
        .object(&key("apps", "Deployment", "web"))
        .await
        .ok_or("deployment not applied")?;
    assert_eq!(live.label(TRACKING_LABEL), Some("shop"));

    // AND: 3/3 ready is Healthy
    h.cluster.converge_workloads().await;
    let status = wait_for(&h.controller, &name, "healthy", |s| {
        s.health == HealthStatus::Healthy
    })
    .await?;
    assert_eq!(status.sync_status, SyncStatus::Synced);

    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_extra_live_resource_when_prune_unset_then_ignored_and_kept() -> Result<(), String> {
    let h = harness(fast_config(), WEB).await?;
    let name = AppName::from("shop");
    let orphan = Resource::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "legacy", "namespace": "default" },
        "data": { "old": "true" }
    }))
    .map_err(|e| e.to_string())?
    .with_label(TRACKING_LABEL, "shop");
    h.cluster.seed(orphan).await;

    h.controller
        .register(shop(SyncPolicy::default()))
        .await
        .map_err(|e| e.to_string())?;
    sync_and_wait(&h.controller, &name).await?;

    // Without prune the orphan is reported, never deleted.
    let status = wait_for(&h.controller, &name, "ignored orphan", |s| s.drift.ignored == 1).await?;
    assert_eq!(status.drift.delete, 0);
    assert_eq!(status.sync_status, SyncStatus::OutOfSync);
    assert!(h.cluster.object(&key("", "ConfigMap", "legacy")).await.is_some());

    // With prune the next sync deletes it.
    h.controller
        .update_policy(
            &name,
            SyncPolicy {
                prune: true,
                ..SyncPolicy::default()
            },
        )
        .await
        .map_err(|e| e.to_string())?;
    sync_and_wait(&h.controller, &name).await?;
    assert!(h.cluster.object(&key("", "ConfigMap", "legacy")).await.is_none());
    let status = wait_for(&h.controller, &name, "synced", |s| {
        s.sync_status == SyncStatus::Synced
    })
    .await?;
    assert_eq!(status.drift.ignored, 0);

    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_update_rejected_when_synced_then_failed_without_rollback() -> Result<(), String> {
    // GIVEN: live has an older Deployment, desired adds a ConfigMap and
    // changes the Deployment
    let h = harness(fast_config(), WEB_AND_SETTINGS).await?;
    let name = AppName::from("shop");
    let existing = Resource::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": "web", "namespace": "default" },
        "spec": {
            "replicas": 3,
            "template": { "spec": { "containers": [{ "name": "web", "image": "shop/web:1.0" }] } }
        }
    }))
    .map_err(|e| e.to_string())?
    .with_label(TRACKING_LABEL, "shop");
    h.cluster.seed(existing).await;
    h.cluster
        .inject_fault(
            FaultOp::Apply,
            key("apps", "Deployment", "web"),
            Error::validation_rejected("apps/Deployment/default/web", "image not allowed"),
        )
        .await;

    h.controller
        .register(shop(SyncPolicy::default()))
        .await
        .map_err(|e| e.to_string())?;

    // WHEN
    let status = sync_and_wait(&h.controller, &name).await?;

    // THEN: Failed, cause ValidationRejected, the ConfigMap stays applied
    let op = status.last_operation.ok_or("no operation recorded")?;
    assert_eq!(op.phase, OperationPhase::Failed);
    let failure = op.failure.ok_or("no failure recorded")?;
    assert_eq!(failure.cause, ErrorKind::ValidationRejected);
    assert!(failure.partial);
    assert_eq!(
        status.last_failure.map(|f| f.cause),
        Some(ErrorKind::ValidationRejected)
    );
    assert!(h.cluster.object(&key("", "ConfigMap", "settings")).await.is_some());
    let web = h
        .cluster
        .object(&key("apps", "Deployment", "web"))
        .await
        .ok_or("deployment missing")?;
    assert_eq!(
        web.get("/spec/template/spec/containers/0/image"),
        Some(&json!("shop/web:1.0"))
    );
    assert_eq!(status.phase, SyncPhase::Idle);

    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_unreachable_source_when_synced_then_cause_is_recorded() -> Result<(), String> {
    let h = harness(fast_config(), WEB).await?;
    let name = AppName::from("shop");
    h.controller
        .register(shop(SyncPolicy::default()))
        .await
        .map_err(|e| e.to_string())?;
    h.source.set_unreachable(true);

    let status = sync_and_wait(&h.controller, &name).await?;
    let op = status.last_operation.ok_or("no operation recorded")?;
    assert_eq!(op.phase, OperationPhase::Failed);
    assert_eq!(op.revision, None);
    assert_eq!(
        op.failure.map(|f| f.cause),
        Some(ErrorKind::SourceUnreachable)
    );
    assert_eq!(h.cluster.apply_count(), 0);

    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_cluster_slower_than_apply_timeout_when_synced_then_failure_recorded(
) -> Result<(), String> {
    // GIVEN: every cluster call takes longer than an apply attempt may
    let config = ControllerConfig {
        poll_interval: Duration::from_secs(3600),
        health_interval: Duration::from_secs(3600),
        apply_timeout: Duration::from_millis(50),
        retry: keel_reconciler::RetryPolicy::new(2, 1, 5).without_jitter(),
        ..fast_config()
    };
    let h = harness(config, WEB).await?;
    let name = AppName::from("shop");
    h.controller
        .register(shop(SyncPolicy::default()))
        .await
        .map_err(|e| e.to_string())?;
    h.cluster.set_latency(Duration::from_millis(300));

    // WHEN
    let status = sync_and_wait(&h.controller, &name).await?;

    // THEN: the operation failed with a transient cause and nothing claims to be synced
    let op = status.last_operation.ok_or("no operation recorded")?;
    assert_eq!(op.phase, OperationPhase::Failed);
    assert_eq!(
        op.failure.map(|f| f.cause),
        Some(ErrorKind::ClusterUnreachable)
    );
    assert_eq!(status.synced_revision, None);
    assert_eq!(status.sync_status, SyncStatus::OutOfSync);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(h.cluster.object(&key("apps", "Deployment", "web")).await.is_none());

    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_automated_app_when_registered_then_synced_and_revision_moves_resync(
) -> Result<(), String> {
    let config = ControllerConfig {
        sync_interval: Duration::from_millis(100),
        ..fast_config()
    };
    let h = harness(config, WEB).await?;
    let name = AppName::from("shop");
    h.controller
        .register(shop(SyncPolicy {
            automated: true,
            ..SyncPolicy::default()
        }))
        .await
        .map_err(|e| e.to_string())?;

    let status = wait_for(&h.controller, &name, "first automated sync", |s| {
        s.synced_revision.as_ref().map(|r| r.as_str()) == Some("rev-1")
    })
    .await?;
    let op = status.last_operation.ok_or("no operation recorded")?;
    assert_eq!(op.cause, TriggerCause::Scheduled);

    // Moving the pointer triggers another sync on the next refresh.
    h.source
        .commit(REPO, "rev-2", "deploy", WEB_AND_SETTINGS)
        .await;
    h.source.set_ref(REPO, "main", "rev-2").await;
    wait_for(&h.controller, &name, "sync of rev-2", |s| {
        s.synced_revision.as_ref().map(|r| r.as_str()) == Some("rev-2") && settled(s)
    })
    .await?;
    assert!(h.cluster.object(&key("", "ConfigMap", "settings")).await.is_some());

    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_self_heal_when_live_drifts_then_drift_is_reverted() -> Result<(), String> {
    let h = harness(fast_config(), WEB).await?;
    let name = AppName::from("shop");
    h.controller
        .register(shop(SyncPolicy {
            automated: true,
            prune: false,
            self_heal: true,
        }))
        .await
        .map_err(|e| e.to_string())?;
    wait_for(&h.controller, &name, "initial sync", |s| {
        s.synced_revision.is_some() && settled(s)
    })
    .await?;

    // Someone scales the deployment by hand.
    h.cluster
        .mutate(&key("apps", "Deployment", "web"), |body| {
            if let Some(spec) = body.get_mut("spec").and_then(|s| s.as_object_mut()) {
                spec.insert("replicas".to_string(), json!(1));
            }
        })
        .await
        .map_err(|e| e.to_string())?;

    let status = wait_for(&h.controller, &name, "self-heal", |s| {
        s.last_operation
            .as_ref()
            .is_some_and(|op| op.cause == TriggerCause::SelfHeal && op.finished_at.is_some())
    })
    .await?;
    assert_eq!(
        status.last_operation.map(|op| op.phase),
        Some(OperationPhase::Succeeded)
    );
    let web = h
        .cluster
        .object(&key("apps", "Deployment", "web"))
        .await
        .ok_or("deployment missing")?;
    assert_eq!(web.get("/spec/replicas"), Some(&json!(3)));

    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_many_syncs_when_history_full_then_oldest_dropped() -> Result<(), String> {
    let config = ControllerConfig {
        history_limit: 3,
        ..fast_config()
    };
    let h = harness(config, WEB).await?;
    let name = AppName::from("shop");
    h.controller
        .register(shop(SyncPolicy::default()))
        .await
        .map_err(|e| e.to_string())?;

    let mut seen = Vec::new();
    for _ in 0..5 {
        let status = sync_and_wait(&h.controller, &name).await?;
        if let Some(op) = status.last_operation {
            seen.push(op.id);
        }
    }

    let history = h.controller.history(&name).await.map_err(|e| e.to_string())?;
    assert_eq!(history.len(), 3);
    assert_eq!(history.first().map(|op| op.id), seen.last().copied());

    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_webhook_when_repo_matches_then_automated_synced_and_manual_refreshed(
) -> Result<(), String> {
    let config = ControllerConfig {
        poll_interval: Duration::from_secs(3600),
        health_interval: Duration::from_secs(3600),
        ..fast_config()
    };
    let h = harness(config, WEB).await?;
    h.controller
        .register(shop(SyncPolicy::default()))
        .await
        .map_err(|e| e.to_string())?;
    let auto = Application::new("shop-auto", SourceRef::new(REPO).with_path("deploy").with_revision("main"))
        .with_policy(SyncPolicy {
            automated: true,
            ..SyncPolicy::default()
        });
    h.controller
        .register(auto)
        .await
        .map_err(|e| e.to_string())?;

    let report = h
        .controller
        .webhook("https://git.example.com/shop")
        .await;
    assert_eq!(report.triggered, vec![AppName::from("shop-auto")]);
    assert_eq!(report.refreshed, vec![AppName::from("shop")]);

    let unrelated = h.controller.webhook("https://git.example.com/other.git").await;
    assert!(unrelated.triggered.is_empty() && unrelated.refreshed.is_empty());

    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_synced_app_when_unregistered_with_cascade_then_resources_deleted(
) -> Result<(), String> {
    let h = harness(fast_config(), WEB_AND_SETTINGS).await?;
    let name = AppName::from("shop");
    h.controller
        .register(shop(SyncPolicy::default()))
        .await
        .map_err(|e| e.to_string())?;
    sync_and_wait(&h.controller, &name).await?;
    assert_eq!(h.cluster.objects().await.len(), 2);

    h.controller
        .unregister(&name, true)
        .await
        .map_err(|e| e.to_string())?;

    assert!(h.cluster.objects().await.is_empty());
    assert!(h.controller.status(&name).await.is_err());
    assert!(h.controller.list().await.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_degraded_app_when_suspend_enabled_then_automated_triggers_dropped(
) -> Result<(), String> {
    let config = ControllerConfig {
        suspend_on_degraded: true,
        health_grace_period: Duration::ZERO,
        ..fast_config()
    };
    let (sink, mut notifications) = ChannelSink::new(64);
    let h = harness_with(config, WEB, |builder| builder.with_sink(Arc::new(sink))).await?;
    let name = AppName::from("shop");
    h.controller
        .register(shop(SyncPolicy {
            automated: true,
            ..SyncPolicy::default()
        }))
        .await
        .map_err(|e| e.to_string())?;

    // The deployment never becomes ready, so it degrades immediately.
    wait_for(&h.controller, &name, "suspension", |s| s.autosync_suspended).await?;
    let dropped = h
        .controller
        .trigger(&name, TriggerCause::Scheduled)
        .await
        .map_err(|e| e.to_string())?;
    assert!(dropped.is_none(), "automated trigger should be dropped");

    let suspension = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = notifications.recv().await {
            if matches!(event, SyncEvent::AutosyncSuspended { .. }) {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(suspension, Ok(true), "sinks should hear about the suspension");

    // Manual syncs still go through.
    let outcome = h.controller.sync(&name).await.map_err(|e| e.to_string())?;
    assert!(matches!(
        outcome,
        keel_reconciler::TriggerOutcome::Queued | keel_reconciler::TriggerOutcome::Coalesced
    ));

    h.controller.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_bus_when_sync_runs_then_lifecycle_events_published_in_order() -> Result<(), String> {
    let bus = Arc::new(EventBus::new(Arc::new(InMemoryEventStore::new())));
    let bus_for_builder = Arc::clone(&bus);
    let h = harness_with(fast_config(), WEB, move |builder| {
        builder.with_bus(bus_for_builder)
    })
    .await?;
    let name = AppName::from("shop");
    let (_id, mut events) = bus
        .subscribe_with_pattern(EventPattern::ByTypes(vec![
            "sync_started".to_string(),
            "sync_succeeded".to_string(),
            "sync_failed".to_string(),
        ]))
        .await;

    h.controller
        .register(shop(SyncPolicy::default()))
        .await
        .map_err(|e| e.to_string())?;
    sync_and_wait(&h.controller, &name).await?;

    let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .map_err(|_| "no event".to_string())?
        .map_err(|e| e.to_string())?;
    let second = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .map_err(|_| "no second event".to_string())?
        .map_err(|e| e.to_string())?;
    assert_eq!(first.event_type(), "sync_started");
    assert_eq!(second.event_type(), "sync_succeeded");
    assert!(second.is_terminal());

    let stored = bus
        .store()
        .read_for_app(&name)
        .await
        .map_err(|e| e.to_string())?;
    assert!(stored.iter().any(|e| e.event_type() == "registered"));

    h.controller.shutdown().await;
    Ok(())
}
