//! End-to-end tests for the event store and bus.
//!
//! These tests validate that:
//! - Published events are stored in order and replayable
//! - Pattern subscribers see only matching events
//! - Retention bounds the store without breaking per-app reads
//! - Events serialize with their variant name and survive a JSON round trip

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use keel_events::{
    AppName, Error, ErrorKind, EventBus, EventBusBuilder, EventPattern, EventStore, HealthStatus,
    InMemoryEventStore, OperationId, Revision, SyncEvent, SyncPhase, TriggerCause,
};

// ==========================================================================
// TEST HELPERS
// ==========================================================================

fn bus_with(store: Arc<InMemoryEventStore>) -> EventBus {
    EventBus::new(store)
}

fn lifecycle(app: &str) -> Vec<SyncEvent> {
    let app = AppName::from(app);
    let op = OperationId::new();
    vec![
        SyncEvent::phase_changed(app.clone(), SyncPhase::Idle, SyncPhase::Queued),
        SyncEvent::phase_changed(app.clone(), SyncPhase::Queued, SyncPhase::Syncing),
        SyncEvent::sync_started(app.clone(), op.clone(), TriggerCause::Manual),
        SyncEvent::sync_succeeded(app.clone(), op, Revision::new("rev-1"), 3),
        SyncEvent::phase_changed(app, SyncPhase::Syncing, SyncPhase::Idle),
    ]
}

async fn next_within(
    sub: &mut keel_events::EventSubscription,
) -> Result<SyncEvent, String> {
    tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .map_err(|_| "timed out waiting for event".to_string())?
        .map_err(|e| format!("subscription failed: {e}"))
}

// ==========================================================================
// BUS AND STORE
// ==========================================================================

#[tokio::test]
async fn given_sync_lifecycle_when_published_then_store_replays_in_order() -> Result<(), String> {
    let store = InMemoryEventStore::new_arc();
    let bus = bus_with(Arc::clone(&store));
    let mut sub = bus.subscribe();

    for event in lifecycle("guestbook") {
        bus.publish(event).await.map_err(|e| e.to_string())?;
    }

    let types: Vec<&str> = bus
        .replay_from(None)
        .await
        .map_err(|e| e.to_string())?
        .iter()
        .map(SyncEvent::event_type)
        .collect();
    assert_eq!(
        types,
        vec![
            "phase_changed",
            "phase_changed",
            "sync_started",
            "sync_succeeded",
            "phase_changed"
        ]
    );

    let first = next_within(&mut sub).await?;
    assert_eq!(first.event_type(), "phase_changed");
    Ok(())
}

#[tokio::test]
async fn given_replay_cursor_when_reading_then_only_later_events_returned() -> Result<(), String> {
    let store = InMemoryEventStore::new_arc();
    let bus = bus_with(Arc::clone(&store));

    let events = lifecycle("guestbook");
    let mut ids = Vec::new();
    for event in events {
        ids.push(bus.publish(event).await.map_err(|e| e.to_string())?);
    }
    let cursor = ids.get(2).cloned().ok_or("missing id")?;

    let later = bus.replay_from(Some(cursor)).await.map_err(|e| e.to_string())?;

    assert_eq!(later.len(), 2);
    assert_eq!(later.first().map(SyncEvent::event_type), Some("sync_succeeded"));
    Ok(())
}

#[tokio::test]
async fn given_two_apps_when_subscribed_by_app_then_other_app_is_filtered() -> Result<(), String> {
    let bus = bus_with(InMemoryEventStore::new_arc());
    let (_id, mut sub) = bus
        .subscribe_with_pattern(EventPattern::ByApp(AppName::from("billing")))
        .await;

    bus.publish(SyncEvent::registered(AppName::from("guestbook")))
        .await
        .map_err(|e| e.to_string())?;
    bus.publish(SyncEvent::registered(AppName::from("billing")))
        .await
        .map_err(|e| e.to_string())?;

    let event = next_within(&mut sub).await?;
    assert_eq!(event.app().as_str(), "billing");
    assert!(matches!(sub.try_recv(), Err(Error::Empty)));
    Ok(())
}

#[tokio::test]
async fn given_terminal_type_pattern_when_lifecycle_published_then_only_outcomes_seen(
) -> Result<(), String> {
    let bus = bus_with(InMemoryEventStore::new_arc());
    let (_id, mut sub) = bus
        .subscribe_with_pattern(EventPattern::ByTypes(vec![
            "sync_succeeded".to_string(),
            "sync_failed".to_string(),
        ]))
        .await;

    for event in lifecycle("guestbook") {
        bus.publish(event).await.map_err(|e| e.to_string())?;
    }
    bus.publish(SyncEvent::sync_failed(
        AppName::from("guestbook"),
        OperationId::new(),
        None,
        ErrorKind::SourceUnreachable,
        "connection refused",
    ))
    .await
    .map_err(|e| e.to_string())?;

    let succeeded = next_within(&mut sub).await?;
    let failed = next_within(&mut sub).await?;
    assert!(succeeded.is_terminal() && failed.is_terminal());
    assert_eq!(failed.event_type(), "sync_failed");
    assert!(matches!(sub.try_recv(), Err(Error::Empty)));
    Ok(())
}

#[tokio::test]
async fn given_unsubscribed_pattern_when_published_then_nothing_delivered() -> Result<(), String> {
    let bus = bus_with(InMemoryEventStore::new_arc());
    let (id, mut sub) = bus.subscribe_with_pattern(EventPattern::All).await;

    bus.unsubscribe(&id).await;
    bus.publish(SyncEvent::registered(AppName::from("guestbook")))
        .await
        .map_err(|e| e.to_string())?;

    assert!(matches!(sub.try_recv(), Err(Error::ChannelClosed)));
    Ok(())
}

#[tokio::test]
async fn given_bounded_retention_when_overflowing_then_per_app_reads_see_survivors(
) -> Result<(), String> {
    let store = Arc::new(InMemoryEventStore::with_retention(4));
    let bus = bus_with(Arc::clone(&store));

    for event in lifecycle("guestbook") {
        bus.publish(event).await.map_err(|e| e.to_string())?;
    }
    bus.publish(SyncEvent::health_changed(
        AppName::from("billing"),
        HealthStatus::Missing,
        HealthStatus::Healthy,
    ))
    .await
    .map_err(|e| e.to_string())?;

    assert_eq!(store.count().await.map_err(|e| e.to_string())?, 4);
    let guestbook = store
        .read_for_app(&AppName::from("guestbook"))
        .await
        .map_err(|e| e.to_string())?;
    assert_eq!(guestbook.len(), 3);
    let billing = store
        .read_for_app(&AppName::from("billing"))
        .await
        .map_err(|e| e.to_string())?;
    assert_eq!(billing.len(), 1);
    Ok(())
}

#[test]
fn given_builder_without_store_when_built_then_error() {
    assert!(EventBusBuilder::new().build().is_err());
    assert!(EventBusBuilder::new()
        .with_store(InMemoryEventStore::new_arc())
        .with_channel_capacity(0)
        .build()
        .is_err());
}

// ==========================================================================
// SERIALIZATION
// ==========================================================================

#[test]
fn given_failed_sync_when_serialized_then_variant_and_cause_survive() -> Result<(), String> {
    let event = SyncEvent::sync_failed(
        AppName::from("guestbook"),
        OperationId::new(),
        Some(Revision::new("rev-9")),
        ErrorKind::ValidationRejected,
        "spec.replicas: must be >= 0",
    );

    let json = serde_json::to_string(&event).map_err(|e| e.to_string())?;
    assert!(json.contains("SyncFailed"), "missing variant name: {json}");

    let back: SyncEvent = serde_json::from_str(&json).map_err(|e| e.to_string())?;
    assert_eq!(back.event_id(), event.event_id());
    match back {
        SyncEvent::SyncFailed {
            cause, revision, ..
        } => {
            assert_eq!(cause, ErrorKind::ValidationRejected);
            assert_eq!(revision, Some(Revision::new("rev-9")));
            Ok(())
        }
        other => Err(format!("unexpected variant {}", other.event_type())),
    }
}
