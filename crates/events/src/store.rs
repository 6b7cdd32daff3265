//! Event store trait and implementations.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::event::SyncEvent;
use crate::types::{AppName, EventId};

/// Trait for event storage backends.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event to the store.
    async fn append(&self, event: SyncEvent) -> Result<EventId>;

    /// Read events after a given event ID, or all retained events.
    async fn read(&self, from: Option<EventId>) -> Result<Vec<SyncEvent>>;

    /// Read events for a specific application.
    async fn read_for_app(&self, app: &AppName) -> Result<Vec<SyncEvent>>;

    /// Get the last event ID.
    async fn last_event_id(&self) -> Result<Option<EventId>>;

    /// Get the number of retained events.
    async fn count(&self) -> Result<usize>;
}

/// Default number of events kept by [`InMemoryEventStore`].
pub const DEFAULT_RETENTION: usize = 10_000;

/// In-memory event store with bounded retention; the oldest events are
/// dropped first.
pub struct InMemoryEventStore {
    events: RwLock<VecDeque<SyncEvent>>,
    retention: usize,
}

impl InMemoryEventStore {
    /// Create a new in-memory event store.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Create a store that keeps at most `retention` events.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            retention: retention.max(1),
        }
    }

    /// Create a new in-memory event store wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: SyncEvent) -> Result<EventId> {
        let event_id = event.event_id();
        let mut events = self.events.write().await;
        events.push_back(event);
        while events.len() > self.retention {
            events.pop_front();
        }
        Ok(event_id)
    }

    async fn read(&self, from: Option<EventId>) -> Result<Vec<SyncEvent>> {
        let events = self.events.read().await;
        let start = from
            .and_then(|id| events.iter().position(|e| e.event_id() == id))
            .map_or(0, |pos| pos.saturating_add(1));
        Ok(events.iter().skip(start).cloned().collect())
    }

    async fn read_for_app(&self, app: &AppName) -> Result<Vec<SyncEvent>> {
        let events = self.events.read().await;
        Ok(events.iter().filter(|e| e.app() == app).cloned().collect())
    }

    async fn last_event_id(&self) -> Result<Option<EventId>> {
        let events = self.events.read().await;
        Ok(events.back().map(SyncEvent::event_id))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.events.read().await.len())
    }
}
