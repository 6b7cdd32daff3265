//! Event bus for sync lifecycle events.
//!
//! Every published event is appended to the store first, then fanned out
//! twice: to the firehose that [`EventBus::subscribe`] listens on, and to each
//! pattern subscriber whose filter matches. Pattern subscribers whose
//! receivers have been dropped are pruned on the next publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::SyncEvent;
use crate::store::EventStore;
use crate::types::{AppName, EventId};

/// Default broadcast channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Receiving end of a subscription.
pub struct EventSubscription {
    receiver: broadcast::Receiver<SyncEvent>,
}

impl EventSubscription {
    /// Receive the next event.
    ///
    /// # Errors
    ///
    /// Returns `Lagged` if the subscriber missed events and `ChannelClosed`
    /// once the bus or the pattern registration is gone.
    pub async fn recv(&mut self) -> Result<SyncEvent> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Lagged(skipped) => Error::Lagged { skipped },
            broadcast::error::RecvError::Closed => Error::ChannelClosed,
        })
    }

    /// Try to receive an event without waiting.
    ///
    /// # Errors
    ///
    /// Returns `Empty` when nothing is waiting, plus the errors of
    /// [`Self::recv`].
    pub fn try_recv(&mut self) -> Result<SyncEvent> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => Error::Empty,
            broadcast::error::TryRecvError::Lagged(skipped) => Error::Lagged { skipped },
            broadcast::error::TryRecvError::Closed => Error::ChannelClosed,
        })
    }
}

/// Filter for pattern subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPattern {
    All,
    /// Events of one type, as named by [`SyncEvent::event_type`].
    ByType(String),
    /// Events of any of the named types.
    ByTypes(Vec<String>),
    /// Events concerning one application.
    ByApp(AppName),
    /// Sync outcomes only.
    Terminal,
}

impl EventPattern {
    pub fn matches(&self, event: &SyncEvent) -> bool {
        match self {
            Self::All => true,
            Self::ByType(t) => event.event_type() == t,
            Self::ByTypes(types) => types.iter().any(|t| event.event_type() == t),
            Self::ByApp(app) => event.app() == app,
            Self::Terminal => event.is_terminal(),
        }
    }
}

struct PatternSubscriber {
    pattern: EventPattern,
    sender: broadcast::Sender<SyncEvent>,
}

/// Store-backed pub/sub hub for [`SyncEvent`]s.
pub struct EventBus {
    store: Arc<dyn EventStore>,
    firehose: broadcast::Sender<SyncEvent>,
    subscribers: RwLock<HashMap<String, PatternSubscriber>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl EventBus {
    /// Create a bus over `store` with the default channel capacity.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self::with_capacity(store, DEFAULT_CHANNEL_CAPACITY)
    }

    fn with_capacity(store: Arc<dyn EventStore>, capacity: usize) -> Self {
        let (firehose, _) = broadcast::channel(capacity);
        Self {
            store,
            firehose,
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            capacity,
        }
    }

    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// Store `event`, then deliver it to every interested subscriber.
    ///
    /// # Errors
    ///
    /// Returns the store's error; nothing is delivered in that case.
    pub async fn publish(&self, event: SyncEvent) -> Result<EventId> {
        let event_id = self.store.append(event.clone()).await?;
        debug!(
            event_id = %event_id,
            event_type = event.event_type(),
            app = %event.app(),
            "Publishing event"
        );

        // A firehose without listeners is normal.
        let _ = self.firehose.send(event.clone());

        let mut gone = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, sub) in subscribers.iter() {
                if sub.sender.receiver_count() == 0 {
                    gone.push(id.clone());
                } else if sub.pattern.matches(&event) {
                    let _ = sub.sender.send(event.clone());
                }
            }
        }
        if !gone.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in &gone {
                subscribers.remove(id);
            }
            debug!(pruned = gone.len(), "Removed abandoned subscriptions");
        }

        Ok(event_id)
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.firehose.subscribe(),
        }
    }

    /// Subscribe to events matching `pattern`. The returned id cancels the
    /// subscription through [`Self::unsubscribe`].
    pub async fn subscribe_with_pattern(&self, pattern: EventPattern) -> (String, EventSubscription) {
        let (sender, receiver) = broadcast::channel(self.capacity);
        let id = format!("sub-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .await
            .insert(id.clone(), PatternSubscriber { pattern, sender });
        (id, EventSubscription { receiver })
    }

    /// Drop a pattern subscription. Its receiver then reports `ChannelClosed`.
    pub async fn unsubscribe(&self, subscriber_id: &str) {
        self.subscribers.write().await.remove(subscriber_id);
    }

    /// Number of live pattern subscriptions.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Stored events after `from`, or all retained events for `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn replay_from(&self, from: Option<EventId>) -> Result<Vec<SyncEvent>> {
        self.store.read(from).await
    }

    /// Retained events of one application, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn history(&self, app: &AppName) -> Result<Vec<SyncEvent>> {
        self.store.read_for_app(app).await
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }
}

/// Builder for [`EventBus`].
#[derive(Default)]
pub struct EventBusBuilder {
    store: Option<Arc<dyn EventStore>>,
    capacity: Option<usize>,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Buffer size of each subscription before slow readers lag.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Build the event bus.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` without a store or with a zero capacity.
    pub fn build(self) -> Result<EventBus> {
        let store = self
            .store
            .ok_or_else(|| Error::invalid_config("an event store is required"))?;
        let capacity = self.capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        if capacity == 0 {
            return Err(Error::invalid_config("channel capacity must be positive"));
        }
        Ok(EventBus::with_capacity(store, capacity))
    }
}
