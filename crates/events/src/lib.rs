//! Sync lifecycle events for keel.
//!
//! - **Types**: identifiers and the status enums shared with the engine
//! - **Events**: every observable step of an application's lifecycle
//! - **Event store**: append-only, bounded retention
//! - **Event bus**: pub/sub with pattern filtering
//!
//! # Example
//!
//! ```ignore
//! use keel_events::{AppName, EventBus, InMemoryEventStore, SyncEvent};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = EventBus::new(Arc::new(InMemoryEventStore::new()));
//!     let mut sub = bus.subscribe();
//!
//!     bus.publish(SyncEvent::registered(AppName::from("guestbook"))).await.ok();
//!
//!     if let Ok(event) = sub.recv().await {
//!         println!("Received: {}", event.event_type());
//!     }
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod bus;
pub mod error;
pub mod event;
pub mod store;
pub mod types;

pub use bus::{EventBus, EventBusBuilder, EventPattern, EventSubscription};
pub use error::{Error, Result};
pub use event::SyncEvent;
pub use store::{EventStore, InMemoryEventStore};
pub use types::{
    AppName, ErrorKind, EventId, HealthStatus, OperationId, Revision, SyncPhase, SyncStatus,
    TriggerCause,
};
