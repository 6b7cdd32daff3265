//! Notification sinks for sync outcomes.

use async_trait::async_trait;
use keel_events::SyncEvent;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Receives terminal sync events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Deliver one event. Delivery failures are the sink's own concern.
    async fn notify(&self, event: &SyncEvent);
}

/// Logs sync outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn notify(&self, event: &SyncEvent) {
        match event {
            SyncEvent::SyncSucceeded {
                app,
                revision,
                applied,
                ..
            } => info!(app = %app, %revision, applied, "Sync succeeded"),
            SyncEvent::SyncFailed {
                app,
                cause,
                message,
                ..
            } => error!(app = %app, %cause, message = %message, "Sync failed"),
            SyncEvent::AutosyncSuspended { app, reason, .. } => {
                warn!(app = %app, reason = %reason, "Automated sync suspended");
            }
            other => info!(app = %other.app(), event = other.event_type(), "Sync event"),
        }
    }
}

/// Forwards events into an mpsc channel without blocking; events are
/// dropped while the channel is full.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<SyncEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    async fn notify(&self, event: &SyncEvent) {
        if let Err(e) = self.sender.try_send(event.clone()) {
            warn!(sink = self.name(), error = %e, "Dropped notification");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use keel_events::{AppName, OperationId, Revision};

    fn succeeded() -> SyncEvent {
        SyncEvent::sync_succeeded(
            AppName::from("guestbook"),
            OperationId::new(),
            Revision::from("abc123"),
            2,
        )
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.notify(&succeeded()).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "sync_succeeded");
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.notify(&succeeded()).await;
        sink.notify(&succeeded()).await;
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_every_event() {
        let sink = TracingSink;
        sink.notify(&succeeded()).await;
        sink.notify(&SyncEvent::registered(AppName::from("guestbook")))
            .await;
        assert_eq!(sink.name(), "tracing");
    }
}
