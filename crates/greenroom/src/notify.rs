//! Notification fan-out.
//!
//! Supervisors and graphs publish through a shared sink; the daemon wires
//! it to a broadcast channel that the transport drains.

use std::sync::{Arc, Mutex};

use greenproto::Notification;
use tokio::sync::broadcast;

/// Trait for publishing notifications to peers
pub trait NotificationSink: Send + Sync {
    fn publish(&self, notification: Notification);
}

/// Drops everything. Used when nobody listens.
pub struct NoOpSink;

impl NotificationSink for NoOpSink {
    fn publish(&self, _notification: Notification) {}
}

/// Publishes onto a tokio broadcast channel.
///
/// Send errors only mean there are no subscribers right now.
pub struct BroadcastSink {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn publish(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}

/// Keeps every notification in memory, in publish order.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn take(&self) -> Vec<Notification> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }
}

impl NotificationSink for RecordingSink {
    fn publish(&self, notification: Notification) {
        if let Ok(mut events) = self.events.lock() {
            events.push(notification);
        }
    }
}

pub type SharedSink = Arc<dyn NotificationSink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_sink_without_subscribers_is_silent() {
        let sink = BroadcastSink::new(4);
        sink.publish(Notification::StudioStarted);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_in_order() {
        let sink = BroadcastSink::new(4);
        let mut rx = sink.subscribe();
        sink.publish(Notification::StudioStarted);
        sink.publish(Notification::StudioStopped);

        assert_eq!(rx.recv().await.unwrap(), Notification::StudioStarted);
        assert_eq!(rx.recv().await.unwrap(), Notification::StudioStopped);
    }

    #[test]
    fn test_recording_sink_take_drains() {
        let sink = RecordingSink::new();
        sink.publish(Notification::StudioStarted);
        assert_eq!(sink.take().len(), 1);
        assert!(sink.events().is_empty());
    }
}
