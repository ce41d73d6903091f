use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use crate::types::NotificationEvent;

/// Sink for structured notification events. Formatting and delivery live
/// outside the engine.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotificationEvent) -> anyhow::Result<()>;
}

/// Forwards events over an mpsc channel to an external delivery loop.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<NotificationEvent>,
}

impl ChannelNotifier {
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, event: NotificationEvent) -> anyhow::Result<()> {
        // A closed receiver means the delivery loop is gone; events are
        // transient so this is not fatal.
        let _ = self.tx.send(event);
        Ok(())
    }
}

/// Logs events and drops them. Used when no delivery loop is configured.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: NotificationEvent) -> anyhow::Result<()> {
        info!(kind = ?event.kind, request_id = ?event.request_id, "notification");
        Ok(())
    }
}

/// Collects events in memory so tests can assert on them.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().expect("notifier lock poisoned").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: NotificationEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .expect("notifier lock poisoned")
            .push(event);
        Ok(())
    }
}
