//! Notification consumers.

use std::sync::{Arc, Weak};

use notify_protocol::PushMessage;
use parking_lot::RwLock;
use tokio::sync::mpsc;

/// Receives every push that parsed as JSON (the UI banner, in the dashboard).
pub trait NotificationSink: Send + Sync {
    fn show_notification(&self, message: &PushMessage);
}

/// Forward pushes into a channel.
impl NotificationSink for mpsc::UnboundedSender<PushMessage> {
    fn show_notification(&self, message: &PushMessage) {
        let _ = self.send(message.clone());
    }
}

/// Weak reference to the registered sink, shared by the channel handle
/// (which replaces it) and the channel task (which reads it).
#[derive(Clone, Default)]
pub(crate) struct SinkSlot(Arc<RwLock<Option<Weak<dyn NotificationSink>>>>);

impl SinkSlot {
    pub fn set(&self, sink: Weak<dyn NotificationSink>) {
        *self.0.write() = Some(sink);
    }

    pub fn clear(&self) {
        *self.0.write() = None;
    }

    /// The sink, if one is registered and still alive.
    pub fn get(&self) -> Option<Arc<dyn NotificationSink>> {
        self.0.read().as_ref().and_then(Weak::upgrade)
    }
}
