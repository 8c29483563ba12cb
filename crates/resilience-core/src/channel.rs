use tokio::sync::broadcast;

use crate::types::{Notice, ResilienceEvent};

/// Broadcast event stream type used by UI subscribers.
pub type EventStream = broadcast::Receiver<ResilienceEvent>;

/// Fan-out channel for notifications and mode changes.
#[derive(Clone, Debug)]
pub struct Notifier {
    event_tx: broadcast::Sender<ResilienceEvent>,
}

impl Notifier {
    /// Create a notifier retaining up to `event_buffer` undelivered events per subscriber.
    pub fn new(event_buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to emitted events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: ResilienceEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn notice(&self, notice: Notice) {
        self.emit(ResilienceEvent::Notice(notice));
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}
