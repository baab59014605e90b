use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Post-commit hook: broadcasts each committed reservation event to whoever
/// watches the vehicle it touched.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to committed events for a vehicle. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, resource_id: Ulid, event: &Event) {
        let Some(sender) = self.channels.get(&resource_id) else {
            return;
        };
        if sender.send(event.clone()).is_err() {
            drop(sender);
            // Every receiver is gone.
            self.channels
                .remove_if(&resource_id, |_, s| s.receiver_count() == 0);
        }
    }

    pub fn watched(&self) -> usize {
        self.channels.len()
    }
}
