use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Committed events fanned out to the messaging layer, per property and as one firehose.
/// Delivery is best effort: slow receivers lag and drop.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    firehose: broadcast::Sender<(Ulid, Event)>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            firehose: broadcast::channel(CHANNEL_CAPACITY * 4).0,
        }
    }

    /// Subscribe to one property's events. Creates the channel if needed.
    pub fn subscribe(&self, property_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(property_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every property's events.
    pub fn subscribe_all(&self) -> broadcast::Receiver<(Ulid, Event)> {
        self.firehose.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, property_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&property_id) {
            let _ = sender.send(event.clone());
        }
        if self.firehose.receiver_count() > 0 {
            let _ = self.firehose.send((property_id, event.clone()));
        }
    }

    /// Drop a property's channel once its last subscriber is gone.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}
