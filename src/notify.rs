use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-resource broadcast of committed events, for live dashboards.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
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
        }
    }

    /// Subscribe to a resource's events. Creates the channel on first use.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a committed event. No-op without subscribers.
    pub fn send(&self, event: &Event) {
        let Some(resource_id) = event.resource_id() else {
            return;
        };
        let orphaned = match self.channels.get(&resource_id) {
            Some(sender) => sender.send(event.clone()).is_err() && sender.receiver_count() == 0,
            None => false,
        };
        if orphaned {
            // Every subscriber hung up
            self.channels
                .remove_if(&resource_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceStatus;

    fn status_event(id: Ulid) -> Event {
        Event::ResourceStatusChanged {
            id,
            status: ResourceStatus::Maintenance,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_event() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);
        hub.send(&status_event(rid));
        assert_eq!(rx.recv().await.unwrap(), status_event(rid));
    }

    #[tokio::test]
    async fn other_resources_are_not_delivered() {
        let hub = NotifyHub::new();
        let watched = Ulid::new();
        let mut rx = hub.subscribe(watched);
        hub.send(&status_event(Ulid::new()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&status_event(Ulid::new()));
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn channel_dropped_after_last_subscriber_leaves() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let rx = hub.subscribe(rid);
        assert_eq!(hub.channel_count(), 1);
        drop(rx);
        hub.send(&status_event(rid));
        assert_eq!(hub.channel_count(), 0);
    }
}
