use presence_api::ServerEvent;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 100;

/// Broadcasts server events to every connected realtime client.
#[derive(Clone)]
pub struct Fanout {
    tx: broadcast::Sender<ServerEvent>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Send to all current subscribers. Returns how many received it.
    pub fn publish(&self, event: ServerEvent) -> usize {
        // no subscribers is not an error
        let delivered = self.tx.send(event).unwrap_or(0);
        tracing::debug!(delivered, "fan-out");
        delivered
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn every_subscriber_gets_each_event() {
        let fanout = Fanout::new();
        assert_eq!(fanout.publish(ServerEvent::Offline { user_id: Uuid::nil() }), 0);
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();
        let ev = ServerEvent::Offline {
            user_id: Uuid::new_v4(),
        };
        assert_eq!(fanout.publish(ev.clone()), 2);
        assert_eq!(a.recv().await.unwrap(), ev);
        assert_eq!(b.recv().await.unwrap(), ev);
    }
}
