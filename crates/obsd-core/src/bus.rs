use tokio::sync::broadcast;

use crate::events::BusEvent;

/// Sink for normalized session events. The publish/subscribe bus that fans
/// these out to other subsystems lives outside this workspace; sessions only
/// need somewhere to put events.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: BusEvent);
}

/// In-process bus backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<BusEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, event: BusEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("no bus subscribers, event dropped");
        }
    }
}
