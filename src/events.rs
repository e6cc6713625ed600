use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// In-process event bus carrying event names (`ticker.1`, `vehicle.charge.start`, ...).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn signal(&self, event: impl Into<String>) {
        // Ignore error - means no listeners
        let _ = self.tx.send(event.into());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}
