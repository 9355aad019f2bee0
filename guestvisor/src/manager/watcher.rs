//! Lifecycle event fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use guestvisor_shared::Event;

/// A subscriber's end of the event stream. Dropping it unsubscribes.
pub struct Watcher {
    id: u64,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Watcher {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the watchers have been stopped.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.events.try_recv().ok()
    }
}

/// Every live subscriber. Publishing never blocks; watchers that went away
/// are reaped on the next publish.
#[derive(Default)]
pub struct Watchers {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Event>>>,
}

impl Watchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&self) -> Watcher {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().insert(id, tx);
        Watcher { id, events: rx }
    }

    pub fn publish(&self, event: &Event) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, tx| {
            let alive = tx.send(event.clone()).is_ok();
            if !alive {
                tracing::debug!(watcher_id = id, "Reaped stopped watcher");
            }
            alive
        });
        tracing::debug!(guest_id = %event.id, action = %event.action, watchers = subscribers.len(), "Published event");
    }

    /// Disconnect every watcher.
    pub fn stop(&self) {
        self.subscribers.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }
}
