//! Durable event handlers.
//!
//! Handlers live in the registry, not on the physical link, so every handler
//! registered once keeps firing across reconnects. Each event name holds any
//! number of independent handlers; registering one never replaces another.

use super::lock;
use super::protocol::Envelope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventRegistry {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes one handler. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.lock();
        let mut removed = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(sub, _)| *sub != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Invokes every handler of the frame's event in registration order.
    ///
    /// The handler list is copied out first, so handlers may subscribe or
    /// unsubscribe while being dispatched. Returns how many handlers ran.
    pub fn dispatch(&self, frame: &Envelope) -> usize {
        let handlers: Vec<Handler> = match self.lock().get(&frame.event) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };
        for handler in &handlers {
            handler(frame);
        }
        handlers.len()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.lock().get(event).map_or(0, Vec::len)
    }

    /// Every registered subscription, ordered by event then id.
    pub fn subscriptions(&self) -> Vec<(String, SubscriptionId)> {
        let mut all: Vec<(String, SubscriptionId)> = self
            .lock()
            .iter()
            .flat_map(|(event, list)| list.iter().map(move |(id, _)| (event.clone(), *id)))
            .collect();
        all.sort();
        all
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(SubscriptionId, Handler)>>> {
        lock(&self.handlers)
    }
}
