use std::collections::HashMap;

use shared::protocol::{EventName, InboundEvent};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type Handler = Box<dyn FnMut(&InboundEvent) + Send>;

/// Named-event fan-out. Handlers for one name run in registration order;
/// late subscribers see only events dispatched after they registered.
#[derive(Default)]
pub struct EventRouter {
    next_id: u64,
    handlers: HashMap<EventName, Vec<(SubscriptionId, Handler)>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, name: EventName, handler: F) -> SubscriptionId
    where
        F: FnMut(&InboundEvent) + Send + 'static,
    {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.handlers
            .entry(name)
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    /// Removes every handler registered for `name`.
    pub fn unsubscribe(&mut self, name: &EventName) -> usize {
        self.handlers
            .remove(name)
            .map(|removed| removed.len())
            .unwrap_or(0)
    }

    pub fn unsubscribe_handler(&mut self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.handlers.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(handler_id, _)| *handler_id != id);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        removed
    }

    pub fn subscriber_count(&self, name: &EventName) -> usize {
        self.handlers.get(name).map(Vec::len).unwrap_or(0)
    }

    /// Returns how many handlers ran.
    pub fn dispatch(&mut self, event: &InboundEvent) -> usize {
        let name = event.name();
        let Some(handlers) = self.handlers.get_mut(&name) else {
            trace!(event = %name, "no subscribers");
            return 0;
        };
        for (_, handler) in handlers.iter_mut() {
            handler(event);
        }
        handlers.len()
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
