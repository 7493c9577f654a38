use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, PoisonError, RwLock},
};

use tracing::{error, warn};

use crate::events::{ChatEvent, EventKind};

pub type EventHandler = Arc<dyn Fn(&ChatEvent) -> anyhow::Result<()> + Send + Sync>;

/// Outcome of one publish: how many subscribers ran cleanly and how many failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Typed publish/subscribe hub. Dispatch is synchronous, in subscription order.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind`. Returns `false` if it was already registered.
    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> bool {
        let mut guard = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let handlers = guard.entry(kind).or_default();
        if handlers.iter().any(|existing| Arc::ptr_eq(existing, &handler)) {
            return false;
        }
        handlers.push(handler);
        true
    }

    pub fn subscribe_all(&self, handler: EventHandler) {
        for kind in EventKind::ALL {
            self.subscribe(kind, Arc::clone(&handler));
        }
    }

    /// Removes `handler` from `kind`. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, kind: EventKind, handler: &EventHandler) -> bool {
        let mut guard = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(handlers) = guard.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|existing| !Arc::ptr_eq(existing, handler));
        before != handlers.len()
    }

    pub fn unsubscribe_all(&self, handler: &EventHandler) {
        for kind in EventKind::ALL {
            self.unsubscribe(kind, handler);
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    pub fn publish(&self, event: &ChatEvent) -> PublishReport {
        let kind = event.kind();
        // Snapshot so handlers may (un)subscribe while we dispatch.
        let handlers: Vec<EventHandler> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut report = PublishReport::default();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(?kind, error = %err, "event handler failed");
                }
                Err(_) => {
                    report.failed += 1;
                    error!(?kind, "event handler panicked");
                }
            }
        }
        report
    }
}

#[cfg(test)]
#[path = "tests/event_bus_tests.rs"]
mod tests;
