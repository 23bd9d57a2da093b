// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process publish/subscribe keyed by event type.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::{EventKind, ServerEvent};

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Fan-out of decoded server events to registered handlers.
///
/// Handlers for one kind run synchronously in registration order. A handler
/// that panics is logged and skipped; the remaining handlers still run.
/// Subscribing or unsubscribing from inside a handler is allowed and takes
/// effect on the next emit.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().entry(kind).or_default().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` when it was not registered.
    pub fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    /// Deliver `event` to every handler registered for its kind.
    ///
    /// Returns the number of handlers that completed without panicking.
    pub fn emit(&self, event: &ServerEvent) -> usize {
        let kind = event.kind();
        // Snapshot so handlers can call back into the bus without deadlocking.
        let snapshot: Vec<(SubscriptionId, Handler)> =
            self.handlers.lock().get(&kind).cloned().unwrap_or_default();

        let mut delivered = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::error!(event = %kind, subscription = id.0, "event handler panicked");
                }
            }
        }
        delivered
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.handlers.lock().clear();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.lock();
        let mut counts: Vec<(EventKind, usize)> =
            handlers.iter().map(|(k, v)| (*k, v.len())).collect();
        counts.sort();
        f.debug_struct("EventBus").field("handlers", &counts).finish()
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
