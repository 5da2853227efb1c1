// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use parking_lot::Mutex;
use tracing::{error, trace};

use corral_types::events::ReservationEvent;

use crate::metric_definitions::{EVENTS_DISPATCHED, LISTENER_PANICS};

/// Receives the events of every handle. Listeners pick out the handles they care about.
pub trait ReservationListener: Send + Sync + 'static {
    fn on_event(&self, event: &ReservationEvent);
}

impl<F> ReservationListener for F
where
    F: Fn(&ReservationEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &ReservationEvent) {
        self(event)
    }
}

/// Returned by `add_listener`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("listener-{_0}")]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct Listeners {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ReservationListener>)>>,
}

impl Listeners {
    pub fn add(&self, listener: Arc<dyn ReservationListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands every non-empty event to every listener. A panicking listener doesn't stop the
    /// others from seeing the event.
    ///
    /// Must not be called while holding state locks: listeners are free to call back.
    pub fn dispatch(&self, events: impl IntoIterator<Item = ReservationEvent>) {
        let listeners = self.listeners.lock().clone();

        for event in events {
            if event.is_empty() {
                continue;
            }
            trace!(handle = %event.handle, "Dispatching reservation event");
            counter!(EVENTS_DISPATCHED).increment(1);
            for (id, listener) in &listeners {
                if catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                    counter!(LISTENER_PANICS).increment(1);
                    error!(listener = %id, handle = %event.handle, "Reservation listener panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use corral_test_util::{assert, assert_eq};
    use corral_types::identifiers::{HandleId, ReservationId};

    #[test]
    fn panicking_listener_is_isolated() {
        let listeners = Listeners::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        listeners.add(Arc::new(|_: &ReservationEvent| panic!("boom")));
        let sink = Arc::clone(&seen);
        listeners.add(Arc::new(move |event: &ReservationEvent| {
            sink.lock().push(event.handle)
        }));

        let handle = HandleId::new();
        listeners.dispatch([
            ReservationEvent::new(handle),
            ReservationEvent::rejection(handle, ReservationId::new()),
        ]);

        // the empty event was skipped, the panic didn't stop delivery
        assert_eq!(*seen.lock(), vec![handle]);
    }

    #[test]
    fn remove_by_id() {
        let listeners = Listeners::default();
        let id = listeners.add(Arc::new(|_: &ReservationEvent| {}));
        assert_eq!(listeners.len(), 1);
        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        assert!(listeners.is_empty());
    }
}
