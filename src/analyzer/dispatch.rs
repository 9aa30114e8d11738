/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Fans decoded server events out to subscribers by event name.
//!
//! Delivery happens on a worker task fed by a bounded queue, never on the
//! reader task itself. Each callback runs in isolation: one panicking
//! subscriber is logged and the rest still get the event.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace};

use super::protocol::Event;

/// Opaque handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    callback: Callback,
}

/// Event-name to subscriber-set registry.
#[derive(Default)]
pub struct EventDispatcher {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for events named `event`. The returned id is
    /// unique per call, even for identical callbacks.
    pub fn subscribe<F>(&self, event: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscribers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });
        id
    }

    /// Remove one subscription without affecting others. Returns whether the
    /// id was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        for entries in subscribers.values_mut() {
            if let Some(pos) = entries.iter().position(|s| s.id == id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    /// Number of subscribers for an event name.
    #[must_use]
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers.lock().get(event).map_or(0, Vec::len)
    }

    /// Invoke every callback registered for `event.event`.
    ///
    /// Callbacks are snapshotted first so a subscriber that (un)subscribes
    /// from inside its own callback cannot deadlock the registry.
    pub fn dispatch(&self, event: &Event) {
        let callbacks: Vec<Callback> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .get(&event.event)
                .map(|entries| entries.iter().map(|s| Arc::clone(&s.callback)).collect())
                .unwrap_or_default()
        };

        if callbacks.is_empty() {
            trace!("no subscribers for event '{}'", event.event);
            return;
        }

        for callback in callbacks {
            // One broken subscriber must not poison the others.
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!("subscriber for '{}' panicked; continuing", event.event);
            }
        }
    }

    /// Start the delivery worker draining the bounded event queue.
    pub fn spawn_worker(self: &Arc<Self>, mut events: mpsc::Receiver<Event>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                dispatcher.dispatch(&event);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn event(name: &str) -> Event {
        Event {
            seq: None,
            event: name.to_string(),
            body: Some(serde_json::json!({"n": 1})),
        }
    }

    #[test]
    fn test_dispatch_reaches_all_subscribers_of_name() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            dispatcher.subscribe("telemetry", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        let other_hits = Arc::new(AtomicUsize::new(0));
        {
            let other_hits = Arc::clone(&other_hits);
            dispatcher.subscribe("ready", move |_| {
                other_hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        dispatcher.dispatch(&event("telemetry"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(other_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_callback() {
        let dispatcher = EventDispatcher::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let first_id = {
            let first = Arc::clone(&first);
            dispatcher.subscribe("telemetry", move |_| {
                first.fetch_add(1, Ordering::SeqCst);
            })
        };
        {
            let second = Arc::clone(&second);
            dispatcher.subscribe("telemetry", move |_| {
                second.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(dispatcher.unsubscribe(first_id));
        assert!(!dispatcher.unsubscribe(first_id));

        dispatcher.dispatch(&event("telemetry"));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_ids_are_unique() {
        let dispatcher = EventDispatcher::new();
        let a = dispatcher.subscribe("x", |_| {});
        let b = dispatcher.subscribe("x", |_| {});
        let c = dispatcher.subscribe("y", |_| {});
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(dispatcher.subscriber_count("x"), 2);
    }

    #[test]
    #[allow(clippy::panic, reason = "simulates a buggy subscriber")]
    fn test_panicking_subscriber_is_isolated() {
        let dispatcher = EventDispatcher::new();
        let survivor = Arc::new(AtomicUsize::new(0));

        dispatcher.subscribe("telemetry", |_| {
            panic!("subscriber exploded");
        });
        {
            let survivor = Arc::clone(&survivor);
            dispatcher.subscribe("telemetry", move |_| {
                survivor.fetch_add(1, Ordering::SeqCst);
            });
        }

        dispatcher.dispatch(&event("telemetry"));
        dispatcher.dispatch(&event("telemetry"));
        assert_eq!(survivor.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dispatch_with_no_subscribers_is_noop() {
        let dispatcher = EventDispatcher::new();
        dispatcher.dispatch(&event("nobody-listens"));
    }

    #[tokio::test]
    async fn test_worker_delivers_off_queue() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            dispatcher.subscribe("telemetry", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        let (tx, rx) = mpsc::channel(8);
        let worker = dispatcher.spawn_worker(rx);

        for _ in 0..4 {
            let _ = tx.send(event("telemetry")).await;
        }
        drop(tx);
        let _ = worker.await;

        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_unsubscribe_from_within_callback_does_not_deadlock() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let inner = Arc::clone(&dispatcher);
        let id_slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&id_slot);

        let id = dispatcher.subscribe("once", move |_| {
            if let Some(id) = slot.lock().take() {
                inner.unsubscribe(id);
            }
        });
        *id_slot.lock() = Some(id);

        dispatcher.dispatch(&event("once"));
        dispatcher.dispatch(&event("once"));
        assert_eq!(dispatcher.subscriber_count("once"), 0);
    }
}
