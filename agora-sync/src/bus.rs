//! In-process fan-out of [`RoomEvent`]s to any number of subscribers.
//!
//! ```text
//!  supervisor ── publish(event) ──► EventBus
//!                                     │  (subscription order)
//!                     ┌───────────────┼────────────────┐
//!                     ▼               ▼                ▼
//!               HistoryMerger   PresenceTracker   application
//! ```
//!
//! Handlers run synchronously on the publisher's task. The registry lock is
//! never held while a handler runs, so a handler may subscribe or
//! unsubscribe (itself or others) during a publish. A handler unsubscribed
//! mid-publish is not invoked for the rest of that cycle. A panicking handler
//! is logged and skipped; the remaining handlers still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use tokio::sync::mpsc;

use crate::model::RoomEvent;

type Handler = dyn Fn(&RoomEvent) + Send + Sync;

struct Slot {
    id: u64,
    /// Cleared on unsubscribe; checked before every delivery.
    active: AtomicBool,
    handler: Box<Handler>,
}

#[derive(Default)]
struct Registry {
    slots: Vec<Arc<Slot>>,
}

/// Lock-free counters for monitoring bus health.
#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    handler_panics: AtomicU64,
}

/// Snapshot of bus statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Events published since creation.
    pub published: u64,
    /// Handler invocations that panicked.
    pub handler_panics: u64,
    /// Currently registered handlers.
    pub subscribers: usize,
}

struct Inner {
    /// Handlers in subscription order.
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    counters: BusCounters,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Handlers never run under this lock, so poisoning only means a
        // panic inside Vec bookkeeping; the data is still consistent.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: u64) {
        self.registry().slots.retain(|slot| slot.id != id);
    }
}

/// Publish/subscribe registry. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
                counters: BusCounters::default(),
            }),
        }
    }

    /// Register a handler. It receives every event published after this call
    /// until the returned [`Subscription`] is cancelled.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            id,
            active: AtomicBool::new(true),
            handler: Box::new(handler),
        });
        self.inner.registry().slots.push(slot.clone());
        Subscription {
            slot: Arc::downgrade(&slot),
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe through an unbounded channel, for consumers living on
    /// another task.
    ///
    /// Once the receiver is dropped the subscription cancels itself on the
    /// next publish.
    pub fn subscribe_channel(&self) -> (mpsc::UnboundedReceiver<RoomEvent>, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let own: Arc<OnceLock<Subscription>> = Arc::new(OnceLock::new());
        let handle = own.clone();
        let subscription = self.subscribe(move |event| {
            if tx.send(event.clone()).is_err() {
                if let Some(subscription) = handle.get() {
                    subscription.unsubscribe();
                }
            }
        });
        let _ = own.set(subscription.clone());
        (rx, subscription)
    }

    /// Deliver `event` to every current subscriber, in subscription order.
    pub fn publish(&self, event: &RoomEvent) {
        let snapshot: Vec<Arc<Slot>> = self.inner.registry().slots.clone();
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);

        for slot in snapshot {
            if !slot.active.load(Ordering::Acquire) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| (slot.handler)(event)));
            if outcome.is_err() {
                self.inner.counters.handler_panics.fetch_add(1, Ordering::Relaxed);
                log::error!("Event handler {} panicked while handling {event:?}", slot.id);
            }
        }
    }

    /// Number of registered handlers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry().slots.len()
    }

    /// Snapshot of the bus counters.
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.counters.published.load(Ordering::Relaxed),
            handler_panics: self.inner.counters.handler_panics.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Cancellation handle returned by [`EventBus::subscribe`].
///
/// Cancelling is idempotent and safe from inside any handler, including the
/// subscription's own. Dropping the handle does not unsubscribe.
#[derive(Clone)]
pub struct Subscription {
    slot: Weak<Slot>,
    bus: Weak<Inner>,
}

impl Subscription {
    /// Stop delivery to this handler. Takes effect immediately, even for a
    /// publish already in progress.
    pub fn unsubscribe(&self) {
        let Some(slot) = self.slot.upgrade() else {
            return;
        };
        slot.active.store(false, Ordering::Release);
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(slot.id);
        }
    }

    /// Check whether the handler still receives events.
    pub fn is_active(&self) -> bool {
        self.slot
            .upgrade()
            .is_some_and(|slot| slot.active.load(Ordering::Acquire))
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (Arc<StdMutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&RoomEvent) + Send + Sync>) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let log2 = log.clone();
        let make = move |name: &str| -> Box<dyn Fn(&RoomEvent) + Send + Sync> {
            let log = log2.clone();
            let name = name.to_string();
            Box::new(move |_event: &RoomEvent| log.lock().unwrap().push(name.clone()))
        };
        (log, make)
    }

    #[test]
    fn test_publish_in_subscription_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let a = make("a");
        let b = make("b");
        let c = make("c");
        let _sa = bus.subscribe(move |e| a(e));
        let _sb = bus.subscribe(move |e| b(e));
        let _sc = bus.subscribe(move |e| c(e));

        bus.publish(&RoomEvent::Opened);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(bus.subscriber_count(), 3);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let a = make("a");
        let sub = bus.subscribe(move |e| a(e));

        bus.publish(&RoomEvent::Opened);
        sub.unsubscribe();
        sub.unsubscribe();
        bus.publish(&RoomEvent::Opened);

        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(!sub.is_active());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let b = make("b");
        let _sa = bus.subscribe(|_| panic!("handler failure"));
        let _sb = bus.subscribe(move |e| b(e));

        bus.publish(&RoomEvent::Closed);
        bus.publish(&RoomEvent::Closed);

        assert_eq!(*log.lock().unwrap(), vec!["b", "b"]);
        let stats = bus.stats();
        assert_eq!(stats.handler_panics, 2);
        assert_eq!(stats.published, 2);
    }

    #[test]
    fn test_unsubscribe_self_during_publish() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicU64::new(0));
        let slot: Arc<StdMutex<Option<Subscription>>> = Arc::new(StdMutex::new(None));

        let calls2 = calls.clone();
        let slot2 = slot.clone();
        let sub = bus.subscribe(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
            if let Some(me) = slot2.lock().unwrap().as_ref() {
                me.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(sub);

        bus.publish(&RoomEvent::Opened);
        bus.publish(&RoomEvent::Opened);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribe_later_handler_during_publish() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let victim: Arc<StdMutex<Option<Subscription>>> = Arc::new(StdMutex::new(None));

        let victim2 = victim.clone();
        let _killer = bus.subscribe(move |_| {
            if let Some(sub) = victim2.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        });
        let b = make("victim");
        *victim.lock().unwrap() = Some(bus.subscribe(move |e| b(e)));

        bus.publish(&RoomEvent::Opened);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_subscribe_during_publish_takes_effect_next_cycle() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let bus2 = bus.clone();
        let added = Arc::new(AtomicBool::new(false));
        let added2 = added.clone();
        let late = Arc::new(StdMutex::new(Some(make("late"))));

        let _first = bus.subscribe(move |_| {
            if !added2.swap(true, Ordering::SeqCst) {
                if let Some(handler) = late.lock().unwrap().take() {
                    bus2.subscribe(move |e| handler(e));
                }
            }
        });

        bus.publish(&RoomEvent::Opened);
        assert!(log.lock().unwrap().is_empty());
        bus.publish(&RoomEvent::Opened);
        assert_eq!(*log.lock().unwrap(), vec!["late"]);
    }

    #[tokio::test]
    async fn test_subscribe_channel() {
        let bus = EventBus::new();
        let (mut rx, sub) = bus.subscribe_channel();

        bus.publish(&RoomEvent::Opened);
        bus.publish(&RoomEvent::PeerLeft { member_id: "a".into() });
        assert_eq!(rx.recv().await, Some(RoomEvent::Opened));
        assert_eq!(rx.recv().await, Some(RoomEvent::PeerLeft { member_id: "a".into() }));

        sub.unsubscribe();
        bus.publish(&RoomEvent::Closed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_subscription_dropped_receiver_cancels() {
        let bus = EventBus::new();
        let (rx, sub) = bus.subscribe_channel();
        let (_live_rx, _live_sub) = bus.subscribe_channel();
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx);
        bus.publish(&RoomEvent::Opened);

        assert!(!sub.is_active());
        assert_eq!(bus.subscriber_count(), 1);
    }
}
