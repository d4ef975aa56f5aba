//! Lifecycle event bus.
//!
//! Publishing is non-blocking: each subscriber has a bounded buffer, and
//! when it is full the **oldest** buffered event is dropped to make room
//! (bounded-drop). Drops are counted per subscriber and logged, but never
//! slow the dispatcher down. A slow subscriber only loses its own events.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

use crate::domain::{EventKind, JobEvent};

/// Per-subscriber buffer. Locked only for short, await-free sections.
struct SubscriberState {
    buf: VecDeque<JobEvent>,
    dropped: u64,
    closed: bool,
}

struct Subscriber {
    /// Empty means "all kinds".
    kinds: Vec<EventKind>,
    state: Arc<Mutex<SubscriberState>>,
    notify: Arc<Notify>,
}

impl Subscriber {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// Fan-out bus for job lifecycle events.
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl EventBus {
    /// `capacity` bounds each subscriber's buffer.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to the given event kinds (empty slice = every kind).
    ///
    /// Returns the receiving end and a cancellation handle. Dropping the
    /// handle unsubscribes; `cancel` may also be called explicitly and is
    /// idempotent.
    pub fn subscribe(
        self: &Arc<Self>,
        kinds: &[EventKind],
    ) -> (Subscription, SubscriptionHandle) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(Mutex::new(SubscriberState {
            buf: VecDeque::new(),
            dropped: 0,
            closed: false,
        }));
        let notify = Arc::new(Notify::new());

        let subscriber = Subscriber {
            kinds: kinds.to_vec(),
            state: Arc::clone(&state),
            notify: Arc::clone(&notify),
        };
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, subscriber);

        let subscription = Subscription {
            state: Arc::clone(&state),
            notify: Arc::clone(&notify),
        };
        let handle = SubscriptionHandle {
            id,
            bus: Arc::clone(self),
            state,
            notify,
            cancelled: false,
        };
        (subscription, handle)
    }

    /// Deliver an event to every matching subscriber. Never blocks.
    pub fn publish(&self, event: &JobEvent) {
        let subscribers = self.subscribers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for subscriber in subscribers.values() {
            if !subscriber.wants(event.kind) {
                continue;
            }
            let mut state = subscriber
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if state.buf.len() >= self.capacity {
                state.buf.pop_front();
                state.dropped += 1;
                warn!(
                    job_id = %event.job.id,
                    dropped = state.dropped,
                    "subscriber buffer full, dropping oldest event"
                );
            }
            state.buf.push_back(event.clone());
            drop(state);
            subscriber.notify.notify_one();
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&id);
    }
}

/// Receiving end of a subscription.
pub struct Subscription {
    state: Arc<Mutex<SubscriberState>>,
    notify: Arc<Notify>,
}

impl Subscription {
    /// Next event, in delivery order. `None` once the subscription is
    /// cancelled and the buffer is drained.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(event) = state.buf.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            // notify_one stores a permit, so a push between the unlock
            // above and this await is not lost.
            self.notify.notified().await;
        }
    }

    /// Events dropped for this subscriber so far.
    pub fn dropped(&self) -> u64 {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).dropped
    }
}

/// Cancels its subscription when dropped (or explicitly).
pub struct SubscriptionHandle {
    id: u64,
    bus: Arc<EventBus>,
    state: Arc<Mutex<SubscriberState>>,
    notify: Arc<Notify>,
    cancelled: bool,
}

impl SubscriptionHandle {
    /// Unsubscribe. Idempotent; pending `recv` calls return `None` once
    /// the buffer is drained.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.bus.unsubscribe(self.id);
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .closed = true;
        self.notify.notify_one();
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, NewJob};
    use chrono::Utc;
    use serde_json::json;

    fn event(kind: EventKind) -> JobEvent {
        let row = NewJob::new("test", json!({})).into_row(JobId::generate(), Utc::now());
        JobEvent::new(kind, row)
    }

    #[tokio::test]
    async fn delivers_matching_kinds_only() {
        let bus = Arc::new(EventBus::new(16));
        let (mut sub, _handle) = bus.subscribe(&[EventKind::Completed]);

        bus.publish(&event(EventKind::Failed));
        bus.publish(&event(EventKind::Completed));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::Completed);
    }

    #[tokio::test]
    async fn empty_filter_receives_everything() {
        let bus = Arc::new(EventBus::new(16));
        let (mut sub, _handle) = bus.subscribe(&[]);

        bus.publish(&event(EventKind::Failed));
        bus.publish(&event(EventKind::Discarded));

        assert_eq!(sub.recv().await.unwrap().kind, EventKind::Failed);
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::Discarded);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let bus = Arc::new(EventBus::new(2));
        let (mut sub, _handle) = bus.subscribe(&[]);

        bus.publish(&event(EventKind::Completed));
        bus.publish(&event(EventKind::Failed));
        bus.publish(&event(EventKind::Discarded));

        // The oldest (Completed) was dropped.
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::Failed);
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::Discarded);
        assert_eq!(sub.dropped(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_affect_others() {
        let bus = Arc::new(EventBus::new(1));
        let (mut slow, _h1) = bus.subscribe(&[]);
        let (mut fast, _h2) = bus.subscribe(&[]);

        bus.publish(&event(EventKind::Completed));
        assert_eq!(fast.recv().await.unwrap().kind, EventKind::Completed);

        // slow never drained; next publish drops its oldest, not fast's.
        bus.publish(&event(EventKind::Failed));
        assert_eq!(fast.recv().await.unwrap().kind, EventKind::Failed);
        assert_eq!(slow.recv().await.unwrap().kind, EventKind::Failed);
        assert_eq!(slow.dropped(), 1);
        assert_eq!(fast.dropped(), 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_ends_recv() {
        let bus = Arc::new(EventBus::new(16));
        let (mut sub, mut handle) = bus.subscribe(&[]);

        bus.publish(&event(EventKind::Completed));
        handle.cancel();
        handle.cancel();

        // Buffered events still drain, then the stream ends.
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());

        // Publishing after cancel goes nowhere.
        bus.publish(&event(EventKind::Failed));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_handle_unsubscribes() {
        let bus = Arc::new(EventBus::new(16));
        let (mut sub, handle) = bus.subscribe(&[]);
        drop(handle);

        assert!(sub.recv().await.is_none());
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }
}
