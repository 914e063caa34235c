//! In-process pub/sub event bus with bounded, independent per-subscriber
//! queues. Slow subscribers lose their oldest buffered events rather than
//! blocking publishers — see `EventBus::publish`.

mod event;

pub use event::Event;

use quorum_core::{CoreError, ErrorCode};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// Default bounded capacity for a subscriber's queue (see §4.A).
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Opaque subscription handle returned by `EventBus::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

/// The receive half of a subscription. Dropping it does not unsubscribe —
/// call `EventBus::unsubscribe` explicitly (mirrors the bus, not the
/// receiver, owning subscriber lifetime per the data-model ownership rule).
pub struct Receiver {
    inner: Arc<Subscriber>,
}

impl Receiver {
    /// Await the next event, or `None` once the bus is closed and this
    /// subscriber's queue has drained.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            {
                let mut q = self.inner.queue.lock().await;
                if let Some(event) = q.pop_front() {
                    return Some(event);
                }
                if self.inner.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Count of events dropped for this subscriber due to a full queue.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Acquire)
    }
}

/// Backpressured, fan-out event bus. One process-wide instance is created
/// at startup and passed by reference into components (see Design Notes:
/// the rate-limit registry and the event bus are the two process-wide
/// singletons).
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, Arc<Subscriber>>>,
    next_id: AtomicU64,
    capacity: usize,
    closed: AtomicBool,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Register a new subscriber with a bounded, independent queue.
    pub async fn subscribe(&self) -> (SubscriptionId, Receiver) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(Subscriber {
            queue: Mutex::new(VecDeque::with_capacity(self.capacity.min(16))),
            capacity: self.capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(self.closed.load(Ordering::Acquire)),
        });
        self.subscribers.lock().await.insert(id, inner.clone());
        (SubscriptionId(id), Receiver { inner })
    }

    /// Idempotent: unsubscribing an unknown or already-removed id is a no-op.
    pub async fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(sub) = self.subscribers.lock().await.remove(&id.0) {
            sub.closed.store(true, Ordering::Release);
            sub.notify.notify_waiters();
        }
    }

    /// Publish to every subscriber. Never blocks: a full per-subscriber
    /// queue drops its oldest entry and increments that subscriber's
    /// `dropped` counter instead of waiting for the reader. Publishing
    /// after `close()` is a no-op returning `CANCELLED`.
    pub async fn publish(&self, event: Event) -> Result<(), CoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::new(ErrorCode::Cancelled, "event bus is closed"));
        }
        let subscribers = self.subscribers.lock().await;
        for sub in subscribers.values() {
            let mut q = sub.queue.lock().await;
            if q.len() >= sub.capacity {
                q.pop_front();
                sub.dropped.fetch_add(1, Ordering::Relaxed);
            }
            q.push_back(event.clone());
            drop(q);
            sub.notify.notify_waiters();
        }
        Ok(())
    }

    /// Drain-and-close: existing buffered events remain readable, but no
    /// further publish succeeds and blocked `recv` calls wake with `None`
    /// once their queue empties.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let subscribers = self.subscribers.lock().await;
        for sub in subscribers.values() {
            sub.closed.store(true, Ordering::Release);
            sub.notify.notify_waiters();
        }
    }

    pub fn subscriber_count_blocking(&self) -> usize {
        self.subscribers.blocking_lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn wf_started(id: &str) -> Event {
        Event::WorkflowStarted {
            workflow_id: id.into(),
            project_id: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_then_recv_in_order() {
        let bus = EventBus::new(10);
        let (_id, rx) = bus.subscribe().await;
        bus.publish(wf_started("a")).await.unwrap();
        bus.publish(wf_started("b")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().workflow_id(), Some("a"));
        assert_eq!(rx.recv().await.unwrap().workflow_id(), Some("b"));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_not_publisher() {
        // Testable property #10: capacity 2, 5 publishes with no consumer
        // progress => dropped >= 3, drain delivers the newest 2.
        let bus = EventBus::new(2);
        let (_id, rx) = bus.subscribe().await;
        for i in 0..5 {
            bus.publish(wf_started(&format!("wf-{i}"))).await.unwrap();
        }
        assert!(rx.dropped() >= 3);
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.workflow_id(), Some("wf-3"));
        assert_eq!(second.workflow_id(), Some("wf-4"));
    }

    #[tokio::test]
    async fn independent_subscribers() {
        let bus = EventBus::new(1);
        let (_id_a, rx_a) = bus.subscribe().await;
        let (_id_b, rx_b) = bus.subscribe().await;
        bus.publish(wf_started("a")).await.unwrap();
        bus.publish(wf_started("b")).await.unwrap();
        // rx_a never read, so it only ever holds the newest (capacity 1).
        assert_eq!(rx_a.recv().await.unwrap().workflow_id(), Some("b"));
        assert_eq!(rx_b.recv().await.unwrap().workflow_id(), Some("a"));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = EventBus::new(4);
        let (id, _rx) = bus.subscribe().await;
        bus.unsubscribe(id).await;
        bus.unsubscribe(id).await;
    }

    #[tokio::test]
    async fn publish_after_close_errors() {
        let bus = EventBus::new(4);
        bus.close().await;
        let err = bus.publish(wf_started("a")).await.unwrap_err();
        assert_eq!(err.code, quorum_core::ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn close_wakes_blocked_receiver_with_none() {
        let bus = Arc::new(EventBus::new(4));
        let (_id, rx) = bus.subscribe().await;
        let bus2 = bus.clone();
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        bus2.close().await;
        assert!(handle.await.unwrap().is_none());
    }
}
