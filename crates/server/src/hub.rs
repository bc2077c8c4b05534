//! In-process event hub: typed pub/sub with bounded per-subscriber queues.
//!
//! `publish` never blocks the publisher. Each subscriber owns a bounded
//! queue; when it is full the oldest queued event for that subscriber is
//! dropped and its `dropped_count` bumped - other subscribers are
//! unaffected. Sequence numbers are assigned under the dispatch lock so
//! every subscriber observes a total order consistent with publish order.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use cdev_protocol::{now_rfc3339, Event, EventKind};

/// Predicate applied inside the hub before queueing.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Accept only these kinds; `None` accepts all.
    pub kinds: Option<HashSet<String>>,
    /// Accept only this workspace. Global events (empty workspace id)
    /// always pass.
    pub workspace_id: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(event.kind()) {
                return false;
            }
        }
        if let Some(ws) = &self.workspace_id {
            if !event.workspace_id.is_empty() && &event.workspace_id != ws {
                return false;
            }
        }
        true
    }
}

struct SubscriberQueue {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
    capacity: usize,
    filter: EventFilter,
}

impl SubscriberQueue {
    fn push(&self, event: Event) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if !self.filter.matches(&event) {
            return;
        }
        {
            let mut queue = self.queue.lock().expect("subscriber queue poisoned");
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // notify_one leaves a permit for a receiver not yet parked;
            // notify_waiters wakes one that already is.
            self.notify.notify_one();
            self.notify.notify_waiters();
        }
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    hub: Arc<HubInner>,
}

impl Subscription {
    /// Receive the next event in publish order. Returns `None` once the
    /// hub is stopped (or this subscription closed) and the queue is
    /// drained.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            // Register interest before the empty-check so a push or
            // close landing in between still wakes us.
            let notified = self.queue.notify.notified();
            {
                let mut queue = self.queue.queue.lock().expect("subscriber queue poisoned");
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    /// Events dropped for this subscriber due to backpressure.
    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.queue.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
        self.hub
            .subscribers
            .lock()
            .expect("hub subscribers poisoned")
            .retain(|(id, _)| *id != self.id);
    }
}

struct HubInner {
    seq: AtomicU64,
    next_sub_id: AtomicU64,
    queue_size: usize,
    /// Also serves as the dispatch lock: seq assignment and fan-out
    /// happen under it so ordering is total.
    subscribers: Mutex<Vec<(u64, Arc<SubscriberQueue>)>>,
    stopped: AtomicBool,
}

/// The process-wide event hub.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    pub fn new(queue_size: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                seq: AtomicU64::new(0),
                next_sub_id: AtomicU64::new(0),
                queue_size: queue_size.max(1),
                subscribers: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Publish an event. Never blocks; a stopped hub makes this a no-op.
    /// Returns the assigned sequence number (0 when stopped).
    pub fn publish(&self, workspace_id: impl Into<String>, payload: EventKind) -> u64 {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return 0;
        }
        let subscribers = self
            .inner
            .subscribers
            .lock()
            .expect("hub subscribers poisoned");
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event {
            seq,
            timestamp: now_rfc3339(),
            workspace_id: workspace_id.into(),
            payload,
        };
        for (_, queue) in subscribers.iter() {
            queue.push(event.clone());
        }
        seq
    }

    /// Register a subscriber with an optional filter and the default
    /// queue capacity.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.subscribe_with_capacity(filter, self.inner.queue_size)
    }

    /// Register a subscriber with an explicit queue capacity.
    pub fn subscribe_with_capacity(&self, filter: EventFilter, capacity: usize) -> Subscription {
        let capacity = capacity.max(1);
        let queue = Arc::new(SubscriberQueue {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(self.inner.stopped.load(Ordering::SeqCst)),
            capacity,
            filter,
        });
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .expect("hub subscribers poisoned")
            .push((id, queue.clone()));
        Subscription {
            id,
            queue,
            hub: self.inner.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("hub subscribers poisoned")
            .len()
    }

    /// Stop the hub: close every subscriber channel exactly once.
    /// Further publishes become no-ops.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscribers = self
            .inner
            .subscribers
            .lock()
            .expect("hub subscribers poisoned");
        for (_, queue) in subscribers.iter() {
            queue.close();
        }
        debug!(
            component = "hub",
            event = "hub.stopped",
            subscriber_count = subscribers.len(),
            "Event hub stopped"
        );
    }
}
