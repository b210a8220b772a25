//! Snapshot feed for external consumers.
//!
//! Each subscriber owns an independent bounded queue, so a slow consumer
//! never stalls the engine or other subscribers. On overflow the oldest
//! buffered snapshot for that subscriber is dropped and counted on the
//! handle; delivered snapshots always have strictly increasing cycle numbers.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

use crate::state::snapshot::Snapshot;

/// Identifies a subscription for `Engine::unsubscribe`
pub type SubscriptionId = u64;

/// Snapshots buffered per subscriber before drop-oldest kicks in
const FEED_CAPACITY: usize = 16;

struct Shared {
    id: SubscriptionId,
    queue: Mutex<VecDeque<Snapshot>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Consumer handle for the engine's snapshot feed.
///
/// Dropping the handle unsubscribes implicitly; the publisher prunes it on
/// the next emission.
pub struct Subscription {
    shared: Arc<Shared>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    /// Receive the next snapshot. Returns None once the feed is closed and
    /// the buffer is drained; no snapshots arrive after that.
    pub async fn recv(&mut self) -> Option<Snapshot> {
        loop {
            if let Some(snapshot) = self.shared.queue.lock().pop_front() {
                return Some(snapshot);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Non-blocking variant of `recv`
    pub fn try_recv(&mut self) -> Option<Snapshot> {
        self.shared.queue.lock().pop_front()
    }

    /// Snapshots dropped for this subscriber due to buffer overflow
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

/// Publisher side, owned by the engine
pub(crate) struct FeedHub {
    subscribers: Mutex<Vec<Arc<Shared>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl FeedHub {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a new subscription. After the feed has closed the returned
    /// handle yields None immediately.
    pub(crate) fn subscribe(&self) -> Subscription {
        let shared = Arc::new(Shared {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            queue: Mutex::new(VecDeque::with_capacity(FEED_CAPACITY)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(self.closed.load(Ordering::Acquire)),
        });
        if !shared.closed.load(Ordering::Acquire) {
            self.subscribers.lock().push(Arc::clone(&shared));
        }
        Subscription { shared }
    }

    /// Detach a subscriber; its handle yields None after the buffer drains.
    /// Returns false for unknown ids.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(pos) = subscribers.iter().position(|s| s.id == id) else {
            return false;
        };
        let shared = subscribers.swap_remove(pos);
        shared.close();
        true
    }

    /// Deliver a snapshot to every live subscriber, dropping the oldest
    /// buffered snapshot per subscriber on overflow. Never blocks.
    pub(crate) fn publish(&self, snapshot: Snapshot) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.closed.load(Ordering::Acquire));

        for shared in subscribers.iter() {
            {
                let mut queue = shared.queue.lock();
                if queue.len() >= FEED_CAPACITY {
                    queue.pop_front();
                    shared.dropped.fetch_add(1, Ordering::Relaxed);
                }
                queue.push_back(snapshot.clone());
            }
            shared.notify.notify_one();
        }
    }

    /// Close the feed; subscribers drain their buffers and then see None
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let subscribers = std::mem::take(&mut *self.subscribers.lock());
        for shared in subscribers {
            shared.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::table::HopTable;
    use std::net::{IpAddr, Ipv4Addr};

    fn snapshot(cycle: u64) -> Snapshot {
        let table = HopTable::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 5);
        Snapshot::capture(cycle, &table, false, None)
    }

    #[tokio::test]
    async fn test_publish_and_recv() {
        let hub = FeedHub::new();
        let mut sub = hub.subscribe();

        hub.publish(snapshot(1));
        hub.publish(snapshot(2));

        assert_eq!(sub.recv().await.unwrap().cycle, 1);
        assert_eq!(sub.recv().await.unwrap().cycle, 2);
        assert_eq!(sub.dropped(), 0);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let hub = FeedHub::new();
        let mut sub = hub.subscribe();

        for cycle in 1..=(FEED_CAPACITY as u64 + 3) {
            hub.publish(snapshot(cycle));
        }

        assert_eq!(sub.dropped(), 3);
        // Oldest were dropped; delivery resumes at cycle 4 and stays monotonic
        assert_eq!(sub.recv().await.unwrap().cycle, 4);
        let mut last = 4;
        while let Some(s) = sub.try_recv() {
            assert!(s.cycle > last);
            last = s.cycle;
        }
        assert_eq!(last, FEED_CAPACITY as u64 + 3);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_affect_others() {
        let hub = FeedHub::new();
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        for cycle in 1..=(FEED_CAPACITY as u64 + 5) {
            hub.publish(snapshot(cycle));
            // The fast subscriber keeps up
            assert_eq!(fast.recv().await.unwrap().cycle, cycle);
        }

        assert_eq!(fast.dropped(), 0);
        assert_eq!(slow.dropped(), 5);
        assert_eq!(slow.recv().await.unwrap().cycle, 6);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let hub = FeedHub::new();
        let mut sub = hub.subscribe();

        hub.publish(snapshot(1));
        hub.close();

        assert_eq!(sub.recv().await.unwrap().cycle, 1);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_after_close_is_terminated() {
        let hub = FeedHub::new();
        hub.close();

        let mut sub = hub.subscribe();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_subscriber() {
        let hub = FeedHub::new();
        let mut sub = hub.subscribe();
        let id = sub.id();

        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));

        hub.publish(snapshot(1));
        assert!(sub.recv().await.is_none());
    }
}
