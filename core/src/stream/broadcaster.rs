//! Line fan-out with bounded history
//!
//! Every completed line is appended to a fixed-size tail and offered to each
//! subscriber queue without waiting. A subscriber that cannot keep up loses
//! lines; the producer is never held back by a consumer.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Lines kept for [`Broadcaster::tail`]
pub const DEFAULT_TAIL_CAPACITY: usize = 1000;

/// Queue depth of a subscription created with [`Broadcaster::subscribe`]
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Identifier of a subscription within its broadcaster
pub type SubscriberId = u64;

/// Receiving end of a subscription, owned by the subscriber
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<String>,
}

impl Subscription {
    /// Identifier used by [`Broadcaster::unsubscribe`]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next line; `None` once unsubscribed and drained
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Take a line if one is queued
    pub fn try_recv(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }

    /// Take every queued line
    pub fn drain(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.receiver.try_recv() {
            lines.push(line);
        }
        lines
    }
}

struct Inner {
    subscribers: HashMap<SubscriberId, mpsc::Sender<String>>,
    tail: VecDeque<String>,
    tail_capacity: usize,
}

/// Fan-out of completed lines to any number of subscribers
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
}

impl Broadcaster {
    /// Create a broadcaster keeping the default amount of history
    pub fn new() -> Self {
        Self::with_tail_capacity(DEFAULT_TAIL_CAPACITY)
    }

    /// Create a broadcaster keeping at most `tail_capacity` lines of history
    pub fn with_tail_capacity(tail_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                subscribers: HashMap::new(),
                tail: VecDeque::with_capacity(tail_capacity.min(DEFAULT_TAIL_CAPACITY)),
                tail_capacity,
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Subscribe with the default queue depth
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Subscribe with a queue holding at most `capacity` undelivered lines.
    ///
    /// Only lines published after this call are delivered.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().subscribers.insert(id, tx);
        Subscription { id, receiver: rx }
    }

    /// Stop delivering to `subscription`. Unknown subscriptions are ignored.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.unsubscribe_id(subscription.id);
    }

    /// Stop delivering to the subscription with `id`
    pub fn unsubscribe_id(&self, id: SubscriberId) {
        self.inner.lock().subscribers.remove(&id);
    }

    /// Record `line` in the tail and offer it to every subscriber
    pub fn publish(&self, line: String) {
        let mut inner = self.inner.lock();

        for (id, tx) in inner.subscribers.iter() {
            if tx.try_send(line.clone()).is_err() {
                trace!("Subscriber {} full or closed, line dropped", id);
            }
        }

        if inner.tail_capacity == 0 {
            return;
        }
        if inner.tail.len() == inner.tail_capacity {
            inner.tail.pop_front();
        }
        inner.tail.push_back(line);
    }

    /// The most recent `limit` lines, oldest first
    pub fn tail(&self, limit: usize) -> Vec<String> {
        let inner = self.inner.lock();
        let skip = inner.tail.len().saturating_sub(limit);
        inner.tail.iter().skip(skip).cloned().collect()
    }

    /// Number of lines currently held in history
    pub fn history_len(&self) -> usize {
        self.inner.lock().tail.len()
    }

    /// Number of registered subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_bounded_fifo() {
        let broadcaster = Broadcaster::with_tail_capacity(3);
        for i in 0..5 {
            broadcaster.publish(format!("line {}", i));
        }

        assert_eq!(broadcaster.history_len(), 3);
        assert_eq!(broadcaster.tail(10), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(broadcaster.tail(2), vec!["line 3", "line 4"]);
        assert!(broadcaster.tail(0).is_empty());
    }

    #[test]
    fn test_default_tail_capacity() {
        let broadcaster = Broadcaster::new();
        for i in 0..(DEFAULT_TAIL_CAPACITY + 50) {
            broadcaster.publish(i.to_string());
        }
        let tail = broadcaster.tail(usize::MAX);
        assert_eq!(tail.len(), DEFAULT_TAIL_CAPACITY);
        assert_eq!(tail[0], "50");
    }

    #[test]
    fn test_late_subscriber_gets_no_history() {
        let broadcaster = Broadcaster::new();
        broadcaster.publish("before".to_string());

        let mut sub = broadcaster.subscribe();
        assert!(sub.try_recv().is_none());

        broadcaster.publish("after".to_string());
        assert_eq!(sub.drain(), vec!["after"]);
    }

    #[test]
    fn test_full_subscriber_is_skipped() {
        let broadcaster = Broadcaster::new();
        let mut slow = broadcaster.subscribe_with_capacity(2);
        let mut fast = broadcaster.subscribe();

        for i in 0..5 {
            broadcaster.publish(i.to_string());
        }

        assert_eq!(slow.drain(), vec!["0", "1"]);
        assert_eq!(fast.drain(), vec!["0", "1", "2", "3", "4"]);
        assert_eq!(broadcaster.history_len(), 5);
    }

    #[test]
    fn test_closed_subscriber_does_not_break_publish() {
        let broadcaster = Broadcaster::new();
        let gone = broadcaster.subscribe();
        let mut alive = broadcaster.subscribe();
        drop(gone);

        broadcaster.publish("x".to_string());
        assert_eq!(alive.drain(), vec!["x"]);
        // Dropped queues stay registered until unsubscribed explicitly
        assert_eq!(broadcaster.subscriber_count(), 2);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let broadcaster = Broadcaster::new();
        let mut sub = broadcaster.subscribe();
        broadcaster.publish("one".to_string());

        broadcaster.unsubscribe(&sub);
        broadcaster.publish("two".to_string());

        assert_eq!(sub.drain(), vec!["one"]);
        assert_eq!(broadcaster.subscriber_count(), 0);

        // Unsubscribing twice is harmless
        broadcaster.unsubscribe(&sub);
    }

    #[test]
    fn test_recv_ends_after_unsubscribe() {
        let broadcaster = Broadcaster::new();
        let mut sub = broadcaster.subscribe();
        broadcaster.publish("last".to_string());
        broadcaster.unsubscribe(&sub);

        tokio_test::block_on(async {
            assert_eq!(sub.recv().await.as_deref(), Some("last"));
            assert_eq!(sub.recv().await, None);
        });
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_and_publish() {
        let broadcaster = Broadcaster::with_tail_capacity(100);
        let publisher = {
            let b = broadcaster.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    b.publish(i.to_string());
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut subs = Vec::new();
        for _ in 0..20 {
            subs.push(broadcaster.subscribe());
            tokio::task::yield_now().await;
        }
        publisher.await.expect("publisher task");

        for mut sub in subs {
            let got: Vec<u32> = sub
                .drain()
                .into_iter()
                .map(|l| l.parse().expect("number"))
                .collect();
            // Each subscriber sees a contiguous, ordered suffix of the stream
            for pair in got.windows(2) {
                assert_eq!(pair[1], pair[0] + 1);
            }
            if let Some(last) = got.last() {
                assert_eq!(*last, 199);
            }
        }
        assert_eq!(broadcaster.history_len(), 100);
    }
}
