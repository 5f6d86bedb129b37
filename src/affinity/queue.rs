//! Bounded per-member queue of pre-generated keys.

use crate::types::SessionKey;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tokio::time::{timeout, Duration};

/// Bounded FIFO queue of affinity keys for one cluster member.
///
/// The producer offers without blocking; consumers poll, optionally waiting
/// one bounded interval for the producer to catch up.
#[derive(Debug)]
pub struct BoundedKeyQueue {
    keys: Mutex<VecDeque<SessionKey>>,
    capacity: usize,
    notify: Notify,
}

impl BoundedKeyQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }

    /// Non-blocking enqueue; `false` when the queue is full.
    pub fn offer(&self, key: SessionKey) -> bool {
        let mut keys = self.keys.lock();
        if keys.len() >= self.capacity {
            return false;
        }
        keys.push_back(key);
        drop(keys);
        self.notify.notify_one();
        true
    }

    /// Non-blocking dequeue.
    pub fn poll(&self) -> Option<SessionKey> {
        self.keys.lock().pop_front()
    }

    /// Dequeue, waiting up to `interval` for the producer if empty.
    ///
    /// A timed-out wait returns `None`; the caller re-reads the queue map and
    /// retries, so a topology change can swap the queue out from under it.
    pub async fn poll_wait(&self, interval: Duration) -> Option<SessionKey> {
        if let Some(key) = self.poll() {
            return Some(key);
        }
        let _ = timeout(interval, self.notify.notified()).await;
        self.poll()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionId;
    use std::sync::Arc;

    fn key(id: &str) -> SessionKey {
        SessionKey::new(SessionId::from(id))
    }

    #[test]
    fn test_offer_respects_capacity() {
        let queue = BoundedKeyQueue::new(2);
        assert!(queue.offer(key("a")));
        assert!(queue.offer(key("b")));
        assert!(!queue.offer(key("c")));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_fifo_order() {
        let queue = BoundedKeyQueue::new(4);
        queue.offer(key("a"));
        queue.offer(key("b"));
        assert_eq!(queue.poll().unwrap().id().as_str(), "a");
        assert_eq!(queue.poll().unwrap().id().as_str(), "b");
        assert!(queue.poll().is_none());
    }

    #[tokio::test]
    async fn test_poll_wait_times_out_empty() {
        let queue = BoundedKeyQueue::new(1);
        assert!(queue.poll_wait(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_poll_wait_wakes_on_offer() {
        let queue = Arc::new(BoundedKeyQueue::new(1));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.poll_wait(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.offer(key("a"));
        let polled = consumer.await.unwrap();
        assert_eq!(polled.unwrap().id().as_str(), "a");
    }
}
