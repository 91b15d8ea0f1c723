//! Drop-oldest bounded queue.
//!
//! Couples a realtime producer to a consumer that may briefly fall behind:
//! on overflow the oldest item is discarded and counted, so the consumer
//! always sees the freshest data. Used for capture frames and for per-client
//! caption board queues.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

#[derive(Debug)]
pub struct DropOldestQueue<T> {
    inner: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Outcome of a push, so callers can track per-queue drop behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Item enqueued without displacing anything.
    Accepted,
    /// Item enqueued; the oldest queued item was discarded to make room.
    DroppedOldest,
    /// Queue is closed; the item was discarded.
    Closed,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an item. Never blocks; safe to call from a non-async thread
    /// such as an audio callback.
    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut state = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if state.closed {
                return PushOutcome::Closed;
            }
            let outcome = if state.items.len() >= self.capacity {
                state.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Accepted
            };
            state.items.push_back(item);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Await the next item. Returns None once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            // Register for a wakeup before checking, so a push between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self
                    .inner
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .items
            .pop_front()
    }

    /// Close the queue. Queued items remain poppable; pushes are discarded.
    pub fn close(&self) {
        {
            let mut state = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .closed
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total items discarded to overflow since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard everything currently queued.
    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .items
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_push_pop_in_order() {
        let queue = DropOldestQueue::new(4);
        assert_eq!(queue.push(1), PushOutcome::Accepted);
        assert_eq!(queue.push(2), PushOutcome::Accepted);
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let queue = DropOldestQueue::new(2);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.push(3), PushOutcome::DroppedOldest);
        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = DropOldestQueue::new(4);
        queue.push(7);
        queue.close();
        assert_eq!(queue.push(8), PushOutcome::Closed);
        assert_eq!(queue.pop().await, Some(7));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(DropOldestQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(42);
        let value = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("pop should wake")
            .expect("task should not panic");
        assert_eq!(value, Some(42));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_close() {
        let queue = Arc::new(DropOldestQueue::<u32>::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        let value = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("pop should wake")
            .expect("task should not panic");
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_try_pop_and_len() {
        let queue = DropOldestQueue::new(4);
        assert!(queue.is_empty());
        assert_eq!(queue.try_pop(), None::<u32>);
        queue.push(1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop(), Some(1));
    }

    #[tokio::test]
    async fn test_clear() {
        let queue = DropOldestQueue::new(4);
        queue.push(1);
        queue.push(2);
        queue.clear();
        assert!(queue.is_empty());
        assert!(!queue.is_closed());
    }
}
