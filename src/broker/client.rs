//! Per-client send queue and connection lifecycle state.
//!
//! A plain `tokio::sync::mpsc::Sender` rejects (or blocks on) a full queue —
//! it has no way to express "replace the oldest entry instead." Reload
//! notifications are an exception to the usual coalescing done upstream in
//! the pipeline: by the time a `BuildResult` reaches a client queue, dropping
//! the oldest stale notification in favor of the newest is exactly the
//! desired behavior, so the queue is hand-rolled the way the pipeline's
//! `TaskQueue` hand-rolls its own scheduling (`Mutex` + `Notify`) rather than
//! reusing a channel whose semantics don't fit.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Lifecycle of one broker connection, per `spec.md` §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepting,
    Open,
    Draining,
    Closed,
}

struct QueueState<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

/// A bounded queue that drops the oldest entry on overflow rather than
/// rejecting the newest or blocking the producer.
pub struct DropOldestQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                capacity,
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Push an item, dropping the oldest queued item if already at capacity.
    pub fn push(&self, item: T) {
        let mut state = self.state.lock().expect("send queue poisoned");
        if state.items.len() >= state.capacity {
            state.items.pop_front();
            state.dropped += 1;
        }
        state.items.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for and pop the next item.
    pub async fn pop(&self) -> T {
        loop {
            {
                let mut state = self.state.lock().expect("send queue poisoned");
                if let Some(item) = state.items.pop_front() {
                    return item;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.state.lock().expect("send queue poisoned").dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("send queue poisoned").items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_on_overflow() {
        let queue: DropOldestQueue<u32> = DropOldestQueue::new(2);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_count(), 1);
    }

    #[tokio::test]
    async fn pop_returns_in_fifo_order_after_drop() {
        let queue: DropOldestQueue<u32> = DropOldestQueue::new(2);
        queue.push(1);
        queue.push(2);
        queue.push(3); // drops 1
        assert_eq!(queue.pop().await, 2);
        assert_eq!(queue.pop().await, 3);
    }
}
