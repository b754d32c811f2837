//! Fixed-capacity FIFO hand-off between a receiver thread and the pipeline.
//!
//! `push` never blocks: when the queue is full the oldest element is evicted to
//! make room, and the eviction is counted in [`BoundedQueue::dropped`].
//!
//! `pop` blocks on a condition variable until an item arrives or the timeout
//! elapses. Absence of data is returned as `None`, never as an error.
//!
//! # Example
//! ```
//! use rust_ingest::data::bounded_queue::BoundedQueue;
//! use std::time::Duration;
//!
//! let queue = BoundedQueue::new(2);
//! queue.push(1);
//! queue.push(2);
//! queue.push(3); // evicts 1
//! assert_eq!(queue.pop(Some(Duration::ZERO)), Some(2));
//! assert_eq!(queue.pop(Some(Duration::ZERO)), Some(3));
//! assert_eq!(queue.pop(Some(Duration::ZERO)), None);
//! ```

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Thread-safe ring buffer with drop-oldest overflow.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
    capacity: usize,
    /// Metrics: items evicted because the queue was full
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    /// Create an empty queue holding at most `capacity` items.
    ///
    /// A capacity of zero is raised to one so that `push` always stores the
    /// newest item.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Insert an item, evicting the oldest one if the queue is full.
    ///
    /// Returns `true` if an item was evicted. Never blocks beyond the short
    /// critical section.
    pub fn push(&self, item: T) -> bool {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front();
                true
            } else {
                false
            };
            items.push_back(item);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.available.notify_one();
        evicted
    }

    /// Remove and return the oldest item.
    ///
    /// - `None` timeout blocks until an item is available.
    /// - `Some(Duration::ZERO)` returns immediately.
    /// - Otherwise waits up to `timeout` and returns `None` if nothing arrived.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<T> {
        let mut items = self.items.lock();
        match timeout {
            None => {
                while items.is_empty() {
                    self.available.wait(&mut items);
                }
                items.pop_front()
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while items.is_empty() {
                    if self.available.wait_until(&mut items, deadline).timed_out() {
                        break;
                    }
                }
                items.pop_front()
            }
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Maximum number of items held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total items evicted by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard all queued items.
    pub fn clear(&self) {
        self.items.lock().clear();
    }
}
