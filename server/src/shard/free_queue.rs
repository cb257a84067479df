// SPDX-License-Identifier: MPL-2.0

//! Two-tier reclamation.
//!
//! Cross-shard readers (response serializers, replication pushers,
//! persistence) may still hold a dentry after its shard logically removed
//! it. The delay queue keeps removed objects alive for a grace window;
//! the immediate queue routes releases from other threads back to the
//! owning shard so teardown always happens there.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
};

use spin::Mutex;

use crate::prelude::*;

pub type FreeFn = Box<dyn FnOnce() + Send>;

struct DelayNode {
    expires: i64,
    free: FreeFn,
}

/// Expiry-ordered queue, only ever touched by the owning shard thread.
/// Nodes are appended with `now + delay`, so the queue stays sorted.
pub struct DelayFreeQueue {
    queue: VecDeque<DelayNode>,
    delay_seconds: i64,
    last_check: i64,
}

impl DelayFreeQueue {
    pub fn new(delay_seconds: i64) -> Self {
        Self {
            queue: VecDeque::new(),
            delay_seconds,
            last_check: 0,
        }
    }

    pub fn push(&mut self, free: FreeFn) {
        self.queue.push_back(DelayNode {
            expires: crate::time::current_secs() + self.delay_seconds,
            free,
        });
    }

    /// Keeps `value` alive until its grace window has passed.
    pub fn defer_drop<T: Send + 'static>(&mut self, value: T) {
        self.push(Box::new(move || drop(value)));
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Frees every expired node in one batch. Runs at most once per
    /// wall-clock second; returns the number of nodes freed.
    pub fn reclaim(&mut self, now: i64) -> usize {
        if self.last_check == now || self.queue.is_empty() {
            return 0;
        }
        self.last_check = now;

        let mut count = 0;
        while let Some(node) = self.queue.front() {
            if node.expires >= now {
                break;
            }
            let node = self.queue.pop_front().unwrap();
            (node.free)();
            count += 1;
        }
        count
    }

    /// Unconditional drain for shutdown.
    pub fn reclaim_all(&mut self) -> usize {
        let mut count = 0;
        while let Some(node) = self.queue.pop_front() {
            (node.free)();
            count += 1;
        }
        count
    }
}

/// MPSC free queue; producers are arbitrary threads, the consumer is the
/// owning shard at the end of each iteration.
#[derive(Default)]
pub struct ImmediateFreeQueue {
    queue: Mutex<Vec<FreeFn>>,
    waiting_count: AtomicUsize,
}

impl ImmediateFreeQueue {
    pub fn push(&self, free: FreeFn) {
        self.waiting_count.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push(free);
    }

    /// Hands `value` to the owning shard to be dropped there.
    pub fn defer_drop<T: Send + 'static>(&self, value: T) {
        self.push(Box::new(move || drop(value)));
    }

    /// Published for observability.
    pub fn waiting_count(&self) -> usize {
        self.waiting_count.load(Ordering::Relaxed)
    }

    /// Drains and runs every queued free; returns the batch size.
    pub fn drain(&self) -> usize {
        let batch = core::mem::take(&mut *self.queue.lock());
        let count = batch.len();
        for free in batch {
            free();
        }
        if count > 0 {
            let remaining = self
                .waiting_count
                .fetch_sub(count, Ordering::Relaxed)
                .saturating_sub(count);
            debug!("immediate free batch: {count}, still waiting: {remaining}");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[test]
    fn delay_queue_waits_for_expiry() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut queue = DelayFreeQueue::new(5);
        let now = crate::time::current_secs();
        for _ in 0..3 {
            let counter = counter.clone();
            queue.push(Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }

        // Not yet expired.
        assert_eq!(queue.reclaim(now + 1), 0);
        // Rate limit: same second is a no-op even when expired.
        assert_eq!(queue.reclaim(now + 1), 0);
        // Past the window everything frees in one batch.
        assert_eq!(queue.reclaim(now + 10), 3);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn deferred_value_is_dropped_on_reclaim() {
        let value = Arc::new(());
        let mut queue = DelayFreeQueue::new(0);
        queue.defer_drop(value.clone());
        assert_eq!(Arc::strong_count(&value), 2);
        queue.reclaim(crate::time::current_secs() + 5);
        assert_eq!(Arc::strong_count(&value), 1);
    }

    #[test]
    fn immediate_queue_counts_waiters() {
        let queue = ImmediateFreeQueue::default();
        let value = Arc::new(());
        queue.defer_drop(value.clone());
        queue.defer_drop(value.clone());
        assert_eq!(queue.waiting_count(), 2);
        assert_eq!(Arc::strong_count(&value), 3);

        assert_eq!(queue.drain(), 2);
        assert_eq!(queue.waiting_count(), 0);
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
