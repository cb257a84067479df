// SPDX-License-Identifier: MPL-2.0

//! Multi-producer single-consumer batch queue. `pop_all` hands the
//! consumer everything that accumulated, in arrival order, with one lock
//! round-trip.

use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

struct Inner<T> {
    items: Vec<T>,
    terminated: bool,
}

pub struct BatchQueue<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

impl<T> Default for BatchQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BatchQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: Vec::new(),
                terminated: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.push(item);
        drop(inner);
        self.cond.notify_one();
    }

    /// Takes everything queued so far. Blocks up to `timeout` when the
    /// queue is empty; wakes early on a push or on termination. The
    /// second value reports whether the queue has been terminated.
    pub fn pop_all(&self, timeout: Duration) -> (Vec<T>, bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.is_empty() && !inner.terminated {
            let (guard, _) = self
                .cond
                .wait_timeout_while(inner, timeout, |inner| {
                    inner.items.is_empty() && !inner.terminated
                })
                .unwrap();
            inner = guard;
        }
        (core::mem::take(&mut inner.items), inner.terminated)
    }

    /// Takes whatever is queued without blocking.
    pub fn try_pop_all(&self) -> Vec<T> {
        core::mem::take(&mut self.inner.lock().unwrap().items)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().items.is_empty()
    }

    /// Wakes the consumer for a final drain; later pushes are still
    /// accepted so in-flight producers do not lose records.
    pub fn terminate(&self) {
        self.inner.lock().unwrap().terminated = true;
        self.cond.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock().unwrap().terminated
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn pop_all_preserves_arrival_order() {
        let queue = BatchQueue::new();
        for i in 0..10 {
            queue.push(i);
        }
        let (items, terminated) = queue.pop_all(Duration::from_millis(10));
        assert_eq!(items, (0..10).collect::<Vec<_>>());
        assert!(!terminated);
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_all_times_out_when_idle() {
        let queue: BatchQueue<u32> = BatchQueue::new();
        let (items, terminated) = queue.pop_all(Duration::from_millis(5));
        assert!(items.is_empty());
        assert!(!terminated);
    }

    #[test]
    fn producers_wake_the_consumer() {
        let queue = Arc::new(BatchQueue::new());
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(7u32))
        };
        let (items, _) = queue.pop_all(Duration::from_secs(5));
        producer.join().unwrap();
        assert_eq!(items, vec![7]);
    }

    #[test]
    fn terminate_wakes_and_reports() {
        let queue: Arc<BatchQueue<u32>> = Arc::new(BatchQueue::new());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop_all(Duration::from_secs(30)))
        };
        queue.terminate();
        let (items, terminated) = consumer.join().unwrap();
        assert!(items.is_empty());
        assert!(terminated);
    }
}
