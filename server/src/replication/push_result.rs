// SPDX-License-Identifier: MPL-2.0

//! Matching replication acknowledgements against outstanding requests.
//!
//! Versions normally arrive contiguously, so a ring indexed by
//! `data_version % size` resolves almost every add/remove in O(1). A
//! sorted queue catches the rest: wrap conflicts and out-of-order
//! arrivals.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex,
    },
    time::Duration,
};

use crate::{prelude::*, time};

/// A client request waiting for its mutation to be acknowledged by the
/// followers it was pushed to.
pub struct RpcWaiter {
    /// Bumped whenever the task slot is reused; in-flight ack paths
    /// compare against it and drop stale notifications.
    task_version: AtomicU64,
    waiting: Mutex<i32>,
    cond: Condvar,
}

impl Default for RpcWaiter {
    fn default() -> Self {
        Self {
            task_version: AtomicU64::new(1),
            waiting: Mutex::new(0),
            cond: Condvar::new(),
        }
    }
}

impl RpcWaiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn task_version(&self) -> u64 {
        self.task_version.load(Ordering::Relaxed)
    }

    /// Marks the task slot as reused.
    pub fn renew(&self) -> u64 {
        let version = self.task_version.fetch_add(1, Ordering::Relaxed) + 1;
        *self.waiting.lock().unwrap() = 0;
        self.cond.notify_all();
        version
    }

    pub fn set_waiting_count(&self, count: i32) {
        *self.waiting.lock().unwrap() = count;
        if count <= 0 {
            self.cond.notify_all();
        }
    }

    pub fn waiting_count(&self) -> i32 {
        *self.waiting.lock().unwrap()
    }

    fn complete_one(&self) {
        let mut waiting = self.waiting.lock().unwrap();
        *waiting -= 1;
        if *waiting <= 0 {
            self.cond.notify_all();
        }
    }

    /// Waits until every outstanding acknowledgement arrived (or timed
    /// out and was cleared). Returns false when `timeout` expires first.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let waiting = self.waiting.lock().unwrap();
        let (waiting, result) = self
            .cond
            .wait_timeout_while(waiting, timeout, |count| *count > 0)
            .unwrap();
        drop(waiting);
        !result.timed_out()
    }
}

struct ResultEntry {
    data_version: u64,
    expires: i64,
    waiter: Option<(Arc<RpcWaiter>, u64)>,
}

impl ResultEntry {
    const fn empty() -> Self {
        Self {
            data_version: 0,
            expires: 0,
            waiter: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.data_version == 0
    }
}

/// Per-follower tracker: ring plus sorted-queue fallback.
pub struct PushResultContext {
    ring: Vec<ResultEntry>,
    start: usize,
    end: usize,
    queue: VecDeque<ResultEntry>,
    network_timeout: i64,
    last_check: i64,
}

impl PushResultContext {
    pub fn new(ring_size: usize, network_timeout: i64) -> Self {
        let ring_size = ring_size.max(2);
        Self {
            ring: (0..ring_size).map(|_| ResultEntry::empty()).collect(),
            start: 0,
            end: 0,
            queue: VecDeque::new(),
            network_timeout,
            last_check: 0,
        }
    }

    fn notify(entry: ResultEntry) {
        let Some((waiter, task_version)) = entry.waiter else {
            return;
        };
        if waiter.task_version() != task_version {
            warn!(
                "task for data version {} already reused, dropping ack",
                entry.data_version
            );
            return;
        }
        waiter.complete_one();
    }

    fn make_entry(&self, data_version: u64, waiter: Option<Arc<RpcWaiter>>) -> ResultEntry {
        ResultEntry {
            data_version,
            expires: time::current_secs() + self.network_timeout,
            waiter: waiter.map(|w| {
                let version = w.task_version();
                (w, version)
            }),
        }
    }

    fn add_to_queue(&mut self, entry: ResultEntry) {
        let v = entry.data_version;
        if self
            .queue
            .back()
            .is_none_or(|tail| v > tail.data_version)
        {
            self.queue.push_back(entry);
            return;
        }
        let pos = self
            .queue
            .iter()
            .position(|e| e.data_version > v)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, entry);
    }

    /// Tracks one outstanding push. The ring takes it only when the
    /// version extends the contiguous run; otherwise it queues.
    pub fn add(&mut self, data_version: u64, waiter: Option<Arc<RpcWaiter>>) {
        let size = self.ring.len();
        let index = data_version as usize % size;
        let entry = self.make_entry(data_version, waiter);

        let matched = if self.start == self.end {
            self.start = index;
            self.end = (index + 1) % size;
            true
        } else if index == self.end {
            let previous = (index + size - 1) % size;
            let next = (index + 1) % size;
            if next != self.start && self.ring[previous].data_version + 1 == data_version {
                self.end = next;
                true
            } else {
                false
            }
        } else {
            false
        };

        if matched {
            self.ring[index] = entry;
        } else {
            warn!("data version {data_version} does not fit the ring, queueing");
            self.add_to_queue(entry);
        }
    }

    fn remove_from_queue(&mut self, data_version: u64) -> Result<()> {
        let Some(pos) = self
            .queue
            .iter()
            .position(|e| e.data_version == data_version)
        else {
            return_errno!(Errno::ENOENT);
        };
        let entry = self.queue.remove(pos).unwrap();
        Self::notify(entry);
        Ok(())
    }

    /// Clears the entry for an acknowledged version and wakes its
    /// waiter.
    pub fn remove(&mut self, data_version: u64) -> Result<()> {
        if self.start != self.end {
            let size = self.ring.len();
            let index = data_version as usize % size;
            if self.ring[index].data_version == data_version {
                let entry = core::mem::replace(&mut self.ring[index], ResultEntry::empty());
                if self.start == index {
                    // Advance past the freed slot and any holes behind it.
                    let mut i = index;
                    loop {
                        i = (i + 1) % size;
                        self.start = i;
                        if i == self.end || !self.ring[i].is_empty() {
                            break;
                        }
                    }
                }
                Self::notify(entry);
                return Ok(());
            }
        }
        self.remove_from_queue(data_version)
    }

    /// Expires overdue entries; runs at most once per wall-clock second.
    pub fn clear_timeouts(&mut self, now: i64) {
        if self.last_check == now {
            return;
        }
        self.last_check = now;

        let mut cleared = 0;
        let size = self.ring.len();
        while self.start != self.end && !self.ring[self.start].is_empty() {
            if self.ring[self.start].expires >= now {
                break;
            }
            let entry =
                core::mem::replace(&mut self.ring[self.start], ResultEntry::empty());
            warn!(
                "waiting push response timeout, data version: {}",
                entry.data_version
            );
            Self::notify(entry);
            self.start = (self.start + 1) % size;
            cleared += 1;
        }

        while let Some(head) = self.queue.front() {
            if head.expires >= now {
                break;
            }
            let entry = self.queue.pop_front().unwrap();
            warn!(
                "waiting push response timeout, data version: {}",
                entry.data_version
            );
            Self::notify(entry);
            cleared += 1;
        }

        if cleared > 0 {
            warn!("cleared {cleared} timed out push response entries");
        }
    }

    /// Connection teardown: everything outstanding completes now.
    pub fn clear_all(&mut self) {
        let size = self.ring.len();
        while self.start != self.end {
            let entry =
                core::mem::replace(&mut self.ring[self.start], ResultEntry::empty());
            Self::notify(entry);
            self.start = (self.start + 1) % size;
        }
        for entry in self.queue.drain(..) {
            Self::notify(entry);
        }
    }

    /// Outstanding entries (ring + queue), for observability.
    pub fn waiting_count(&self) -> usize {
        let ring = self.ring.iter().filter(|e| !e.is_empty()).count();
        ring + self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_TIMEOUT: i64 = 3600;

    #[test]
    fn contiguous_versions_stay_in_the_ring() {
        let mut ctx = PushResultContext::new(8, NO_TIMEOUT);
        let waiter = RpcWaiter::new();
        waiter.set_waiting_count(5);

        for v in 100..105 {
            ctx.add(v, Some(waiter.clone()));
        }
        assert_eq!(ctx.waiting_count(), 5);

        // Out-of-order removal: middle first, then the rest.
        ctx.remove(102).unwrap();
        for v in [101, 100, 103, 104] {
            ctx.remove(v).unwrap();
        }
        assert_eq!(ctx.waiting_count(), 0);
        assert_eq!(waiter.waiting_count(), 0);
        assert!(waiter.wait_ready(Duration::from_millis(1)));

        // Acking twice finds nothing.
        assert_eq!(ctx.remove(102).unwrap_err().error(), Errno::ENOENT);
    }

    #[test]
    fn non_contiguous_versions_fall_back_to_the_queue() {
        let mut ctx = PushResultContext::new(8, NO_TIMEOUT);
        ctx.add(10, None);
        // A gap: 12 does not extend the run.
        ctx.add(12, None);
        // Smaller than the head: also queued, kept sorted.
        ctx.add(3, None);
        assert_eq!(ctx.waiting_count(), 3);

        ctx.remove(12).unwrap();
        ctx.remove(3).unwrap();
        ctx.remove(10).unwrap();
        assert_eq!(ctx.waiting_count(), 0);
    }

    #[test]
    fn ring_wrap_conflict_queues() {
        let mut ctx = PushResultContext::new(4, NO_TIMEOUT);
        // Fill the ring; the slot before start blocks the wrap.
        for v in 1..=3 {
            ctx.add(v, None);
        }
        ctx.add(4, None);
        assert_eq!(ctx.waiting_count(), 4);

        for v in 1..=4 {
            ctx.remove(v).unwrap();
        }
        assert_eq!(ctx.waiting_count(), 0);
    }

    #[test]
    fn timeouts_complete_waiters() {
        let mut ctx = PushResultContext::new(8, -1);
        let waiter = RpcWaiter::new();
        waiter.set_waiting_count(2);
        ctx.add(7, Some(waiter.clone()));
        ctx.add(8, Some(waiter.clone()));

        // Expiries are in the past; the first sweep clears everything.
        ctx.clear_timeouts(time::current_secs());
        assert_eq!(ctx.waiting_count(), 0);
        assert_eq!(waiter.waiting_count(), 0);
    }

    #[test]
    fn stale_task_versions_are_dropped() {
        let mut ctx = PushResultContext::new(8, NO_TIMEOUT);
        let waiter = RpcWaiter::new();
        waiter.set_waiting_count(1);
        ctx.add(9, Some(waiter.clone()));

        // The task slot is reused before the ack arrives.
        waiter.renew();
        waiter.set_waiting_count(1);
        ctx.remove(9).unwrap();

        // The stale ack did not touch the renewed task.
        assert_eq!(waiter.waiting_count(), 1);
    }

    #[test]
    fn clear_all_completes_everything() {
        let mut ctx = PushResultContext::new(4, NO_TIMEOUT);
        let waiter = RpcWaiter::new();
        waiter.set_waiting_count(3);
        ctx.add(1, Some(waiter.clone()));
        ctx.add(2, Some(waiter.clone()));
        ctx.add(9, Some(waiter.clone())); // queued

        ctx.clear_all();
        assert_eq!(ctx.waiting_count(), 0);
        assert_eq!(waiter.waiting_count(), 0);
    }
}
