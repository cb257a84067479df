// SPDX-License-Identifier: MPL-2.0

//! The binlog producer: every successful mutation becomes a record
//! buffer dispatched to each registered follower channel. Followers
//! acknowledge by data version; the per-channel push-result tracker
//! balances those acknowledgements against the waiting requests.

pub mod push_result;

use std::sync::Mutex;

use crate::{
    notify::serializer,
    prelude::*,
    record::Record,
    shard::queue::BatchQueue,
    time,
};

use self::push_result::{PushResultContext, RpcWaiter};

/// One replicated mutation, packed once and shared by every follower.
pub struct RecordBuffer {
    pub data_version: u64,
    pub buffer: Vec<u8>,
}

// Field IDs of the replication record encoding.
const RB_FIELD_OP: u8 = 1;
const RB_FIELD_VERSION: u8 = 2;
const RB_FIELD_INODE: u8 = 3;
const RB_FIELD_NS: u8 = 4;
const RB_FIELD_NAME: u8 = 5;

fn pack_record(record: &Record) -> Vec<u8> {
    let mut buf = Vec::new();
    serializer::pack_begin(&mut buf);
    serializer::pack_int32(&mut buf, RB_FIELD_OP, record.operation as i32);
    serializer::pack_int64(&mut buf, RB_FIELD_VERSION, record.data_version as i64);
    serializer::pack_int64(&mut buf, RB_FIELD_INODE, record.inode as i64);
    serializer::pack_string(&mut buf, RB_FIELD_NS, &record.ns);
    serializer::pack_string(&mut buf, RB_FIELD_NAME, &record.me.name);
    serializer::pack_end(&mut buf);
    buf
}

/// The producer-side view of one follower connection.
pub struct FollowerChannel {
    name: String,
    pending: BatchQueue<Arc<RecordBuffer>>,
    results: Mutex<PushResultContext>,
}

impl FollowerChannel {
    fn new(name: &str, ring_size: usize, network_timeout: i64) -> Self {
        Self {
            name: name.to_string(),
            pending: BatchQueue::new(),
            results: Mutex::new(PushResultContext::new(ring_size, network_timeout)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record buffers waiting to go out on the wire. The network push
    /// thread drains this.
    pub fn take_pending(&self) -> Vec<Arc<RecordBuffer>> {
        self.pending.try_pop_all()
    }

    /// A follower acknowledged `data_version`.
    pub fn ack(&self, data_version: u64) -> Result<()> {
        self.results.lock().unwrap().remove(data_version)
    }

    pub fn clear_timeouts(&self, now: i64) {
        self.results.lock().unwrap().clear_timeouts(now);
    }

    /// Outstanding unacknowledged pushes.
    pub fn waiting_count(&self) -> usize {
        self.results.lock().unwrap().waiting_count()
    }
}

impl Drop for FollowerChannel {
    fn drop(&mut self) {
        self.results.lock().unwrap().clear_all();
    }
}

pub struct BinlogProducer {
    followers: spin::RwLock<Vec<Arc<FollowerChannel>>>,
    ring_size: usize,
    network_timeout: i64,
}

impl BinlogProducer {
    pub fn new(ring_size: usize, network_timeout: i64) -> Arc<Self> {
        Arc::new(Self {
            followers: spin::RwLock::new(Vec::new()),
            ring_size,
            network_timeout,
        })
    }

    pub fn register_follower(&self, name: &str) -> Arc<FollowerChannel> {
        let channel = Arc::new(FollowerChannel::new(
            name,
            self.ring_size,
            self.network_timeout,
        ));
        self.followers.write().push(channel.clone());
        channel
    }

    /// Tears one follower down, completing everything it still owed.
    pub fn remove_follower(&self, name: &str) {
        let mut followers = self.followers.write();
        if let Some(pos) = followers.iter().position(|f| f.name() == name) {
            let channel = followers.remove(pos);
            channel.results.lock().unwrap().clear_all();
        }
    }

    pub fn follower_count(&self) -> usize {
        self.followers.read().len()
    }

    /// Replicates one successful mutation. The record's waiter (if any)
    /// is armed with the follower count and tracked per channel.
    pub fn dispatch(&self, record: &Record) {
        let followers = self.followers.read().clone();
        let waiter: Option<Arc<RpcWaiter>> = record.waiter.clone();
        if let Some(waiter) = &waiter {
            waiter.set_waiting_count(followers.len() as i32);
        }
        if followers.is_empty() {
            return;
        }

        let buffer = Arc::new(RecordBuffer {
            data_version: record.data_version,
            buffer: pack_record(record),
        });
        for channel in followers {
            channel.pending.push(buffer.clone());
            channel
                .results
                .lock()
                .unwrap()
                .add(record.data_version, waiter.clone());
        }
    }

    /// Periodic maintenance across every channel.
    pub fn clear_timeouts(&self) {
        let now = time::current_secs();
        for channel in self.followers.read().iter() {
            channel.clear_timeouts(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::record::RecordOperation;

    fn mutation(version: u64) -> Box<Record> {
        let mut record = Record::new(RecordOperation::Create, "fs").with_path("/f");
        record.data_version = version;
        record
    }

    #[test]
    fn dispatch_reaches_every_follower() {
        let producer = BinlogProducer::new(64, 3600);
        let a = producer.register_follower("a");
        let b = producer.register_follower("b");

        let waiter = RpcWaiter::new();
        let record = mutation(100).with_waiter(waiter.clone());
        producer.dispatch(&record);

        assert_eq!(waiter.waiting_count(), 2);
        let pending = a.take_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].data_version, 100);
        let fields = serializer::unpack(&pending[0].buffer).unwrap();
        assert!(fields.iter().any(|f| f.id == RB_FIELD_VERSION));

        a.ack(100).unwrap();
        assert_eq!(waiter.waiting_count(), 1);
        b.ack(100).unwrap();
        assert!(waiter.wait_ready(Duration::from_millis(10)));
        assert_eq!(a.waiting_count(), 0);
        assert_eq!(b.waiting_count(), 0);
    }

    #[test]
    fn removing_a_follower_completes_its_waiters() {
        let producer = BinlogProducer::new(64, 3600);
        producer.register_follower("a");
        let waiter = RpcWaiter::new();
        let record = mutation(7).with_waiter(waiter.clone());
        producer.dispatch(&record);
        assert_eq!(waiter.waiting_count(), 1);

        producer.remove_follower("a");
        assert_eq!(producer.follower_count(), 0);
        assert_eq!(waiter.waiting_count(), 0);
    }

    #[test]
    fn no_followers_means_nothing_outstanding() {
        let producer = BinlogProducer::new(64, 3600);
        let waiter = RpcWaiter::new();
        let record = mutation(1).with_waiter(waiter.clone());
        producer.dispatch(&record);
        assert!(waiter.wait_ready(Duration::from_millis(1)));
    }
}
