// SPDX-License-Identifier: MPL-2.0

//! Data-sync workers: sharded queues between the change-notify collector
//! and the persistence sink. Each worker stores its merged dentry
//! updates, waits for durability, then releases the dentry holds back to
//! their owning shards.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    thread,
    time::Duration,
};

use crate::{
    meta::types::{OpType, PieceField},
    notify::serializer::BufferPool,
    prelude::*,
    shard::{queue::BatchQueue, FreeRouter, Shutdown},
    storage::{
        binlog_write::{BinlogWriteThread, SyncCounter},
        types::{DbUpdateDentry, PieceFieldInfo},
    },
};

/// Where merged dentry updates go to become durable.
pub trait PersistenceSink: Send + Sync {
    fn store(&self, worker: usize, update: &mut DbUpdateDentry) -> Result<()>;
    /// Blocks until everything stored by `worker` so far is durable.
    fn flush(&self, worker: usize) -> Result<()>;
}

/// Default sink: one piece-field update per present buffer, pushed into
/// the binlog write thread under the worker's sync counter.
pub struct BinlogSink {
    write: Arc<BinlogWriteThread>,
    syncs: Vec<Arc<SyncCounter>>,
}

impl BinlogSink {
    pub fn new(write: Arc<BinlogWriteThread>, workers: usize) -> Self {
        Self {
            write,
            syncs: (0..workers.max(1))
                .map(|_| Arc::new(SyncCounter::default()))
                .collect(),
        }
    }
}

impl PersistenceSink for BinlogSink {
    fn store(&self, worker: usize, update: &mut DbUpdateDentry) -> Result<()> {
        let sync = &self.syncs[worker];

        if update.op == OpType::Remove {
            sync.add(1);
            return self.write.push(
                PieceFieldInfo {
                    inode: update.inode,
                    field: PieceField::Basic,
                    op: OpType::Remove,
                    version: update.version,
                    buffer: None,
                },
                Vec::new(),
                Some(sync.clone()),
            );
        }

        for (index, slot) in update.fields.iter_mut().enumerate() {
            let Some(buffer) = slot.take() else {
                continue;
            };
            let field = match index {
                0 => PieceField::Basic,
                1 => PieceField::Children,
                _ => PieceField::Xattr,
            };
            sync.add(1);
            self.write.push(
                PieceFieldInfo {
                    inode: update.inode,
                    field,
                    op: update.op,
                    version: update.version,
                    buffer: Some(buffer),
                },
                Vec::new(),
                Some(sync.clone()),
            )?;
        }
        Ok(())
    }

    fn flush(&self, worker: usize) -> Result<()> {
        self.syncs[worker].wait();
        Ok(())
    }
}

pub struct DataSyncPool {
    queues: Vec<Arc<BatchQueue<DbUpdateDentry>>>,
    finished: AtomicU64,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl DataSyncPool {
    pub fn start(
        workers: usize,
        sink: Arc<dyn PersistenceSink>,
        router: Arc<FreeRouter>,
        pool: Arc<BufferPool>,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        let workers = workers.max(1);
        let queues: Vec<_> = (0..workers).map(|_| Arc::new(BatchQueue::new())).collect();

        let this = Arc::new(Self {
            queues: queues.clone(),
            finished: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
        });

        let mut handles = this.handles.lock().unwrap();
        for (index, queue) in queues.into_iter().enumerate() {
            let this = this.clone();
            let sink = sink.clone();
            let router = router.clone();
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("data-sync{index:02}"))
                .spawn(move || loop {
                    let (updates, terminated) = queue.pop_all(Duration::from_secs(1));
                    if !updates.is_empty() {
                        this.deal_updates(index, updates, &sink, &router, &pool, &shutdown);
                    }
                    if terminated || !shutdown.should_continue() {
                        let rest = queue.try_pop_all();
                        if !rest.is_empty() {
                            this.deal_updates(index, rest, &sink, &router, &pool, &shutdown);
                        }
                        break;
                    }
                })
                .expect("spawn data-sync thread");
            handles.push(handle);
        }
        drop(handles);
        this
    }

    /// Routes one merged dentry update to its worker by inode.
    pub fn dispatch(&self, update: DbUpdateDentry) {
        let index = update.inode as usize % self.queues.len();
        self.queues[index].push(update);
    }

    fn deal_updates(
        &self,
        worker: usize,
        updates: Vec<DbUpdateDentry>,
        sink: &Arc<dyn PersistenceSink>,
        router: &Arc<FreeRouter>,
        pool: &Arc<BufferPool>,
        shutdown: &Shutdown,
    ) {
        let count = updates.len() as u64;
        for mut update in updates {
            if let Err(e) = sink.store(worker, &mut update) {
                error!("storing dentry update failed ({e}), shutting down");
                shutdown.trigger();
            }
            // Whatever the sink did not consume goes back to the pool.
            for slot in update.fields.iter_mut() {
                if let Some(buffer) = slot.take() {
                    pool.release(buffer);
                }
            }
            for hold in update.holds.drain(..) {
                router.release_dentry(hold);
            }
        }

        if let Err(e) = sink.flush(worker) {
            error!("flushing dentry updates failed ({e}), shutting down");
            shutdown.trigger();
        }
        self.finished.fetch_add(count, Ordering::Relaxed);
    }

    /// Total merged updates persisted so far.
    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }

    pub fn terminate(&self) {
        for queue in &self.queues {
            queue.terminate();
        }
        let handles = core::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::SegmentIndex;

    /// Sink that records the piece-fields it saw.
    struct RecordingSink {
        stored: spin::Mutex<Vec<(u64, usize)>>,
    }

    impl PersistenceSink for RecordingSink {
        fn store(&self, _worker: usize, update: &mut DbUpdateDentry) -> Result<()> {
            let fields = update.fields.iter().filter(|f| f.is_some()).count();
            self.stored.lock().push((update.inode, fields));
            Ok(())
        }

        fn flush(&self, _worker: usize) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn updates_flow_to_the_sink_and_release_holds() {
        let env = crate::testkit::TestTree::new();
        env.mkdir("/");
        let file = env.mkfile("/f", 1);

        let sink = Arc::new(RecordingSink {
            stored: spin::Mutex::new(Vec::new()),
        });
        let shutdown = Shutdown::new();
        let router = env.free_router();
        let pool = Arc::new(BufferPool::default());
        let sync_pool = DataSyncPool::start(
            2,
            sink.clone(),
            router,
            pool.clone(),
            shutdown.clone(),
        );

        let mut update = DbUpdateDentry::new(5, file.inode(), 1);
        update.fields[0] = Some(vec![1, 2, 3]);
        update.holds.push(file.clone());
        sync_pool.dispatch(update);

        while sync_pool.finished() < 1 {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sink.stored.lock().as_slice(), &[(file.inode(), 1)]);
        // The unconsumed buffer was pooled and the hold was routed to
        // the shard's immediate-free queue.
        assert_eq!(pool.pooled(), 1);
        assert_eq!(env.immediate_waiting(), 1);

        sync_pool.terminate();
        shutdown.trigger();
    }

    #[test]
    fn binlog_sink_emits_one_push_per_field() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = Shutdown::new();
        let pool = Arc::new(BufferPool::default());
        let segment_index: Arc<dyn SegmentIndex> =
            Arc::new(crate::storage::types::MemSegmentIndex::default());
        let write = BinlogWriteThread::new(
            dir.path(),
            64 * 1024,
            segment_index,
            pool.clone(),
            shutdown.clone(),
        );
        write.start().unwrap();

        let sink = BinlogSink::new(write.clone(), 1);
        let mut update = DbUpdateDentry::new(9, 42, 1);
        update.fields[0] = Some(vec![1]);
        update.fields[2] = Some(vec![2]);
        sink.store(0, &mut update).unwrap();
        sink.flush(0).unwrap();

        let logged = write.fields_logged();
        assert_eq!(logged.len(), 2);
        assert!(logged.contains(&(42, 0, 9)));
        assert!(logged.contains(&(42, 2, 9)));

        write.terminate();
    }
}
