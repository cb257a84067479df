// SPDX-License-Identifier: MPL-2.0

//! The data thread pool.
//!
//! The namespace space is partitioned over N single-threaded shards;
//! every record is routed to the shard owning its namespace (or inode)
//! and processed there in strict FIFO order. Records complete through
//! their callback exactly once, successful mutations get a data version
//! and fan out to persistence and replication.

pub mod free_queue;
pub mod queue;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
    thread,
    time::Duration,
};

use crate::{
    config::{ErrorMode, ServerConfig},
    meta::{
        dentry::{Dentry, DentryManager},
        inode_index::{InodeGenerator, InodeIndex},
        namespace::NamespaceRegistry,
        types::mode,
    },
    notify::{self, ChangeNotify},
    prelude::*,
    record::{DentryRouteType, Record, RecordOperation, RecordOutcome},
    replication::BinlogProducer,
    time,
};

use self::{
    free_queue::{DelayFreeQueue, ImmediateFreeQueue},
    queue::BatchQueue,
};

/// Process-wide continue flag. Fatal subsystem errors trip it; every
/// worker thread observes it between iterations.
#[derive(Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn should_continue(&self) -> bool {
        !self.0.load(Ordering::Relaxed)
    }

    pub fn trigger(&self) {
        if !self.0.swap(true, Ordering::Relaxed) {
            warn!("shutdown triggered");
        }
    }
}

/// The global monotonic counters: data versions for mutations, event ids
/// for change-notify messages.
#[derive(Default)]
pub struct ServerVersions {
    data: AtomicU64,
    event: AtomicU64,
}

impl ServerVersions {
    pub fn next_data(&self) -> u64 {
        self.data.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// CAS-max: replayed records carry their own version and only ever
    /// move the counter forward.
    pub fn advance_data_to(&self, version: u64) {
        let mut current = self.data.load(Ordering::Relaxed);
        while version > current {
            match self.data.compare_exchange(
                current,
                version,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn current_data(&self) -> u64 {
        self.data.load(Ordering::Relaxed)
    }

    pub fn next_event(&self) -> u64 {
        self.event.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current_event(&self) -> u64 {
        self.event.load(Ordering::Relaxed)
    }
}

/// Routes cross-thread dentry releases back to the owning shard's
/// immediate-free queue.
pub struct FreeRouter {
    queues: Vec<Arc<ImmediateFreeQueue>>,
}

impl FreeRouter {
    pub(crate) fn new(queues: Vec<Arc<ImmediateFreeQueue>>) -> Self {
        Self { queues }
    }

    pub fn release_dentry(&self, dentry: Arc<Dentry>) {
        let index = dentry.hash_code() as usize % self.queues.len();
        self.queues[index].defer_drop(dentry);
    }
}

/// The shared half of one shard: everything producers touch.
pub struct DataShard {
    index: usize,
    queue: BatchQueue<Box<Record>>,
    immediate_free: Arc<ImmediateFreeQueue>,
    manager: DentryManager,
    last_data_version: AtomicU64,
}

impl DataShard {
    pub fn manager(&self) -> &DentryManager {
        &self.manager
    }

    pub fn immediate_free(&self) -> &Arc<ImmediateFreeQueue> {
        &self.immediate_free
    }

    pub fn last_data_version(&self) -> u64 {
        self.last_data_version.load(Ordering::Relaxed)
    }
}

pub struct DataThreadPool {
    shards: Vec<Arc<DataShard>>,
    registry: Arc<NamespaceRegistry>,
    inode_index: Arc<InodeIndex>,
    versions: Arc<ServerVersions>,
    error_mode: ErrorMode,
    delay_free_seconds: i64,
    notify: spin::RwLock<Option<Arc<ChangeNotify>>>,
    producer: spin::RwLock<Option<Arc<BinlogProducer>>>,
    shutdown: Shutdown,
    running: Arc<AtomicUsize>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl DataThreadPool {
    pub fn new(config: &ServerConfig, shutdown: Shutdown) -> Arc<Self> {
        let count = config.data_threads.max(1);
        let registry = Arc::new(NamespaceRegistry::new(count));
        let inode_index = Arc::new(InodeIndex::new());
        let inode_gen = Arc::new(InodeGenerator::new(count));

        let shards = (0..count)
            .map(|index| {
                Arc::new(DataShard {
                    index,
                    queue: BatchQueue::new(),
                    immediate_free: Arc::new(ImmediateFreeQueue::default()),
                    manager: DentryManager::new(
                        index,
                        registry.clone(),
                        inode_index.clone(),
                        inode_gen.clone(),
                    ),
                    last_data_version: AtomicU64::new(0),
                })
            })
            .collect();

        Arc::new(Self {
            shards,
            registry,
            inode_index,
            versions: Arc::new(ServerVersions::default()),
            error_mode: config.error_mode,
            delay_free_seconds: config.delay_free_seconds,
            notify: spin::RwLock::new(None),
            producer: spin::RwLock::new(None),
            shutdown,
            running: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().unwrap();
        for shard in &self.shards {
            let worker = ShardWorker {
                pool: self.clone(),
                shard: shard.clone(),
                delay_free: DelayFreeQueue::new(self.delay_free_seconds),
                list_cache: Vec::new(),
            };
            let handle = thread::Builder::new()
                .name(format!("data[{}]", shard.index))
                .spawn(move || worker.run())
                .expect("spawn data thread");
            handles.push(handle);
        }
    }

    /// Hands a record to its owning shard. The shard's responsibility
    /// ends when the record's callback has run exactly once.
    pub fn submit(&self, record: Box<Record>) {
        let index = self.route(&record);
        self.shards[index].queue.push(record);
    }

    fn route(&self, record: &Record) -> usize {
        let count = self.shards.len();
        match record.dentry_type {
            DentryRouteType::Inode if record.inode > 0 => record.inode as usize % count,
            _ => record.hash_code as usize % count,
        }
    }

    /// Terminates every shard queue and joins the workers. Queued
    /// records are drained once before exit.
    pub fn terminate(&self) {
        for shard in &self.shards {
            shard.queue.terminate();
        }
        let handles = core::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Aggregated (ns, dir, file) counts across all shards.
    pub fn sum_counters(&self) -> (i64, i64, i64) {
        let mut totals = (0, 0, 0);
        for shard in &self.shards {
            let (ns, dir, file) = shard.manager.counters.snapshot();
            totals.0 += ns;
            totals.1 += dir;
            totals.2 += file;
        }
        totals
    }

    pub fn attach_producer(&self, producer: Arc<BinlogProducer>) {
        *self.producer.write() = Some(producer);
    }

    /// Wires the change-notify collector in; must happen before
    /// `start` so no mutation misses its event.
    pub fn attach_notify(&self, notify: Arc<ChangeNotify>) {
        *self.notify.write() = Some(notify);
    }

    pub fn free_router(&self) -> Arc<FreeRouter> {
        Arc::new(FreeRouter::new(
            self.shards
                .iter()
                .map(|s| s.immediate_free.clone())
                .collect(),
        ))
    }

    pub fn versions(&self) -> &Arc<ServerVersions> {
        &self.versions
    }

    pub fn registry(&self) -> &Arc<NamespaceRegistry> {
        &self.registry
    }

    pub fn inode_index(&self) -> &Arc<InodeIndex> {
        &self.inode_index
    }

    pub fn shards(&self) -> &[Arc<DataShard>] {
        &self.shards
    }

    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }
}

/// The worker-local half of a shard: state only its thread touches.
struct ShardWorker {
    pool: Arc<DataThreadPool>,
    shard: Arc<DataShard>,
    delay_free: DelayFreeQueue,
    list_cache: Vec<Arc<Dentry>>,
}

impl ShardWorker {
    fn run(mut self) {
        self.pool.running.fetch_add(1, Ordering::Relaxed);

        loop {
            let (records, terminated) = self.shard.queue.pop_all(Duration::from_secs(1));
            for record in records {
                self.deal_record(record);
            }

            self.delay_free.reclaim(time::current_secs());
            if self.shard.immediate_free.waiting_count() > 0 {
                self.shard.immediate_free.drain();
            }

            if terminated || !self.pool.shutdown.should_continue() {
                for record in self.shard.queue.try_pop_all() {
                    self.deal_record(record);
                }
                self.delay_free.reclaim_all();
                self.shard.immediate_free.drain();
                break;
            }
        }

        self.pool.running.fetch_sub(1, Ordering::Relaxed);
    }

    fn deal_record(&mut self, record: Box<Record>) {
        if record.operation.is_update() {
            self.deal_update(record);
        } else {
            self.deal_query(record);
        }
    }

    fn deal_update(&mut self, mut record: Box<Record>) {
        record.affected.clear();
        let mut ignore_errno = None;

        let manager = &self.shard.manager;
        let index = &self.pool.inode_index;
        let result: Result<()> = match record.operation {
            RecordOperation::Create => manager.resolve_record_parent(&mut record).and_then(|_| {
                if mode::is_hard_link(record.stat.mode) {
                    manager.resolve_hdlink_src(&mut record)?;
                }
                ignore_errno = Some(Errno::EEXIST);
                manager.create(&mut record)
            }),
            RecordOperation::Remove => manager.resolve_record_parent(&mut record).and_then(|_| {
                ignore_errno = Some(Errno::ENOENT);
                manager.remove(&mut record, &mut self.delay_free)
            }),
            RecordOperation::Rename => manager
                .resolve_rename_parents(&mut record)
                .and_then(|_| manager.rename(&mut record, &mut self.delay_free)),
            RecordOperation::Update => index.update_dentry(&record).map(|dentry| {
                record.me.dentry = Some(dentry);
            }),
            RecordOperation::SetXattr => manager
                .resolve_xattr_target(&mut record)
                .and_then(|_| index.set_xattr(&record)),
            RecordOperation::RemoveXattr => {
                ignore_errno = Some(Errno::ENODATA);
                manager.resolve_xattr_target(&mut record).and_then(|_| {
                    let dentry = record.me.dentry.clone().unwrap();
                    index.remove_xattr(&dentry, &record.xattr.key)
                })
            }
            RecordOperation::SetDentrySize => {
                ignore_errno = Some(Errno::EEXIST);
                index.check_set_dentry_size(&mut record).and_then(|(dentry, modified)| {
                    record.me.dentry = Some(dentry);
                    if modified {
                        Ok(())
                    } else {
                        Err(Error::new(Errno::EEXIST))
                    }
                })
            }
            _ => Ok(()),
        };

        let versions = &self.pool.versions;
        let (errno, is_error) = match &result {
            Ok(()) => {
                if record.data_version == 0 {
                    record.data_version = versions.next_data();
                } else {
                    versions.advance_data_to(record.data_version);
                }
                (None, false)
            }
            Err(e) => {
                let suppressed = self.pool.error_mode == ErrorMode::Loose
                    && ignore_errno == Some(e.error());
                if record.data_version > 0 && suppressed {
                    versions.advance_data_to(record.data_version);
                }
                (Some(e.error()), !suppressed)
            }
        };

        if result.is_ok() {
            if record.data_version > self.shard.last_data_version() {
                self.shard
                    .last_data_version
                    .store(record.data_version, Ordering::Relaxed);
            }

            if let Some(notify) = self.pool.notify.read().clone() {
                let pushed = notify::build_event(&record, versions, notify.pool())
                    .and_then(|event| notify.push(event));
                if let Err(e) = pushed {
                    error!("pushing to the db update queue failed ({e}), shutting down");
                    self.pool.shutdown.trigger();
                }
            }
        }

        if record.data_version > 0 && !is_error {
            if let Some(producer) = self.pool.producer.read().clone() {
                producer.dispatch(&record);
            }
        }

        if let Some(notify) = record.take_notify() {
            notify(record, RecordOutcome { errno, is_error });
        }
    }

    fn deal_query(&mut self, mut record: Box<Record>) {
        let manager = &self.shard.manager;
        let index = &self.pool.inode_index;

        let result: Result<()> = (|| {
            match record.operation {
                RecordOperation::Stat
                | RecordOperation::LookupInode
                | RecordOperation::ReadLink
                | RecordOperation::GetXattr
                | RecordOperation::ListXattr => {
                    let dentry = match record.dentry_type {
                        DentryRouteType::Inode => index
                            .get(record.inode)
                            .ok_or(Error::new(Errno::ENOENT))?,
                        DentryRouteType::Pname => index
                            .get_by_pname(record.me.parent_inode, &record.me.name)
                            .ok_or(Error::new(Errno::ENOENT))?,
                        DentryRouteType::Fullname => {
                            manager.find_by_path(&record.ns, &record.me.path, true)?
                        }
                    };
                    record.inode = dentry.inode();

                    match record.operation {
                        RecordOperation::GetXattr => {
                            record.output.xattr_value =
                                Some(index.get_xattr(&dentry, &record.xattr.key)?);
                        }
                        RecordOperation::ListXattr => {
                            record.output.xattr_names = Some(index.list_xattr(&dentry));
                        }
                        RecordOperation::ReadLink => match dentry.link_target() {
                            Some(target) => record.output.link = Some(target.to_string()),
                            None => return_errno!(Errno::EINVAL),
                        },
                        _ => {}
                    }
                    record.me.dentry = Some(dentry);
                    Ok(())
                }
                RecordOperation::List => {
                    let dentry = match record.dentry_type {
                        DentryRouteType::Inode => index
                            .get(record.inode)
                            .ok_or(Error::new(Errno::ENOENT))?,
                        _ => manager.find_by_path(&record.ns, &record.me.path, true)?,
                    };
                    self.list_cache.clear();
                    manager.list(&dentry, &mut self.list_cache);
                    record.output.dentries = self.list_cache.clone();
                    record.me.dentry = Some(dentry);
                    Ok(())
                }
                _ => return_errno!(Errno::EOPNOTSUPP),
            }
        })();

        let outcome = RecordOutcome {
            errno: result.err().map(|e| e.error()),
            is_error: result.is_err(),
        };
        if let Some(notify) = record.take_notify() {
            notify(record, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_counter_is_monotonic() {
        let versions = ServerVersions::default();
        assert_eq!(versions.next_data(), 1);
        assert_eq!(versions.next_data(), 2);

        versions.advance_data_to(10);
        assert_eq!(versions.current_data(), 10);
        // Lower replays never move the counter backwards.
        versions.advance_data_to(5);
        assert_eq!(versions.current_data(), 10);
        assert_eq!(versions.next_data(), 11);
    }

    #[test]
    fn event_counter_is_monotonic() {
        let versions = ServerVersions::default();
        let a = versions.next_event();
        let b = versions.next_event();
        assert!(a < b);
        assert_eq!(versions.current_event(), b);
    }

    #[test]
    fn shutdown_flag_flips_once() {
        let shutdown = Shutdown::new();
        assert!(shutdown.should_continue());
        shutdown.trigger();
        assert!(!shutdown.should_continue());
        shutdown.trigger();
        assert!(!shutdown.should_continue());
    }
}
