// SPDX-License-Identifier: MPL-2.0

//! Top-level assembly: wires the data thread pool, the change-notify
//! collector, the data-sync workers, the binlog write thread and the
//! replication producer together.

use crate::{
    config::ServerConfig,
    notify::{serializer::BufferPool, ChangeNotify},
    prelude::*,
    record::Record,
    replication::BinlogProducer,
    shard::{DataThreadPool, Shutdown},
    storage::{
        binlog_write::BinlogWriteThread,
        data_sync::{BinlogSink, DataSyncPool},
        types::MemSegmentIndex,
    },
};

pub struct MetaServer {
    shutdown: Shutdown,
    pool: Arc<DataThreadPool>,
    producer: Arc<BinlogProducer>,
    notify: Option<Arc<ChangeNotify>>,
    data_sync: Option<Arc<DataSyncPool>>,
    binlog_write: Option<Arc<BinlogWriteThread>>,
}

impl MetaServer {
    /// Brings the whole core up. With storage configured, the
    /// persistence pipeline is wired before the first shard starts so
    /// no mutation can miss it.
    pub fn start(config: ServerConfig) -> Result<Arc<Self>> {
        let shutdown = Shutdown::new();
        let pool = DataThreadPool::new(&config, shutdown.clone());
        let producer = BinlogProducer::new(
            config.push_result_ring_size,
            config.network_timeout_seconds,
        );
        pool.attach_producer(producer.clone());

        let mut notify = None;
        let mut data_sync = None;
        let mut binlog_write = None;
        if let Some(storage) = &config.storage {
            let buffers = Arc::new(BufferPool::default());
            let write = BinlogWriteThread::new(
                &storage.path,
                storage.binlog_buffer_size,
                Arc::new(MemSegmentIndex::default()),
                buffers.clone(),
                shutdown.clone(),
            );
            write.start()?;

            let sink = Arc::new(BinlogSink::new(write.clone(), storage.data_sync_threads));
            let sync = DataSyncPool::start(
                storage.data_sync_threads,
                sink,
                pool.free_router(),
                buffers.clone(),
                shutdown.clone(),
            );
            let collector = ChangeNotify::start(sync.clone(), buffers, shutdown.clone());
            pool.attach_notify(collector.clone());

            notify = Some(collector);
            data_sync = Some(sync);
            binlog_write = Some(write);
        }

        pool.start();
        Ok(Arc::new(Self {
            shutdown,
            pool,
            producer,
            notify,
            data_sync,
            binlog_write,
        }))
    }

    pub fn submit(&self, record: Box<Record>) {
        self.pool.submit(record);
    }

    pub fn pool(&self) -> &Arc<DataThreadPool> {
        &self.pool
    }

    pub fn producer(&self) -> &Arc<BinlogProducer> {
        &self.producer
    }

    pub fn data_sync(&self) -> Option<&Arc<DataSyncPool>> {
        self.data_sync.as_ref()
    }

    pub fn binlog_write(&self) -> Option<&Arc<BinlogWriteThread>> {
        self.binlog_write.as_ref()
    }

    /// Orderly shutdown, upstream first so every stage drains fully.
    pub fn stop(&self) {
        self.pool.terminate();
        if let Some(notify) = &self.notify {
            notify.terminate();
        }
        if let Some(sync) = &self.data_sync {
            sync.terminate();
        }
        if let Some(write) = &self.binlog_write {
            write.terminate();
        }
        self.shutdown.trigger();
    }
}
