// SPDX-License-Identifier: MPL-2.0

//! The binlog write thread.
//!
//! Update records drain in batches: each batch is staged into the field
//! and space redo logs (crash recovery), pushed into the inode-binlog
//! and trunk-space writer queues, and only after both writers have
//! drained are the records' sync counters notified. Log I/O failures
//! are fatal.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Condvar, Mutex},
    thread,
    time::Duration,
};

use crate::{
    notify::serializer::BufferPool,
    prelude::*,
    shard::{queue::BatchQueue, Shutdown},
    storage::{
        safe_file::SafeWriteFile,
        types::{
            decode_space_redo, encode_field_redo, encode_space_redo, PieceFieldInfo,
            SegmentIndex, SpaceLogRecord, MAX_RECORD_SIZE,
        },
    },
};

const FIELD_REDO_FILENAME: &str = "field.redo";
const FIELD_TMP_FILENAME: &str = ".field.tmp";
const SPACE_REDO_FILENAME: &str = "space.redo";
const SPACE_TMP_FILENAME: &str = ".space.tmp";

/// Counts outstanding persistence operations for one waiter; `wait`
/// returns once every `add` has been matched by a `notify`.
#[derive(Default)]
pub struct SyncCounter {
    count: Mutex<i64>,
    cond: Condvar,
}

impl SyncCounter {
    pub fn add(&self, n: i64) {
        *self.count.lock().unwrap() += n;
    }

    pub fn notify(&self, n: i64) {
        let mut count = self.count.lock().unwrap();
        *count -= n;
        if *count <= 0 {
            self.cond.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.cond.wait(count).unwrap();
        }
    }
}

/// A downstream log writer: its own thread, a waiting count published by
/// the binlog write thread, and a drained signal.
pub struct WriterQueue<T: Send + 'static> {
    queue: Arc<BatchQueue<T>>,
    waiting: Arc<SyncCounter>,
}

impl<T: Send + 'static> WriterQueue<T> {
    pub fn start(
        name: &str,
        shutdown: Shutdown,
        mut sink: impl FnMut(T) + Send + 'static,
    ) -> Self {
        let queue = Arc::new(BatchQueue::new());
        let waiting = Arc::new(SyncCounter::default());

        let worker_queue: Arc<BatchQueue<T>> = queue.clone();
        let worker_waiting = waiting.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                let (items, terminated) = worker_queue.pop_all(Duration::from_secs(1));
                let count = items.len() as i64;
                for item in items {
                    sink(item);
                }
                if count > 0 {
                    worker_waiting.notify(count);
                }
                if terminated || !shutdown.should_continue() {
                    for item in worker_queue.try_pop_all() {
                        sink(item);
                    }
                    // Unblock anyone still waiting for a drain.
                    worker_waiting.notify(i64::MAX / 2);
                    break;
                }
            })
            .expect("spawn writer thread");

        Self { queue, waiting }
    }

    /// Must be called before the matching `push`es.
    pub fn inc_waiting(&self, n: i64) {
        self.waiting.add(n);
    }

    pub fn push(&self, item: T) {
        self.queue.push(item);
    }

    pub fn wait_drained(&self) {
        self.waiting.wait();
    }

    pub fn terminate(&self) {
        self.queue.terminate();
    }
}

/// Stand-in for the trunk space log: applies space records in order and
/// supports redo-file replay on startup.
pub struct TrunkSpaceLog {
    writer: WriterQueue<SpaceLogRecord>,
    applied: Arc<spin::Mutex<Vec<SpaceLogRecord>>>,
}

impl TrunkSpaceLog {
    pub fn start(shutdown: Shutdown) -> Arc<Self> {
        let applied = Arc::new(spin::Mutex::new(Vec::new()));
        let sink_applied = applied.clone();
        let writer = WriterQueue::start("space-log", shutdown, move |record| {
            sink_applied.lock().push(record);
        });
        Arc::new(Self { writer, applied })
    }

    pub fn inc_waiting(&self, n: i64) {
        self.writer.inc_waiting(n);
    }

    pub fn push_chain(&self, chain: Vec<SpaceLogRecord>) {
        for record in chain {
            self.writer.push(record);
        }
    }

    pub fn wait_drained(&self) {
        self.writer.wait_drained();
    }

    /// Replays a space redo file left over from an unclean shutdown.
    pub fn redo(&self, path: &Path) -> Result<usize> {
        let data = fs::read(path)?;
        let records = decode_space_redo(&data)?;
        let count = records.len();
        self.applied.lock().extend(records);
        info!("space redo replayed {count} records from {}", path.display());
        Ok(count)
    }

    pub fn applied(&self) -> Vec<SpaceLogRecord> {
        self.applied.lock().clone()
    }

    fn terminate(&self) {
        self.writer.terminate();
    }
}

/// One queued update: the piece-field to log plus the space mutations it
/// implies, tied to the waiter to notify once durable.
pub struct InodeUpdateRecord {
    pub version: u64,
    pub field: PieceFieldInfo,
    pub space_chain: Vec<SpaceLogRecord>,
    pub sync: Option<Arc<SyncCounter>>,
}

struct FileBufferPair {
    file: SafeWriteFile,
    buf: Vec<u8>,
    capacity: usize,
    record_count: usize,
}

impl FileBufferPair {
    fn new(dir: &Path, name: &str, tmp_name: &str, capacity: usize) -> Self {
        Self {
            file: SafeWriteFile::new(dir, name, tmp_name),
            buf: Vec::with_capacity(capacity),
            capacity,
            record_count: 0,
        }
    }

    fn append(&mut self, encode: impl FnOnce(&mut Vec<u8>)) -> Result<()> {
        if self.capacity - self.buf.len() < MAX_RECORD_SIZE {
            self.flush()?;
        }
        encode(&mut self.buf);
        self.record_count += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.file.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.file.close()
    }
}

pub struct BinlogWriteThread {
    queue: Arc<BatchQueue<InodeUpdateRecord>>,
    segment_index: Arc<dyn SegmentIndex>,
    inode_writer: WriterQueue<PieceFieldInfo>,
    space_log: Arc<TrunkSpaceLog>,
    path: PathBuf,
    buffer_size: usize,
    shutdown: Shutdown,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    fields_logged: Arc<spin::Mutex<Vec<(u64, u8, u64)>>>,
}

impl BinlogWriteThread {
    pub fn new(
        path: &Path,
        buffer_size: usize,
        segment_index: Arc<dyn SegmentIndex>,
        pool: Arc<BufferPool>,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        let fields_logged = Arc::new(spin::Mutex::new(Vec::new()));
        let sink_logged = fields_logged.clone();
        let inode_writer = WriterQueue::start(
            "inode-binlog",
            shutdown.clone(),
            move |mut field: PieceFieldInfo| {
                sink_logged
                    .lock()
                    .push((field.inode, field.field as u8, field.version));
                if let Some(buffer) = field.buffer.take() {
                    pool.release(buffer);
                }
            },
        );
        let space_log = TrunkSpaceLog::start(shutdown.clone());

        Arc::new(Self {
            queue: Arc::new(BatchQueue::new()),
            segment_index,
            inode_writer,
            space_log,
            path: path.to_path_buf(),
            buffer_size: buffer_size.max(MAX_RECORD_SIZE * 2),
            shutdown,
            handle: Mutex::new(None),
            fields_logged,
        })
    }

    /// Replays any leftover space redo file, then starts the writer.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let space_redo = self.path.join(SPACE_REDO_FILENAME);
        if space_redo.exists() {
            self.space_log.redo(&space_redo)?;
        }

        let this = self.clone();
        let handle = thread::Builder::new()
            .name("binlog-write".to_string())
            .spawn(move || this.run())
            .expect("spawn binlog write thread");
        *self.handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Gates the update through the segment index and queues it.
    /// Not-modified updates free their chain and notify immediately.
    pub fn push(
        &self,
        field: PieceFieldInfo,
        space_chain: Vec<SpaceLogRecord>,
        sync: Option<Arc<SyncCounter>>,
    ) -> Result<()> {
        let version = self.segment_index.update(&field)?;
        if version == 0 {
            drop(space_chain);
            if let Some(sync) = sync {
                sync.notify(1);
            }
            return Ok(());
        }

        self.queue.push(InodeUpdateRecord {
            version,
            field,
            space_chain,
            sync,
        });
        Ok(())
    }

    pub fn space_log(&self) -> &Arc<TrunkSpaceLog> {
        &self.space_log
    }

    /// `(inode, field, version)` triples the inode writer has applied.
    pub fn fields_logged(&self) -> Vec<(u64, u8, u64)> {
        self.fields_logged.lock().clone()
    }

    pub fn terminate(&self) {
        self.queue.terminate();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.inode_writer.terminate();
        self.space_log.terminate();
    }

    fn run(self: Arc<Self>) {
        let mut field_redo = FileBufferPair::new(
            &self.path,
            FIELD_REDO_FILENAME,
            FIELD_TMP_FILENAME,
            self.buffer_size,
        );
        let mut space_redo = FileBufferPair::new(
            &self.path,
            SPACE_REDO_FILENAME,
            SPACE_TMP_FILENAME,
            self.buffer_size,
        );

        loop {
            let (records, terminated) = self.queue.pop_all(Duration::from_secs(1));
            if !records.is_empty() {
                if let Err(e) = self.deal_records(records, &mut field_redo, &mut space_redo) {
                    error!("writing redo logs failed ({e}), shutting down");
                    self.shutdown.trigger();
                    break;
                }
            }
            if terminated || !self.shutdown.should_continue() {
                let rest = self.queue.try_pop_all();
                if !rest.is_empty() {
                    let _ = self.deal_records(rest, &mut field_redo, &mut space_redo);
                }
                break;
            }
        }
    }

    fn deal_records(
        &self,
        records: Vec<InodeUpdateRecord>,
        field_redo: &mut FileBufferPair,
        space_redo: &mut FileBufferPair,
    ) -> Result<()> {
        field_redo.record_count = 0;
        space_redo.record_count = 0;
        field_redo.file.open()?;
        space_redo.file.open()?;

        for record in &records {
            field_redo.append(|buf| encode_field_redo(buf, &record.field))?;
            for space in &record.space_chain {
                space_redo.append(|buf| encode_space_redo(buf, space))?;
            }
        }

        field_redo.close()?;
        space_redo.close()?;

        self.inode_writer.inc_waiting(field_redo.record_count as i64);
        self.space_log.inc_waiting(space_redo.record_count as i64);

        let syncs: Vec<Option<Arc<SyncCounter>>> =
            records.iter().map(|r| r.sync.clone()).collect();
        for record in records {
            self.inode_writer.push(record.field);
            self.space_log.push_chain(record.space_chain);
        }

        self.inode_writer.wait_drained();
        self.space_log.wait_drained();

        // Coalesce notifications for runs sharing one counter.
        let mut current: Option<Arc<SyncCounter>> = None;
        let mut count = 0;
        for sync in syncs.into_iter().flatten() {
            match &current {
                Some(c) if Arc::ptr_eq(c, &sync) => count += 1,
                _ => {
                    if let Some(c) = current.take() {
                        c.notify(count);
                    }
                    current = Some(sync);
                    count = 1;
                }
            }
        }
        if let Some(c) = current {
            c.notify(count);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        meta::types::{OpType, PieceField},
        storage::types::{decode_field_redo, MemSegmentIndex},
    };

    fn field(inode: u64, version: u64) -> PieceFieldInfo {
        PieceFieldInfo {
            inode,
            field: PieceField::Basic,
            op: OpType::Create,
            version,
            buffer: None,
        }
    }

    fn space(version: u64) -> SpaceLogRecord {
        SpaceLogRecord {
            version,
            trunk_id: 1,
            offset: version * 512,
            size: 512,
            op: OpType::Create,
        }
    }

    #[test]
    fn batch_writes_redo_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = Shutdown::new();
        let write = BinlogWriteThread::new(
            dir.path(),
            64 * 1024,
            Arc::new(MemSegmentIndex::default()),
            Arc::new(BufferPool::default()),
            shutdown.clone(),
        );

        let sync = Arc::new(SyncCounter::default());
        sync.add(3);
        for i in 1..=3u64 {
            write
                .push(field(i, 100 + i), vec![space(100 + i)], Some(sync.clone()))
                .unwrap();
        }

        write.start().unwrap();
        sync.wait();

        // All three were queued before the thread started, so they form
        // one batch and the redo files hold exactly that batch.
        let data = fs::read(dir.path().join(FIELD_REDO_FILENAME)).unwrap();
        let decoded = decode_field_redo(&data).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].inode, 1);

        assert_eq!(write.space_log().applied().len(), 3);
        assert_eq!(write.fields_logged().len(), 3);

        write.terminate();
    }

    #[test]
    fn unmodified_updates_notify_without_logging() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = Shutdown::new();
        let index = Arc::new(MemSegmentIndex::default());
        let write = BinlogWriteThread::new(
            dir.path(),
            64 * 1024,
            index,
            Arc::new(BufferPool::default()),
            shutdown.clone(),
        );
        write.start().unwrap();

        let sync = Arc::new(SyncCounter::default());
        sync.add(2);
        write.push(field(7, 10), vec![], Some(sync.clone())).unwrap();
        // Same version again: gated by the segment index.
        write.push(field(7, 10), vec![], Some(sync.clone())).unwrap();
        sync.wait();

        assert_eq!(write.fields_logged().len(), 1);
        write.terminate();
    }

    #[test]
    fn startup_replays_space_redo() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = Vec::new();
        encode_space_redo(&mut buf, &space(5));
        encode_space_redo(&mut buf, &space(6));
        fs::write(dir.path().join(SPACE_REDO_FILENAME), &buf).unwrap();

        let shutdown = Shutdown::new();
        let write = BinlogWriteThread::new(
            dir.path(),
            64 * 1024,
            Arc::new(MemSegmentIndex::default()),
            Arc::new(BufferPool::default()),
            shutdown,
        );
        write.start().unwrap();

        let applied = write.space_log().applied();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].version, 5);
        write.terminate();
    }
}
