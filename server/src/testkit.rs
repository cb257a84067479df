// SPDX-License-Identifier: MPL-2.0

//! Shared unit-test fixtures: a single-shard tree driven directly,
//! without worker threads.

use crate::{
    meta::{
        dentry::{Dentry, DentryManager},
        inode_index::{InodeGenerator, InodeIndex},
        namespace::NamespaceRegistry,
        types::{mode, DentryStat, RenameFlags},
    },
    prelude::*,
    record::{Record, RecordOperation},
    shard::{free_queue::ImmediateFreeQueue, FreeRouter},
};

pub const TEST_NS: &str = "fs";

pub struct TestTree {
    pub mgr: DentryManager,
    immediate: Arc<ImmediateFreeQueue>,
}

impl TestTree {
    pub fn new() -> Self {
        let registry = Arc::new(NamespaceRegistry::new(1));
        let index = Arc::new(InodeIndex::new());
        let generator = Arc::new(InodeGenerator::new(1));
        Self {
            mgr: DentryManager::new(0, registry, index, generator),
            immediate: Arc::new(ImmediateFreeQueue::default()),
        }
    }

    pub fn free_router(&self) -> Arc<FreeRouter> {
        Arc::new(FreeRouter::new(vec![self.immediate.clone()]))
    }

    pub fn immediate_waiting(&self) -> usize {
        self.immediate.waiting_count()
    }

    pub fn create_record(&self, path: &str, file_mode: u32, size: i64) -> Box<Record> {
        let stat = DentryStat {
            mode: file_mode,
            size,
            ..Default::default()
        };
        Record::new(RecordOperation::Create, TEST_NS)
            .with_path(path)
            .with_stat(stat)
    }

    pub fn plain_record(&self, operation: RecordOperation, path: &str) -> Box<Record> {
        Record::new(operation, TEST_NS).with_path(path)
    }

    /// A remove record with its parent already resolved.
    pub fn remove_record(&self, path: &str) -> Box<Record> {
        let mut record = Record::new(RecordOperation::Remove, TEST_NS).with_path(path);
        self.mgr.resolve_record_parent(&mut record).unwrap();
        record
    }

    /// A rename record with both parents already resolved.
    pub fn rename_record(&self, src: &str, dest: &str, flags: RenameFlags) -> Box<Record> {
        let mut record = Record::new(RecordOperation::Rename, TEST_NS)
            .with_rename_paths(src, dest)
            .with_rename_flags(flags);
        self.mgr.resolve_rename_parents(&mut record).unwrap();
        record
    }

    pub fn resolve_parent_for_create(&self, record: &mut Record) -> Result<()> {
        self.mgr.resolve_record_parent(record)
    }

    fn apply_create(&self, mut record: Box<Record>) -> Arc<Dentry> {
        self.mgr.resolve_record_parent(&mut record).unwrap();
        if mode::is_hard_link(record.stat.mode) {
            self.mgr.resolve_hdlink_src(&mut record).unwrap();
        }
        self.mgr.create(&mut record).unwrap();
        record.me.dentry.clone().unwrap()
    }

    pub fn mkdir(&self, path: &str) -> Arc<Dentry> {
        self.apply_create(self.create_record(path, mode::IFDIR | 0o755, 0))
    }

    pub fn mkfile(&self, path: &str, size: i64) -> Arc<Dentry> {
        self.apply_create(self.create_record(path, mode::IFREG | 0o644, size))
    }

    pub fn symlink(&self, path: &str, target: &str) -> Arc<Dentry> {
        let record = self
            .create_record(path, mode::IFLNK | 0o777, 0)
            .with_link(target);
        self.apply_create(record)
    }

    pub fn hardlink(&self, path: &str, src: &Arc<Dentry>) -> Arc<Dentry> {
        let src_path = self.mgr.full_path(src).unwrap();
        let record = self
            .create_record(path, mode::HARD_LINK, 0)
            .with_hdlink_path(&src_path);
        self.apply_create(record)
    }
}
