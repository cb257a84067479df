// SPDX-License-Identifier: MPL-2.0

//! Inode-keyed views of the tree: the inode → dentry index, stat update
//! helpers, xattr storage and the per-inode flock tables.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use crate::{
    meta::{
        dentry::Dentry,
        flock::FlockTable,
        types::{mode, SetStatFlags},
    },
    prelude::*,
    record::Record,
    time,
};

/// Upper bound on xattr pairs per dentry.
pub const XATTR_MAX_COUNT: usize = 64;
/// Upper bound on one xattr key.
pub const XATTR_KEY_MAX: usize = 255;
/// Upper bound on one xattr value.
pub const XATTR_VALUE_MAX: usize = 4096;

/// Allocates inodes with a shard-count stride, so that
/// `inode % shard_count` always names the owning shard.
pub struct InodeGenerator {
    next: AtomicU64,
    shard_count: u64,
}

impl InodeGenerator {
    pub fn new(shard_count: usize) -> Self {
        Self {
            next: AtomicU64::new(0),
            shard_count: shard_count.max(1) as u64,
        }
    }

    pub fn next(&self, shard_index: usize) -> u64 {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        (seq + 1) * self.shard_count + shard_index as u64
    }
}

/// The global inode → dentry lookup table. Hard-link dentries are never
/// indexed; only their sources are.
pub struct InodeIndex {
    map: RwLock<HashMap<u64, Arc<Dentry>>>,
    flocks: Mutex<HashMap<u64, Arc<FlockTable>>>,
}

impl Default for InodeIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeIndex {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            flocks: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, dentry: &Arc<Dentry>) -> Result<()> {
        let mut map = self.map.write();
        if map.contains_key(&dentry.inode()) {
            return_errno_with_message!(Errno::EEXIST, "inode already indexed");
        }
        map.insert(dentry.inode(), dentry.clone());
        Ok(())
    }

    pub fn del(&self, dentry: &Arc<Dentry>) -> Result<()> {
        if self.map.write().remove(&dentry.inode()).is_none() {
            return_errno!(Errno::ENOENT);
        }
        // The flock table's lifetime is bounded by the dentry.
        self.flocks.lock().remove(&dentry.inode());
        Ok(())
    }

    pub fn get(&self, inode: u64) -> Option<Arc<Dentry>> {
        self.map.read().get(&inode).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Looks a child up under its parent's inode, resolving hard links.
    pub fn get_by_pname(&self, parent_inode: u64, name: &str) -> Option<Arc<Dentry>> {
        let parent = self.get(parent_inode)?;
        parent.find_child(name).map(|d| d.follow())
    }

    /// Applies the stat fields selected by `record.options` and returns
    /// the updated dentry.
    pub fn update_dentry(&self, record: &Record) -> Result<Arc<Dentry>> {
        let Some(dentry) = self.get(record.inode) else {
            return_errno!(Errno::ENOENT);
        };

        let opts = record.options;
        let mut alloc_delta = 0;
        dentry.update_stat(|stat| {
            if opts.contains(SetStatFlags::MODE) {
                // File-type and hard-link bits are immutable.
                let keep = mode::IFMT | mode::HARD_LINK;
                stat.mode = (stat.mode & keep) | (record.stat.mode & !keep);
            }
            if opts.contains(SetStatFlags::ATIME) {
                stat.atime = record.stat.atime;
            }
            if opts.contains(SetStatFlags::BTIME) {
                stat.btime = record.stat.btime;
            }
            if opts.contains(SetStatFlags::CTIME) {
                stat.ctime = record.stat.ctime;
            }
            if opts.contains(SetStatFlags::MTIME) {
                stat.mtime = record.stat.mtime;
            }
            if opts.contains(SetStatFlags::UID) {
                stat.uid = record.stat.uid;
            }
            if opts.contains(SetStatFlags::GID) {
                stat.gid = record.stat.gid;
            }
            if opts.contains(SetStatFlags::FILE_SIZE) {
                stat.size = record.stat.size;
            }
            if opts.contains(SetStatFlags::SPACE_END) {
                stat.space_end = record.stat.space_end;
            }
            if opts.contains(SetStatFlags::INC_ALLOC) {
                stat.alloc += record.stat.alloc;
                alloc_delta = record.stat.alloc;
            }
        });
        if alloc_delta != 0 {
            dentry.namespace().inc_alloc_bytes(alloc_delta);
        }
        Ok(dentry)
    }

    /// Conditionally applies file size / space fields, clearing the
    /// option bits that were already up to date. Returns the dentry and
    /// whether anything changed.
    pub fn check_set_dentry_size(&self, record: &mut Record) -> Result<(Arc<Dentry>, bool)> {
        let Some(dentry) = self.get(record.inode) else {
            return_errno!(Errno::ENOENT);
        };

        let force = record.options.contains(SetStatFlags::FORCE);
        let mut applied = SetStatFlags::empty();
        let mut alloc_delta = 0;
        dentry.update_stat(|stat| {
            if record.options.contains(SetStatFlags::FILE_SIZE)
                && (force || record.stat.size > stat.size)
            {
                stat.size = record.stat.size;
                applied |= SetStatFlags::FILE_SIZE;
            }
            if record.options.contains(SetStatFlags::SPACE_END)
                && (force || record.stat.space_end > stat.space_end)
            {
                stat.space_end = record.stat.space_end;
                applied |= SetStatFlags::SPACE_END;
            }
            if record.options.contains(SetStatFlags::INC_ALLOC) && record.stat.alloc != 0 {
                stat.alloc += record.stat.alloc;
                alloc_delta = record.stat.alloc;
                applied |= SetStatFlags::INC_ALLOC;
            }
            if !applied.is_empty() {
                stat.mtime = time::current_secs();
            }
        });
        if alloc_delta != 0 {
            dentry.namespace().inc_alloc_bytes(alloc_delta);
        }

        record.options = applied;
        let modified = !applied.is_empty();
        Ok((dentry, modified))
    }

    fn check_xattr_pair(key: &str, value: &str) -> Result<()> {
        if key.is_empty() || key.len() > XATTR_KEY_MAX {
            return_errno_with_message!(Errno::EINVAL, "invalid xattr key");
        }
        if value.len() > XATTR_VALUE_MAX {
            return_errno_with_message!(Errno::EINVAL, "xattr value too large");
        }
        Ok(())
    }

    /// Sets (or replaces) one xattr pair on the record's dentry.
    pub fn set_xattr(&self, record: &Record) -> Result<()> {
        let Some(dentry) = record.me.dentry.clone() else {
            return_errno!(Errno::ENOENT);
        };
        let dentry = dentry.follow();
        Self::check_xattr_pair(&record.xattr.key, &record.xattr.value)?;

        let mut xattrs = dentry.xattrs().write();
        if let Some(pair) = xattrs.iter_mut().find(|(k, _)| *k == record.xattr.key) {
            pair.1 = record.xattr.value.clone();
            return Ok(());
        }
        if xattrs.len() >= XATTR_MAX_COUNT {
            return_errno_with_message!(Errno::EOVERFLOW, "too many xattrs");
        }
        xattrs.push((record.xattr.key.clone(), record.xattr.value.clone()));
        Ok(())
    }

    pub fn remove_xattr(&self, dentry: &Arc<Dentry>, key: &str) -> Result<()> {
        let dentry = dentry.follow();
        let mut xattrs = dentry.xattrs().write();
        match xattrs.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                xattrs.remove(pos);
                Ok(())
            }
            None => return_errno!(Errno::ENODATA),
        }
    }

    pub fn get_xattr(&self, dentry: &Arc<Dentry>, key: &str) -> Result<String> {
        let dentry = dentry.follow();
        let xattrs = dentry.xattrs().read();
        match xattrs.iter().find(|(k, _)| k == key) {
            Some((_, value)) => Ok(value.clone()),
            None => return_errno!(Errno::ENODATA),
        }
    }

    pub fn list_xattr(&self, dentry: &Arc<Dentry>) -> Vec<String> {
        let dentry = dentry.follow();
        dentry
            .xattrs()
            .read()
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Returns the flock table of `inode`, creating it on first use.
    pub fn flock_table(&self, inode: u64) -> Result<Arc<FlockTable>> {
        if self.get(inode).is_none() {
            return_errno!(Errno::ENOENT);
        }
        let mut flocks = self.flocks.lock();
        Ok(flocks.entry(inode).or_default().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{record::RecordOperation, testkit};

    #[test]
    fn generator_keeps_shard_affinity() {
        let generator = InodeGenerator::new(4);
        for shard in 0..4 {
            for _ in 0..8 {
                let inode = generator.next(shard);
                assert_eq!(inode % 4, shard as u64);
                assert_ne!(inode, 0);
            }
        }
    }

    #[test]
    fn stat_merge_respects_options() {
        let env = testkit::TestTree::new();
        env.mkdir("/");
        let file = env.mkfile("/f", 10);

        let mut record = env.plain_record(RecordOperation::Update, "/f");
        record.inode = file.inode();
        record.stat.uid = 42;
        record.stat.size = 999;
        record.options = SetStatFlags::UID;
        let updated = env.mgr.index().update_dentry(&record).unwrap();

        assert_eq!(updated.stat().uid, 42);
        // Size was not selected, so it must not change.
        assert_eq!(updated.stat().size, 10);
    }

    #[test]
    fn set_size_reports_unmodified() {
        let env = testkit::TestTree::new();
        env.mkdir("/");
        let file = env.mkfile("/f", 10);

        let mut record = env.plain_record(RecordOperation::SetDentrySize, "/f");
        record.inode = file.inode();
        record.stat.size = 64;
        record.options = SetStatFlags::FILE_SIZE;
        let (_, modified) = env.mgr.index().check_set_dentry_size(&mut record).unwrap();
        assert!(modified);
        assert_eq!(file.stat().size, 64);

        // A smaller size without FORCE is a no-op.
        let mut record = env.plain_record(RecordOperation::SetDentrySize, "/f");
        record.inode = file.inode();
        record.stat.size = 32;
        record.options = SetStatFlags::FILE_SIZE;
        let (_, modified) = env.mgr.index().check_set_dentry_size(&mut record).unwrap();
        assert!(!modified);
        assert!(record.options.is_empty());
        assert_eq!(file.stat().size, 64);
    }

    #[test]
    fn xattr_roundtrip() {
        let env = testkit::TestTree::new();
        env.mkdir("/");
        let file = env.mkfile("/f", 1);
        let index = env.mgr.index();

        let mut record = env.plain_record(RecordOperation::SetXattr, "/f");
        record.me.dentry = Some(file.clone());
        record.xattr.key = "user.k1".to_string();
        record.xattr.value = "v1".to_string();
        index.set_xattr(&record).unwrap();
        assert_eq!(index.get_xattr(&file, "user.k1").unwrap(), "v1");

        // Setting again replaces, keys stay unique.
        record.xattr.value = "v2".to_string();
        index.set_xattr(&record).unwrap();
        assert_eq!(index.get_xattr(&file, "user.k1").unwrap(), "v2");
        assert_eq!(index.list_xattr(&file), vec!["user.k1".to_string()]);

        index.remove_xattr(&file, "user.k1").unwrap();
        assert_eq!(
            index.get_xattr(&file, "user.k1").unwrap_err().error(),
            Errno::ENODATA
        );
        assert_eq!(
            index.remove_xattr(&file, "user.k1").unwrap_err().error(),
            Errno::ENODATA
        );
    }

    #[test]
    fn flock_table_lifetime() {
        let env = testkit::TestTree::new();
        env.mkdir("/");
        let file = env.mkfile("/f", 1);
        let index = env.mgr.index();

        let table = index.flock_table(file.inode()).unwrap();
        let again = index.flock_table(file.inode()).unwrap();
        assert!(Arc::ptr_eq(&table, &again));

        index.del(&file).unwrap();
        assert_eq!(
            index.flock_table(file.inode()).unwrap_err().error(),
            Errno::ENOENT
        );
    }
}
