// SPDX-License-Identifier: MPL-2.0

//! The in-memory dentry tree.
//!
//! Every dentry belongs to exactly one namespace and is owned by the data
//! shard that namespace routes to; all mutations below run on that shard's
//! thread. Readers on other threads hold an `Arc` and go through the
//! shard's free queues to release it, which is what gives them a bounded
//! grace window after a logical removal.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU8, Ordering},
};

use spin::RwLock;

use crate::{
    meta::{
        inode_index::{InodeGenerator, InodeIndex},
        namespace::{NamespaceEntry, NamespaceRegistry},
        types::{mode, DentryCounters, DentryStat, LoadedFlags, RenameFlags, MAX_PATH_DEPTH, NAME_MAX},
    },
    prelude::*,
    record::{DentryRouteType, OpType, Record, RecordOperation},
    shard::free_queue::DelayFreeQueue,
};

/// Payload that depends on the dentry's file type.
pub enum DentryVariant {
    Regular,
    Directory(RwLock<BTreeMap<String, Arc<Dentry>>>),
    Symlink(String),
    /// Shared reference to the link source; the source's `nlink` counts
    /// one plus the number of hard links pointing at it.
    HardLink(Arc<Dentry>),
}

/// One filesystem entry.
pub struct Dentry {
    inode: u64,
    hash_code: u32,
    ns: Arc<NamespaceEntry>,
    name: RwLock<String>,
    parent: RwLock<Weak<Dentry>>,
    stat: RwLock<DentryStat>,
    variant: DentryVariant,
    xattrs: RwLock<Vec<(String, String)>>,
    loaded: AtomicU8,
}

impl Dentry {
    pub(crate) fn new(
        inode: u64,
        ns: Arc<NamespaceEntry>,
        name: String,
        parent: Option<&Arc<Dentry>>,
        stat: DentryStat,
        variant: DentryVariant,
    ) -> Arc<Self> {
        let parent = match parent {
            Some(parent) => Arc::downgrade(parent),
            None => Weak::new(),
        };
        Arc::new(Self {
            inode,
            hash_code: ns.hash_code(),
            ns,
            name: RwLock::new(name),
            parent: RwLock::new(parent),
            stat: RwLock::new(stat),
            variant,
            xattrs: RwLock::new(Vec::new()),
            loaded: AtomicU8::new(LoadedFlags::ALL.bits()),
        })
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn hash_code(&self) -> u32 {
        self.hash_code
    }

    pub fn namespace(&self) -> &Arc<NamespaceEntry> {
        &self.ns
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn set_name(&self, name: String) -> String {
        core::mem::replace(&mut *self.name.write(), name)
    }

    pub fn parent(&self) -> Option<Arc<Dentry>> {
        self.parent.read().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: Option<&Arc<Dentry>>) {
        *self.parent.write() = match parent {
            Some(parent) => Arc::downgrade(parent),
            None => Weak::new(),
        };
    }

    pub fn stat(&self) -> DentryStat {
        *self.stat.read()
    }

    /// Runs `f` on the stat block under its lock and returns its result.
    pub(crate) fn update_stat<R>(&self, f: impl FnOnce(&mut DentryStat) -> R) -> R {
        f(&mut self.stat.write())
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.variant, DentryVariant::Directory(_))
    }

    pub fn src_dentry(&self) -> Option<&Arc<Dentry>> {
        match &self.variant {
            DentryVariant::HardLink(src) => Some(src),
            _ => None,
        }
    }

    pub fn link_target(&self) -> Option<&str> {
        match &self.variant {
            DentryVariant::Symlink(target) => Some(target),
            _ => None,
        }
    }

    /// Resolves a hard link to its source; any other dentry is itself.
    pub fn follow(self: &Arc<Self>) -> Arc<Dentry> {
        match self.src_dentry() {
            Some(src) => src.clone(),
            None => self.clone(),
        }
    }

    pub(crate) fn children(&self) -> Option<&RwLock<BTreeMap<String, Arc<Dentry>>>> {
        match &self.variant {
            DentryVariant::Directory(children) => Some(children),
            _ => None,
        }
    }

    pub fn child_count(&self) -> usize {
        self.children().map_or(0, |c| c.read().len())
    }

    pub fn children_empty(&self) -> bool {
        self.children().is_none_or(|c| c.read().is_empty())
    }

    pub fn find_child(&self, name: &str) -> Option<Arc<Dentry>> {
        self.children()?.read().get(name).cloned()
    }

    /// Collects the child inodes in name order.
    pub fn child_inodes(&self) -> Vec<i64> {
        match self.children() {
            Some(children) => children.read().values().map(|d| d.inode() as i64).collect(),
            None => Vec::new(),
        }
    }

    pub fn xattrs(&self) -> &RwLock<Vec<(String, String)>> {
        &self.xattrs
    }

    pub fn loaded_flags(&self) -> LoadedFlags {
        LoadedFlags::from_bits_truncate(self.loaded.load(Ordering::Relaxed))
    }

    /// Marks which piece-fields are resident. The lazy-loading side of
    /// the persistence subsystem toggles these as it pages state in.
    pub fn set_loaded_flags(&self, flags: LoadedFlags) {
        self.loaded.store(flags.bits(), Ordering::Relaxed);
    }

    /// Whether `self` is an ancestor of `node` (or `node` itself).
    pub fn is_ancestor_of(self: &Arc<Self>, node: &Arc<Dentry>) -> bool {
        let mut current = Some(node.clone());
        while let Some(d) = current {
            if Arc::ptr_eq(self, &d) {
                return true;
            }
            current = d.parent();
        }
        false
    }
}

impl core::fmt::Debug for Dentry {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Dentry")
            .field("inode", &self.inode)
            .field("name", &*self.name.read())
            .field("nlink", &self.stat.read().nlink)
            .finish()
    }
}

/// Outcome of resolving a record's target dentry.
pub enum FindMe {
    Found {
        ns: Arc<NamespaceEntry>,
        dentry: Arc<Dentry>,
    },
    /// The parent chain resolved but the final component does not exist.
    Missing { ns: Arc<NamespaceEntry> },
}

/// Result of resolving a path down to its final component.
pub struct ParentResolution {
    pub ns: Arc<NamespaceEntry>,
    /// `None` means the path names the namespace root itself.
    pub parent: Option<Arc<Dentry>>,
    pub name: String,
}

/// Per-shard tree operations. One manager exists per data shard and is
/// only driven from that shard's thread.
pub struct DentryManager {
    shard_index: usize,
    registry: Arc<NamespaceRegistry>,
    index: Arc<InodeIndex>,
    inode_gen: Arc<InodeGenerator>,
    pub counters: DentryCounters,
}

impl DentryManager {
    pub fn new(
        shard_index: usize,
        registry: Arc<NamespaceRegistry>,
        index: Arc<InodeIndex>,
        inode_gen: Arc<InodeGenerator>,
    ) -> Self {
        Self {
            shard_index,
            registry,
            index,
            inode_gen,
            counters: DentryCounters::default(),
        }
    }

    pub fn index(&self) -> &Arc<InodeIndex> {
        &self.index
    }

    pub fn registry(&self) -> &Arc<NamespaceRegistry> {
        &self.registry
    }

    fn split_path(path: &str) -> Result<Vec<&str>> {
        if path.is_empty() || !path.starts_with('/') {
            return_errno_with_message!(Errno::EINVAL, "path must be absolute");
        }
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() > MAX_PATH_DEPTH {
            return_errno_with_message!(Errno::EOVERFLOW, "path too deep");
        }
        Ok(parts)
    }

    fn find_child(parent: &Arc<Dentry>, name: &str) -> Result<Arc<Dentry>> {
        if !parent.is_dir() {
            return_errno!(Errno::ENOTDIR);
        }
        match parent.find_child(name) {
            Some(child) => Ok(child),
            None => return_errno!(Errno::ENOENT),
        }
    }

    fn walk(root: &Arc<Dentry>, parts: &[&str]) -> Result<Arc<Dentry>> {
        let mut current = root.clone();
        for part in parts {
            current = Self::find_child(&current, part)?;
        }
        Ok(current)
    }

    /// Resolves the parent directory and final name of `path` in `ns_name`.
    pub fn find_parent(&self, ns_name: &str, path: &str) -> Result<ParentResolution> {
        let parts = Self::split_path(path)?;
        let ns = self.registry.get(ns_name, false)?;
        let Some(root) = ns.root() else {
            return_errno!(Errno::ENOENT);
        };

        let Some((name, dirs)) = parts.split_last() else {
            // The path is the namespace root itself.
            return Ok(ParentResolution {
                ns,
                parent: None,
                name: String::new(),
            });
        };

        let parent = Self::walk(&root, dirs)?;
        if !parent.is_dir() {
            return_errno!(Errno::ENOTDIR);
        }
        Ok(ParentResolution {
            ns,
            parent: Some(parent),
            name: (*name).to_string(),
        })
    }

    /// Resolves `record.me` against the tree. With `create_ns` the
    /// namespace is created on demand (create is the only caller).
    pub fn find_me(&self, record: &mut Record, create_ns: bool) -> Result<FindMe> {
        let Some(parent) = record.me.parent.clone() else {
            let (ns, created) = self.registry.get_or_create(&record.ns, create_ns)?;
            if created {
                self.counters.ns.fetch_add(1, Ordering::Relaxed);
            }
            let root = ns.root();
            if !record.me.name.is_empty() {
                return_errno_with_message!(Errno::EINVAL, "no parent for a non-root name");
            }
            return Ok(match root {
                Some(root) => {
                    record.me.dentry = Some(root.clone());
                    FindMe::Found { ns, dentry: root }
                }
                None => FindMe::Missing { ns },
            });
        };

        let ns = parent.namespace().clone();
        match Self::find_child(&parent, &record.me.name) {
            Ok(dentry) => {
                record.me.dentry = Some(dentry.clone());
                Ok(FindMe::Found { ns, dentry })
            }
            Err(e) if e.error() == Errno::ENOENT => Ok(FindMe::Missing { ns }),
            Err(e) => Err(e),
        }
    }

    pub fn create(&self, record: &mut Record) -> Result<()> {
        let rmode = record.stat.mode;
        if mode::type_bits(rmode) == 0 && !mode::is_hard_link(rmode) {
            error!("invalid file mode: {:o}", rmode);
            return_errno!(Errno::EINVAL);
        }

        let ns = match self.find_me(record, true)? {
            FindMe::Found { .. } => return_errno!(Errno::EEXIST),
            FindMe::Missing { ns } => ns,
        };
        if record.me.name.len() > NAME_MAX {
            return_errno!(Errno::ENAMETOOLONG);
        }

        let is_dir = mode::is_dir(rmode);
        let variant = if mode::is_hard_link(rmode) {
            let Some(src) = record.hdlink.dentry.clone() else {
                return_errno_with_message!(Errno::EINVAL, "hard link source not resolved");
            };
            DentryVariant::HardLink(src)
        } else if mode::is_symlink(rmode) {
            DentryVariant::Symlink(record.link.clone())
        } else if is_dir {
            DentryVariant::Directory(RwLock::new(BTreeMap::new()))
        } else {
            DentryVariant::Regular
        };

        let inode = if record.inode == 0 {
            self.inode_gen.next(self.shard_index)
        } else {
            record.inode
        };

        let mut stat = record.stat;
        stat.nlink = 1;
        stat.alloc = 0;
        stat.space_end = 0;

        let dentry = Dentry::new(
            inode,
            ns.clone(),
            record.me.name.clone(),
            record.me.parent.as_ref(),
            stat,
            variant,
        );

        if let Some(src) = dentry.src_dentry() {
            src.update_stat(|s| s.nlink += 1);
            record.affected.push(src.clone(), OpType::Update);
        } else {
            self.index.add(&dentry)?;
        }

        match &record.me.parent {
            None => ns.set_root(Some(dentry.clone())),
            Some(parent) => {
                let Some(children) = parent.children() else {
                    return_errno!(Errno::ENOTDIR);
                };
                children
                    .write()
                    .insert(record.me.name.clone(), dentry.clone());
                parent.update_stat(|s| s.nlink += 1);
            }
        }

        record.me.dentry = Some(dentry);
        if record.inode == 0 {
            record.inode = inode;
        }

        self.counters.add_entry(is_dir, 1);
        ns.add_entry(is_dir, 1);
        Ok(())
    }

    fn drop_entry_counts(&self, dentry: &Dentry) {
        let is_dir = dentry.is_dir();
        self.counters.add_entry(is_dir, -1);
        dentry.namespace().add_entry(is_dir, -1);
    }

    fn remove_src_dentry(&self, src: &Arc<Dentry>, free: &mut DelayFreeQueue) -> Result<()> {
        self.index.del(src)?;
        self.drop_entry_counts(src);
        free.defer_drop(src.clone());
        Ok(())
    }

    /// Shared removal bookkeeping for remove and overwriting renames.
    /// Returns whether `dentry` itself reached zero links and must leave
    /// the tree for good.
    fn do_remove_dentry(
        &self,
        record: &mut Record,
        dentry: &Arc<Dentry>,
        free: &mut DelayFreeQueue,
    ) -> Result<bool> {
        let free_dentry;
        if let Some(src) = dentry.src_dentry().cloned() {
            let nlink = src.update_stat(|s| {
                s.nlink -= 1;
                s.nlink
            });
            let op = if nlink == 0 {
                self.remove_src_dentry(&src, free)?;
                OpType::Remove
            } else {
                OpType::Update
            };
            record.affected.push(src, op);
            record.affected.push(dentry.clone(), OpType::Remove);
            free_dentry = true;
        } else {
            let nlink = dentry.update_stat(|s| {
                s.nlink -= 1;
                s.nlink
            });
            let op = if nlink == 0 {
                self.index.del(dentry)?;
                free_dentry = true;
                OpType::Remove
            } else {
                free_dentry = false;
                OpType::Update
            };
            record.affected.push(dentry.clone(), op);
        }

        if free_dentry && dentry.src_dentry().is_none() {
            self.drop_entry_counts(dentry);
        } else if free_dentry {
            // A vanishing hard link counts as one file entry.
            self.counters.add_entry(false, -1);
            dentry.namespace().add_entry(false, -1);
        }
        Ok(free_dentry)
    }

    pub fn remove(&self, record: &mut Record, free: &mut DelayFreeQueue) -> Result<()> {
        let (ns, dentry) = match self.find_me(record, false)? {
            FindMe::Found { ns, dentry } => (ns, dentry),
            FindMe::Missing { .. } => return_errno!(Errno::ENOENT),
        };

        if dentry.is_dir() && !dentry.children_empty() {
            return_errno!(Errno::ENOTEMPTY);
        }

        record.inode = dentry.inode();
        let free_dentry = self.do_remove_dentry(record, &dentry, free)?;

        match record.me.parent.clone() {
            None => {
                ns.set_root(None);
                if free_dentry {
                    free.defer_drop(dentry);
                }
            }
            Some(parent) => {
                let removed = parent
                    .children()
                    .and_then(|c| c.write().remove(&record.me.name));
                match removed {
                    Some(removed) => {
                        parent.update_stat(|s| s.nlink -= 1);
                        if free_dentry {
                            free.defer_drop(removed);
                        }
                    }
                    None => {
                        error!(
                            "parent inode: {}, child {{inode: {}, name: {}}} \
                             not in the children map",
                            parent.inode(),
                            dentry.inode(),
                            record.me.name
                        );
                        return_errno!(Errno::ENOENT);
                    }
                }
            }
        }
        Ok(())
    }

    fn rename_check(&self, record: &mut Record) -> Result<()> {
        let (Some(src_parent), Some(dest_parent)) = (
            record.rename.src.parent.clone(),
            record.rename.dest.parent.clone(),
        ) else {
            return_errno_with_message!(Errno::EINVAL, "cannot rename a namespace root");
        };

        record.rename.src.dentry = Some(Self::find_child(&src_parent, &record.rename.src.name)?);

        match Self::find_child(&dest_parent, &record.rename.dest.name) {
            Ok(dest) => record.rename.dest.dentry = Some(dest),
            Err(e) => {
                if record.flags.contains(RenameFlags::EXCHANGE) || e.error() != Errno::ENOENT {
                    return Err(e);
                }
                record.rename.dest.dentry = None;
                return Ok(());
            }
        }

        if record.flags.contains(RenameFlags::NOREPLACE) {
            return_errno!(Errno::EEXIST);
        }
        if record.flags.contains(RenameFlags::EXCHANGE) {
            return Ok(());
        }

        let src = record.rename.src.dentry.as_ref().unwrap();
        let dest = record.rename.dest.dentry.as_ref().unwrap();
        if mode::type_bits(dest.stat().mode) != mode::type_bits(src.stat().mode) {
            return_errno!(Errno::EINVAL);
        }
        if dest.is_dir() && !dest.children_empty() {
            return_errno!(Errno::ENOTEMPTY);
        }
        Ok(())
    }

    fn exchange_dentry(&self, record: &mut Record, name_changed: bool) -> Result<()> {
        let src = record.rename.src.dentry.clone().unwrap();
        let dest = record.rename.dest.dentry.clone().unwrap();
        let src_parent = record.rename.src.parent.clone().unwrap();
        let dest_parent = record.rename.dest.parent.clone().unwrap();
        let src_name = record.rename.src.name.clone();
        let dest_name = record.rename.dest.name.clone();

        let src_children = src_parent.children().ok_or(Error::new(Errno::ENOTDIR))?;
        let dest_children = dest_parent.children().ok_or(Error::new(Errno::ENOTDIR))?;

        src_children.write().remove(&src_name);
        if name_changed {
            src.set_name(dest_name.clone());
        }
        dest_children.write().insert(dest_name, src.clone());
        if name_changed {
            dest.set_name(src_name.clone());
        }
        src_children.write().insert(src_name, dest.clone());

        src.set_parent(Some(&dest_parent));
        dest.set_parent(Some(&src_parent));
        record.inode = src.inode();
        Ok(())
    }

    fn move_dentry(
        &self,
        record: &mut Record,
        name_changed: bool,
        free: &mut DelayFreeQueue,
    ) -> Result<()> {
        let src = record.rename.src.dentry.clone().unwrap();
        let src_parent = record.rename.src.parent.clone().unwrap();
        let dest_parent = record.rename.dest.parent.clone().unwrap();
        let src_name = record.rename.src.name.clone();
        let dest_name = record.rename.dest.name.clone();

        let src_children = src_parent.children().ok_or(Error::new(Errno::ENOTDIR))?;
        let dest_children = dest_parent.children().ok_or(Error::new(Errno::ENOTDIR))?;

        src_children.write().remove(&src_name);
        let old_name = if name_changed {
            Some(src.set_name(dest_name.clone()))
        } else {
            None
        };

        record.rename.overwritten = record.rename.dest.dentry.clone();
        let result: Result<()> = (|| {
            if let Some(dest) = record.rename.dest.dentry.clone() {
                let free_dest = self.do_remove_dentry(record, &dest, free)?;
                let replaced = dest_children.write().insert(dest_name, src.clone());
                if free_dest {
                    if let Some(replaced) = replaced {
                        free.defer_drop(replaced);
                    }
                }
            } else {
                dest_children.write().insert(dest_name, src.clone());
            }
            Ok(())
        })();

        if let Err(e) = result {
            // Roll the half-done move back so no partial state survives.
            if let Some(old_name) = old_name {
                src.set_name(old_name);
            }
            src_children.write().insert(src_name, src.clone());
            return Err(e);
        }

        if record.rename.overwritten.is_some() {
            src_parent.update_stat(|s| s.nlink -= 1);
        } else if !Arc::ptr_eq(&src_parent, &dest_parent) {
            src_parent.update_stat(|s| s.nlink -= 1);
            dest_parent.update_stat(|s| s.nlink += 1);
        }

        src.set_parent(Some(&dest_parent));
        record.inode = src.inode();
        Ok(())
    }

    pub fn rename(&self, record: &mut Record, free: &mut DelayFreeQueue) -> Result<()> {
        self.rename_check(record)?;

        let src = record.rename.src.dentry.clone().unwrap();
        if let Some(dest) = &record.rename.dest.dentry {
            if Arc::ptr_eq(dest, &src) {
                return_errno!(Errno::EEXIST);
            }
        }

        let src_parent = record.rename.src.parent.clone().unwrap();
        let dest_parent = record.rename.dest.parent.clone().unwrap();
        if !Arc::ptr_eq(&src_parent, &dest_parent) {
            if src.is_ancestor_of(&dest_parent) {
                return_errno!(Errno::ELOOP);
            }
            let dest_or_parent = record
                .rename
                .dest
                .dentry
                .clone()
                .unwrap_or_else(|| dest_parent.clone());
            if dest_or_parent.is_ancestor_of(&src_parent) {
                return_errno!(Errno::ELOOP);
            }
        }

        let name_changed = record.rename.src.name != record.rename.dest.name;
        if record.flags.contains(RenameFlags::EXCHANGE) {
            self.exchange_dentry(record, name_changed)
        } else {
            self.move_dentry(record, name_changed, free)
        }
    }

    /// Resolves `record.me.parent`/`name` ahead of a create or remove.
    /// For create, the only tolerated resolution miss is the namespace
    /// root itself; anything else propagates.
    pub fn resolve_record_parent(&self, record: &mut Record) -> Result<()> {
        match record.dentry_type {
            DentryRouteType::Pname => {
                if record.me.parent_inode == 0 {
                    record.me.parent = None;
                    return Ok(());
                }
                match self.index.get(record.me.parent_inode) {
                    Some(parent) => {
                        record.me.parent = Some(parent);
                        Ok(())
                    }
                    None => return_errno!(Errno::ENOENT),
                }
            }
            DentryRouteType::Fullname => {
                let is_create = record.operation == RecordOperation::Create;
                match self.find_parent(&record.ns, &record.me.path) {
                    Ok(res) => {
                        if is_create && res.parent.is_none() {
                            // The root path resolving means the root
                            // already exists.
                            return_errno!(Errno::EEXIST);
                        }
                        record.me.parent_inode = res.parent.as_ref().map_or(0, |p| p.inode());
                        record.me.parent = res.parent;
                        record.me.name = res.name;
                    }
                    Err(e) => {
                        // Root creation is the only tolerated miss.
                        let is_root_path = record.me.path == "/";
                        if !(e.error() == Errno::ENOENT && is_create && is_root_path) {
                            return Err(e);
                        }
                        record.me.parent = None;
                        record.me.parent_inode = 0;
                        record.me.name.clear();
                    }
                }
                record.me.dentry = None;
                Ok(())
            }
            DentryRouteType::Inode => {
                return_errno_with_message!(Errno::EINVAL, "inode routing cannot create or remove")
            }
        }
    }

    /// Resolves the hard-link source and folds its file-type bits into
    /// the new dentry's mode.
    pub fn resolve_hdlink_src(&self, record: &mut Record) -> Result<()> {
        let src = match record.dentry_type {
            DentryRouteType::Fullname => {
                let src = self.find_by_path(&record.ns, &record.hdlink.path, false)?;
                record.hdlink.inode = src.inode();
                src
            }
            _ => match self.index.get(record.hdlink.inode) {
                Some(src) => src,
                None => return_errno!(Errno::ENOENT),
            },
        };

        if src.is_dir() || src.src_dentry().is_some() {
            return_errno!(Errno::EPERM);
        }
        record.stat.mode |= mode::type_bits(src.stat().mode);
        record.hdlink.dentry = Some(src);
        Ok(())
    }

    /// Resolves both rename parents.
    pub fn resolve_rename_parents(&self, record: &mut Record) -> Result<()> {
        if record.dentry_type == DentryRouteType::Pname {
            for entry in [&mut record.rename.src, &mut record.rename.dest] {
                match self.index.get(entry.parent_inode) {
                    Some(parent) => entry.parent = Some(parent),
                    None => return_errno!(Errno::ENOENT),
                }
            }
            return Ok(());
        }

        let ns = record.ns.clone();
        for entry in [&mut record.rename.src, &mut record.rename.dest] {
            let res = self.find_parent(&ns, &entry.path)?;
            let Some(parent) = res.parent else {
                return_errno_with_message!(Errno::EINVAL, "cannot rename a namespace root");
            };
            entry.parent_inode = parent.inode();
            entry.parent = Some(parent);
            entry.name = res.name;
        }
        Ok(())
    }

    /// Resolves the target dentry of an xattr mutation, following hard
    /// links so attributes always live on the source.
    pub fn resolve_xattr_target(&self, record: &mut Record) -> Result<()> {
        let dentry = match record.dentry_type {
            DentryRouteType::Inode => match self.index.get(record.inode) {
                Some(dentry) => dentry,
                None => return_errno!(Errno::ENOENT),
            },
            _ => {
                let dentry = self.find_by_path(&record.ns, &record.me.path, true)?;
                record.inode = dentry.inode();
                record.me.name = dentry.name();
                record.me.parent_inode = dentry.parent().map_or(0, |p| p.inode());
                dentry
            }
        };
        record.me.dentry = Some(dentry);
        Ok(())
    }

    /// Finds a dentry by full path, optionally resolving hard links.
    pub fn find_by_path(&self, ns_name: &str, path: &str, follow: bool) -> Result<Arc<Dentry>> {
        let res = self.find_parent(ns_name, path)?;
        let dentry = match res.parent {
            None => res.ns.root().ok_or(Error::new(Errno::ENOENT))?,
            Some(parent) => Self::find_child(&parent, &res.name)?,
        };
        Ok(if follow { dentry.follow() } else { dentry })
    }

    /// Finds a child of `parent` by name, resolving hard links.
    pub fn find_by_pname(&self, parent: &Arc<Dentry>, name: &str) -> Result<Arc<Dentry>> {
        Ok(Self::find_child(parent, name)?.follow())
    }

    /// Enumerates `dentry` into `out`: its direct children for a
    /// directory, the dentry itself otherwise.
    pub fn list(&self, dentry: &Arc<Dentry>, out: &mut Vec<Arc<Dentry>>) {
        match dentry.children() {
            Some(children) => out.extend(children.read().values().cloned()),
            None => out.push(dentry.clone()),
        }
    }

    /// Reconstructs the absolute path of `dentry` by walking parents.
    pub fn full_path(&self, dentry: &Arc<Dentry>) -> Result<String> {
        let mut parts = Vec::new();
        let mut current = dentry.clone();
        while let Some(parent) = current.parent() {
            if parts.len() >= MAX_PATH_DEPTH {
                return_errno_with_message!(Errno::EOVERFLOW, "path too deep");
            }
            parts.push(current.name());
            current = parent;
        }

        if parts.is_empty() {
            return Ok(String::from("/"));
        }
        let mut path = String::new();
        for part in parts.iter().rev() {
            path.push('/');
            path.push_str(part);
        }
        Ok(path)
    }
}
