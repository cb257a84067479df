// SPDX-License-Identifier: MPL-2.0

//! The operation record: one mutation or query, routed to a data shard
//! and completed through a one-shot callback.

use crate::{
    meta::{
        dentry::Dentry,
        types::{ns_hash_code, DentryStat, RenameFlags, SetStatFlags},
    },
    prelude::*,
};

pub use crate::meta::types::OpType;

/// Everything a shard can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOperation {
    // Updates.
    Create,
    Remove,
    Rename,
    Update,
    SetXattr,
    RemoveXattr,
    SetDentrySize,
    // Queries.
    Stat,
    LookupInode,
    ReadLink,
    GetXattr,
    ListXattr,
    List,
}

impl RecordOperation {
    pub fn is_update(self) -> bool {
        matches!(
            self,
            RecordOperation::Create
                | RecordOperation::Remove
                | RecordOperation::Rename
                | RecordOperation::Update
                | RecordOperation::SetXattr
                | RecordOperation::RemoveXattr
                | RecordOperation::SetDentrySize
        )
    }
}

/// How the record names its target dentry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DentryRouteType {
    /// A full `/`-separated path inside the namespace.
    Fullname,
    /// Parent inode plus child name.
    Pname,
    /// A bare inode.
    Inode,
}

/// One addressed dentry inside a record, before and after resolution.
#[derive(Default)]
pub struct RecordEntry {
    pub parent: Option<Arc<Dentry>>,
    pub parent_inode: u64,
    pub inode: u64,
    pub name: String,
    pub path: String,
    pub dentry: Option<Arc<Dentry>>,
}

#[derive(Default)]
pub struct RenameParams {
    pub src: RecordEntry,
    pub dest: RecordEntry,
    /// Dentry displaced by an overwriting rename; freed only once its
    /// nlink reaches zero.
    pub overwritten: Option<Arc<Dentry>>,
}

#[derive(Default)]
pub struct XattrParams {
    pub key: String,
    pub value: String,
}

/// Upper bound of secondary dentries one mutation can touch.
pub const MAX_AFFECTED: usize = 4;

pub struct AffectedEntry {
    pub dentry: Arc<Dentry>,
    pub op: OpType,
}

/// Bounded list of dentries (other than the primary target) whose
/// persistent state a mutation changed.
#[derive(Default)]
pub struct AffectedList {
    entries: Vec<AffectedEntry>,
}

impl AffectedList {
    pub fn push(&mut self, dentry: Arc<Dentry>, op: OpType) {
        debug_assert!(self.entries.len() < MAX_AFFECTED);
        self.entries.push(AffectedEntry { dentry, op });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AffectedEntry> {
        self.entries.iter()
    }
}

/// What a completed record reports to its callback.
#[derive(Debug, Clone, Copy)]
pub struct RecordOutcome {
    /// The result code handed back to the caller. In loose error mode
    /// this may be set while `is_error` is still false.
    pub errno: Option<Errno>,
    /// Whether the operation counts as failed for versioning,
    /// persistence and replication purposes.
    pub is_error: bool,
}

impl RecordOutcome {
    pub const fn ok() -> Self {
        Self {
            errno: None,
            is_error: false,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errno.is_none()
    }
}

/// Completion callback; invoked exactly once per submitted record and
/// handed the record back.
pub type RecordNotify = Box<dyn FnOnce(Box<Record>, RecordOutcome) + Send>;

/// Results of the query operations.
#[derive(Default)]
pub struct QueryOutput {
    pub link: Option<String>,
    pub xattr_value: Option<String>,
    pub xattr_names: Option<Vec<String>>,
    pub dentries: Vec<Arc<Dentry>>,
}

pub struct Record {
    pub operation: RecordOperation,
    pub dentry_type: DentryRouteType,
    pub ns: String,
    pub hash_code: u32,
    pub inode: u64,
    /// 0 means "assign on success"; a positive value replays a known
    /// version (replication, recovery).
    pub data_version: u64,
    pub stat: DentryStat,
    pub options: SetStatFlags,
    pub flags: RenameFlags,
    pub me: RecordEntry,
    /// Hard-link source (create only).
    pub hdlink: RecordEntry,
    pub rename: RenameParams,
    pub xattr: XattrParams,
    /// Symlink target (create only).
    pub link: String,
    pub affected: AffectedList,
    pub output: QueryOutput,
    /// Replication waiter; its RPC count balances against follower
    /// acknowledgements in the push-result tracker.
    pub waiter: Option<Arc<crate::replication::push_result::RpcWaiter>>,
    pub(crate) notify: Option<RecordNotify>,
}

impl Record {
    pub fn new(operation: RecordOperation, ns: &str) -> Box<Self> {
        Box::new(Self {
            operation,
            dentry_type: DentryRouteType::Fullname,
            ns: ns.to_string(),
            hash_code: ns_hash_code(ns),
            inode: 0,
            data_version: 0,
            stat: DentryStat::default(),
            options: SetStatFlags::empty(),
            flags: RenameFlags::empty(),
            me: RecordEntry::default(),
            hdlink: RecordEntry::default(),
            rename: RenameParams::default(),
            xattr: XattrParams::default(),
            link: String::new(),
            affected: AffectedList::default(),
            output: QueryOutput::default(),
            waiter: None,
            notify: None,
        })
    }

    pub fn with_path(mut self: Box<Self>, path: &str) -> Box<Self> {
        self.dentry_type = DentryRouteType::Fullname;
        self.me.path = path.to_string();
        self
    }

    pub fn with_pname(mut self: Box<Self>, parent_inode: u64, name: &str) -> Box<Self> {
        self.dentry_type = DentryRouteType::Pname;
        self.me.parent_inode = parent_inode;
        self.me.name = name.to_string();
        self
    }

    pub fn with_inode(mut self: Box<Self>, inode: u64) -> Box<Self> {
        self.dentry_type = DentryRouteType::Inode;
        self.inode = inode;
        self
    }

    pub fn with_stat(mut self: Box<Self>, stat: DentryStat) -> Box<Self> {
        self.stat = stat;
        self
    }

    pub fn with_options(mut self: Box<Self>, options: SetStatFlags) -> Box<Self> {
        self.options = options;
        self
    }

    pub fn with_rename_paths(mut self: Box<Self>, src: &str, dest: &str) -> Box<Self> {
        self.rename.src.path = src.to_string();
        self.rename.dest.path = dest.to_string();
        self
    }

    pub fn with_rename_flags(mut self: Box<Self>, flags: RenameFlags) -> Box<Self> {
        self.flags = flags;
        self
    }

    pub fn with_link(mut self: Box<Self>, target: &str) -> Box<Self> {
        self.link = target.to_string();
        self
    }

    pub fn with_hdlink_path(mut self: Box<Self>, src_path: &str) -> Box<Self> {
        self.hdlink.path = src_path.to_string();
        self
    }

    pub fn with_hdlink_inode(mut self: Box<Self>, src_inode: u64) -> Box<Self> {
        self.hdlink.inode = src_inode;
        self
    }

    pub fn with_waiter(
        mut self: Box<Self>,
        waiter: Arc<crate::replication::push_result::RpcWaiter>,
    ) -> Box<Self> {
        self.waiter = Some(waiter);
        self
    }

    pub fn with_xattr(mut self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.xattr.key = key.to_string();
        self.xattr.value = value.to_string();
        self
    }

    pub fn with_data_version(mut self: Box<Self>, version: u64) -> Box<Self> {
        self.data_version = version;
        self
    }

    pub fn with_notify(
        mut self: Box<Self>,
        notify: impl FnOnce(Box<Record>, RecordOutcome) + Send + 'static,
    ) -> Box<Self> {
        self.notify = Some(Box::new(notify));
        self
    }

    pub(crate) fn take_notify(&mut self) -> Option<RecordNotify> {
        self.notify.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_fill_routing() {
        let record = Record::new(RecordOperation::Create, "fs").with_path("/a/b");
        assert_eq!(record.dentry_type, DentryRouteType::Fullname);
        assert_eq!(record.hash_code, ns_hash_code("fs"));
        assert_eq!(record.me.path, "/a/b");
        assert!(record.operation.is_update());

        let record = Record::new(RecordOperation::Stat, "fs").with_inode(42);
        assert_eq!(record.dentry_type, DentryRouteType::Inode);
        assert_eq!(record.inode, 42);
        assert!(!record.operation.is_update());
    }
}
