// SPDX-License-Identifier: MPL-2.0

//! Namespace registry: maps a namespace name to its root dentry and
//! counters, and pins every namespace to one data shard.

use std::sync::atomic::{AtomicI64, Ordering};

use hashbrown::HashMap;
use spin::RwLock;

use crate::{
    meta::{dentry::Dentry, types::ns_hash_code},
    prelude::*,
};

/// One disjoint directory tree.
#[derive(Debug)]
pub struct NamespaceEntry {
    name: String,
    hash_code: u32,
    shard_index: usize,
    root: RwLock<Option<Arc<Dentry>>>,
    dir_count: AtomicI64,
    file_count: AtomicI64,
    used_bytes: AtomicI64,
}

impl NamespaceEntry {
    fn new(name: String, shard_count: usize) -> Self {
        let hash_code = ns_hash_code(&name);
        Self {
            name,
            hash_code,
            shard_index: hash_code as usize % shard_count,
            root: RwLock::new(None),
            dir_count: AtomicI64::new(0),
            file_count: AtomicI64::new(0),
            used_bytes: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash_code(&self) -> u32 {
        self.hash_code
    }

    /// Index of the data shard that owns every dentry in this namespace.
    pub fn shard_index(&self) -> usize {
        self.shard_index
    }

    pub fn root(&self) -> Option<Arc<Dentry>> {
        self.root.read().clone()
    }

    pub(crate) fn set_root(&self, root: Option<Arc<Dentry>>) {
        *self.root.write() = root;
    }

    pub fn counts(&self) -> (i64, i64) {
        (
            self.dir_count.load(Ordering::Relaxed),
            self.file_count.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn add_entry(&self, is_dir: bool, delta: i64) {
        if is_dir {
            self.dir_count.fetch_add(delta, Ordering::Relaxed);
        } else {
            self.file_count.fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// Allocated-space accounting fed by `alloc` deltas.
    pub fn inc_alloc_bytes(&self, delta: i64) {
        self.used_bytes.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn used_bytes(&self) -> i64 {
        self.used_bytes.load(Ordering::Relaxed)
    }
}

/// Registry of all namespaces on this server.
pub struct NamespaceRegistry {
    map: RwLock<HashMap<String, Arc<NamespaceEntry>>>,
    shard_count: usize,
    ns_count: AtomicI64,
}

impl NamespaceRegistry {
    pub fn new(shard_count: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            shard_count: shard_count.max(1),
            ns_count: AtomicI64::new(0),
        }
    }

    /// Looks a namespace up, optionally creating it.
    pub fn get(&self, name: &str, create: bool) -> Result<Arc<NamespaceEntry>> {
        self.get_or_create(name, create).map(|(entry, _)| entry)
    }

    /// Like [`Self::get`], also reporting whether this call created the
    /// namespace.
    pub fn get_or_create(&self, name: &str, create: bool) -> Result<(Arc<NamespaceEntry>, bool)> {
        if let Some(entry) = self.map.read().get(name) {
            return Ok((entry.clone(), false));
        }
        if !create {
            return_errno!(Errno::ENOENT);
        }
        if name.is_empty() {
            return_errno_with_message!(Errno::EINVAL, "empty namespace name");
        }

        let mut map = self.map.write();
        // Racing creators are possible; recheck under the write lock.
        if let Some(entry) = map.get(name) {
            return Ok((entry.clone(), false));
        }
        let entry = Arc::new(NamespaceEntry::new(name.to_string(), self.shard_count));
        map.insert(name.to_string(), entry.clone());
        self.ns_count.fetch_add(1, Ordering::Relaxed);
        Ok((entry, true))
    }

    pub fn namespace_count(&self) -> i64 {
        self.ns_count.load(Ordering::Relaxed)
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_create() {
        let registry = NamespaceRegistry::new(4);
        assert_eq!(
            registry.get("fs", false).unwrap_err().error(),
            Errno::ENOENT
        );

        let entry = registry.get("fs", true).unwrap();
        assert_eq!(entry.name(), "fs");
        assert!(entry.root().is_none());
        assert_eq!(registry.namespace_count(), 1);

        let again = registry.get("fs", true).unwrap();
        assert!(Arc::ptr_eq(&entry, &again));
        assert_eq!(registry.namespace_count(), 1);

        assert!(entry.shard_index() < 4);
        assert_eq!(
            entry.shard_index(),
            ns_hash_code("fs") as usize % 4
        );
    }

    #[test]
    fn alloc_accounting() {
        let registry = NamespaceRegistry::new(1);
        let entry = registry.get("fs", true).unwrap();
        entry.inc_alloc_bytes(4096);
        entry.inc_alloc_bytes(-1024);
        assert_eq!(entry.used_bytes(), 3072);
    }
}
