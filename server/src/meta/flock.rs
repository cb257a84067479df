// SPDX-License-Identifier: MPL-2.0

//! Per-inode record locks. The tables live in the inode index and are
//! dropped with their dentry.

use spin::Mutex;

use crate::prelude::*;

/// Type of a file lock region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlockType {
    Shared,
    Exclusive,
}

/// One locked byte range. `len == 0` means "to end of file".
#[derive(Debug, Clone)]
pub struct FlockRegion {
    pub owner: u64,
    pub type_: FlockType,
    pub start: i64,
    pub len: i64,
}

impl FlockRegion {
    fn overlaps(&self, other: &Self) -> bool {
        let end = |r: &Self| {
            if r.len == 0 {
                i64::MAX
            } else {
                r.start + r.len
            }
        };
        self.start < end(other) && other.start < end(self)
    }

    /// Two regions conflict when they overlap, have different owners and
    /// at least one of them is exclusive.
    fn conflicts_with(&self, other: &Self) -> bool {
        if self.owner == other.owner {
            return false;
        }
        if self.type_ != FlockType::Exclusive && other.type_ != FlockType::Exclusive {
            return false;
        }
        self.overlaps(other)
    }
}

/// All lock regions of one inode.
#[derive(Debug, Default)]
pub struct FlockTable {
    regions: Mutex<Vec<FlockRegion>>,
}

impl FlockTable {
    /// Acquires `region` if no held region conflicts with it.
    pub fn try_lock(&self, region: FlockRegion) -> Result<()> {
        let mut regions = self.regions.lock();
        if regions.iter().any(|held| held.conflicts_with(&region)) {
            return_errno!(Errno::EAGAIN);
        }
        regions.push(region);
        Ok(())
    }

    /// Releases every region of `owner` overlapping the given range.
    pub fn unlock(&self, owner: u64, start: i64, len: i64) {
        let probe = FlockRegion {
            owner,
            type_: FlockType::Shared,
            start,
            len,
        };
        self.regions
            .lock()
            .retain(|held| held.owner != owner || !held.overlaps(&probe));
    }

    pub fn is_empty(&self) -> bool {
        self.regions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(owner: u64, type_: FlockType, start: i64, len: i64) -> FlockRegion {
        FlockRegion {
            owner,
            type_,
            start,
            len,
        }
    }

    #[test]
    fn shared_locks_coexist() {
        let table = FlockTable::default();
        table.try_lock(region(1, FlockType::Shared, 0, 100)).unwrap();
        table.try_lock(region(2, FlockType::Shared, 50, 100)).unwrap();
    }

    #[test]
    fn exclusive_conflicts() {
        let table = FlockTable::default();
        table
            .try_lock(region(1, FlockType::Exclusive, 0, 100))
            .unwrap();
        // Same owner may re-lock.
        table
            .try_lock(region(1, FlockType::Shared, 10, 10))
            .unwrap();
        assert_eq!(
            table
                .try_lock(region(2, FlockType::Shared, 10, 10))
                .unwrap_err()
                .error(),
            Errno::EAGAIN
        );
        // Outside the locked range is fine.
        table
            .try_lock(region(2, FlockType::Exclusive, 200, 10))
            .unwrap();

        table.unlock(1, 0, 100);
        table.try_lock(region(2, FlockType::Shared, 10, 10)).unwrap();
    }
}
