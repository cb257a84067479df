// SPDX-License-Identifier: MPL-2.0

//! Server configuration.
//!
//! Only the knobs the metadata engine itself consumes live here; parsing
//! them from files or flags is the host's business.

use std::path::PathBuf;

/// How a data thread treats expected idempotent errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    /// `EEXIST` on create, `ENOENT` on remove and `ENODATA` on xattr
    /// removal are reported to the caller but not counted as failures:
    /// versioning and persistence proceed as if the operation succeeded.
    Loose,
    /// Any non-zero result is a failure.
    Strict,
}

/// Settings for the on-disk persistence pipeline.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding the redo logs.
    pub path: PathBuf,
    /// Write buffer size for each redo log.
    pub binlog_buffer_size: usize,
    /// Number of data-sync worker threads.
    pub data_sync_threads: usize,
}

impl StorageConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            binlog_buffer_size: 64 * 1024,
            data_sync_threads: 2,
        }
    }
}

/// Top-level configuration of the metadata server core.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of single-threaded data shards.
    pub data_threads: usize,
    /// Grace window before logically removed dentries are reclaimed.
    pub delay_free_seconds: i64,
    /// Replication acknowledgement timeout.
    pub network_timeout_seconds: i64,
    /// Slots in each follower's push-result ring.
    pub push_result_ring_size: usize,
    pub error_mode: ErrorMode,
    /// `None` disables the persistence pipeline.
    pub storage: Option<StorageConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_threads: 4,
            delay_free_seconds: 60,
            network_timeout_seconds: 30,
            push_result_ring_size: 4096,
            error_mode: ErrorMode::Loose,
            storage: None,
        }
    }
}
