//! Database statistics.
//!
//! Operation counters plus a point-in-time description of the files.
//!
//! # Usage
//!
//! ```rust,ignore
//! use rdb_core::Database;
//!
//! let db = Database::open_with_config(path, "users", Config::default())?;
//! db.set(b"alice", b"admin")?;
//!
//! let stats = db.stats();
//! println!("Writes: {}", stats.writes);
//! println!("Bytes written: {}", stats.bytes_written);
//! ```

use crate::cache::CacheStats;
use std::sync::atomic::{AtomicU64, Ordering};

/// Database statistics and metrics.
///
/// All counters are atomic and can be read while operations are in progress.
/// Values are monotonically increasing.
#[derive(Debug, Default)]
pub struct DatabaseStats {
    // Operation counters
    /// Total number of `get` calls.
    reads: AtomicU64,
    /// `get` calls that found no value.
    misses: AtomicU64,
    /// Total number of stored values (`set` and `update`).
    writes: AtomicU64,
    /// Total number of keys actually removed.
    deletes: AtomicU64,
    /// Total number of `update` calls.
    updates: AtomicU64,
    /// Total number of full scans.
    scans: AtomicU64,
    /// Total number of completed rebuilds.
    rebuilds: AtomicU64,

    // Bytes counters
    /// Total value bytes written.
    bytes_written: AtomicU64,
    /// Total value bytes read.
    bytes_read: AtomicU64,

    // Error counters
    /// Total number of failed operations.
    errors: AtomicU64,
}

impl DatabaseStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a `get` that returned `bytes` bytes, or missed.
    pub(crate) fn record_read(&self, bytes: Option<usize>) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        match bytes {
            Some(n) => {
                self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Records a stored value.
    pub(crate) fn record_write(&self, bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Records a removed key.
    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an `update` call.
    pub(crate) fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a full scan.
    pub(crate) fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed rebuild.
    pub(crate) fn record_rebuild(&self) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an error.
    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total number of `get` calls.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns the number of `get` calls that found nothing.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Returns the total number of stored values.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns the total number of removed keys.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Returns the total number of `update` calls.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Returns the total number of full scans.
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    /// Returns the total number of completed rebuilds.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    /// Returns the total value bytes written.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Returns the total value bytes read.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Returns the total number of errors.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads(),
            misses: self.misses(),
            writes: self.writes(),
            deletes: self.deletes(),
            updates: self.updates(),
            scans: self.scans(),
            rebuilds: self.rebuilds(),
            bytes_written: self.bytes_written(),
            bytes_read: self.bytes_read(),
            errors: self.errors(),
        }
    }
}

/// A point-in-time snapshot of database statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Total number of `get` calls.
    pub reads: u64,
    /// `get` calls that found nothing.
    pub misses: u64,
    /// Total number of stored values.
    pub writes: u64,
    /// Total number of removed keys.
    pub deletes: u64,
    /// Total number of `update` calls.
    pub updates: u64,
    /// Total number of full scans.
    pub scans: u64,
    /// Total number of completed rebuilds.
    pub rebuilds: u64,
    /// Total value bytes written.
    pub bytes_written: u64,
    /// Total value bytes read.
    pub bytes_read: u64,
    /// Total number of errors.
    pub errors: u64,
}

/// Geometry and space usage of an open database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    /// On-disk format version.
    pub version: u16,
    /// Number of hash directory slots.
    pub hash_table_size: u32,
    /// Key page size in bytes.
    pub key_page_size: usize,
    /// Value page size in bytes.
    pub value_page_size: usize,
    /// Size of the key file in bytes.
    pub key_file_size: u64,
    /// Size of the value file in bytes.
    pub value_file_size: u64,
    /// Key pages waiting for reuse.
    pub free_key_pages: usize,
    /// Value pages waiting for reuse.
    pub free_value_pages: usize,
    /// Arena pages the arena can issue at most.
    pub arena_capacity: usize,
    /// Arena pages currently on loan.
    pub arena_in_use: usize,
    /// Key page cache counters.
    pub key_cache: CacheStats,
}
