//! # RDB Core
//!
//! Hash-indexed persistent key/value engine for RDB.
//!
//! This crate provides:
//! - Attribute file holding the database geometry
//! - Key file: a persistent hash directory with chained key pages
//! - Value file: value pages with overflow chains and a journaled free list
//! - A bounded page arena for I/O staging
//! - An LRU cache of decoded key pages
//! - Bucket-striped reader/writer locking over a pooled lock set
//! - Rebuild for compaction and resizing, and a consistency checker

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod arena;
pub mod attr;
mod cache;
mod config;
mod database;
pub mod dir;
mod error;
pub mod freelist;
pub mod hash;
pub mod lock;
pub mod page;
pub mod prime;
mod rebuild;
mod stats;
pub mod store;
mod table;
mod undo;
mod verify;

#[cfg(test)]
mod testutil;

pub use arena::{ArenaPage, PageArena, PageLease};
pub use attr::{AttributeStore, Attributes, FORMAT_VERSION};
pub use cache::{CacheStats, KeyPageCache};
pub use config::{
    Config, MAX_HASH_TABLE_SIZE, MAX_KEY_CACHE_PERCENT, MAX_PAGE_SIZE, MEMORY_USAGE_RANGE,
    MIN_KEY_PAGE_SIZE, MIN_VALUE_PAGE_SIZE,
};
pub use database::Database;
pub use error::{CoreError, CoreResult};
pub use prime::next_prime;
pub use rebuild::RebuildStats;
pub use stats::{DatabaseInfo, DatabaseStats, StatsSnapshot};
pub use verify::VerifyReport;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
