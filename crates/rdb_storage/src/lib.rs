//! # RDB Storage
//!
//! Storage backend trait and implementations for RDB.
//!
//! This crate provides the lowest-level storage abstraction for RDB.
//! Storage backends are **opaque byte stores** - they do not interpret
//! the data they store. Pages, hash directories and free lists are all
//! owned by `rdb_core`.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (positional read, positional write, append)
//! - No knowledge of key pages, value pages or attributes
//! - Must be `Send + Sync` for concurrent access
//! - RDB owns all file format interpretation
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use rdb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.write_at(0, b"hello world").unwrap();
//! let data = backend.read_at(6, 5).unwrap();
//! assert_eq!(&data, b"world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
