//! # RDB Testkit
//!
//! Test utilities for RDB.
//!
//! This crate provides:
//! - Temporary databases with small geometry
//! - Property-based test generators using proptest
//! - A `HashMap` oracle that replays operation sequences
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rdb_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_database() {
//!     with_temp_db(|db| {
//!         db.set(b"key", b"value").unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod oracle;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::oracle::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use oracle::*;
pub use stress::*;
