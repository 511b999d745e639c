//! Test fixtures and database helpers.
//!
//! Every fixture lives in its own temporary directory and uses small
//! pages so that chains, overflow values and free-page reuse show up
//! after a handful of operations.

use rdb_core::{Config, CoreResult, Database};
use std::path::Path;
use tempfile::TempDir;

/// Database name used by the fixtures.
pub const TEST_DB_NAME: &str = "test";

/// Arena cap for test databases; keeps parallel tests cheap.
pub const TEST_ARENA_LIMIT: usize = 1 << 20;

/// Configuration with a small prime directory and 64-byte pages.
pub fn small_config() -> Config {
    Config::default()
        .hash_table_size(101)
        .key_page_size(64)
        .value_page_size(64)
        .arena_limit(TEST_ARENA_LIMIT)
}

/// Configuration whose directory is tiny, so most keys collide.
pub fn colliding_config() -> Config {
    small_config().hash_table_size(3)
}

/// A file-backed test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    config: Config,
    // Dropped after `db`, so the files outlive the handle.
    temp_dir: TempDir,
}

impl TestDatabase {
    /// Creates a database with [`small_config`].
    pub fn new() -> Self {
        Self::with_config(small_config())
    }

    /// Creates a database with the given configuration.
    pub fn with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open_with_config(temp_dir.path(), TEST_DB_NAME, config.clone())
            .expect("Failed to open test database");
        Self {
            db,
            config,
            temp_dir,
        }
    }

    /// Directory holding the database files.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Closes the handle and opens a fresh one on the same files.
    pub fn reopen(&mut self) -> CoreResult<()> {
        self.db.close()?;
        self.db =
            Database::open_with_config(self.temp_dir.path(), TEST_DB_NAME, self.config.clone())?;
        Ok(())
    }

    /// Inserts `count` keys produced by [`numbered_key`] with values from
    /// [`numbered_value`].
    pub fn populate(&self, count: usize) -> CoreResult<()> {
        for i in 0..count {
            self.db.set(&numbered_key(i), &numbered_value(i))?;
        }
        Ok(())
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Deterministic key for index `i`.
pub fn numbered_key(i: usize) -> Vec<u8> {
    format!("key-{i:06}").into_bytes()
}

/// Deterministic value for index `i`. Lengths vary so that some values
/// span several 64-byte value pages.
pub fn numbered_value(i: usize) -> Vec<u8> {
    let len = (i * 37) % 300;
    (0..len).map(|j| ((i + j) % 251) as u8).collect()
}

/// Runs a test with a temporary database.
///
/// # Example
///
/// ```rust,ignore
/// use rdb_testkit::with_temp_db;
///
/// #[test]
/// fn my_test() {
///     with_temp_db(|db| {
///         db.set(b"k", b"v").unwrap();
///     });
/// }
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::new();
    f(&test_db.db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_opens_and_reopens() {
        let mut db = TestDatabase::new();
        db.populate(20).unwrap();
        db.reopen().unwrap();
        assert_eq!(db.len().unwrap(), 20);
        assert_eq!(db.get(&numbered_key(7)).unwrap(), Some(numbered_value(7)));
    }

    #[test]
    fn numbered_values_span_pages() {
        assert!((0..50).any(|i| numbered_value(i).len() > 128));
        assert!((0..50).any(|i| numbered_value(i).is_empty()));
    }
}
