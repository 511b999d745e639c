//! Database configuration.

use crate::error::{CoreError, CoreResult};
use crate::page::{KEY_HEADER_SIZE, VALUE_HEADER_SIZE};

/// Smallest accepted key page size.
pub const MIN_KEY_PAGE_SIZE: usize = 64;

/// Smallest accepted value page size.
pub const MIN_VALUE_PAGE_SIZE: usize = 32;

/// Largest accepted page size for either file.
pub const MAX_PAGE_SIZE: usize = 1024 * 1024;

/// Largest accepted hash directory size (before prime rounding).
pub const MAX_HASH_TABLE_SIZE: u32 = 1 << 28;

/// Accepted range for [`Config::memory_usage_percent`].
pub const MEMORY_USAGE_RANGE: std::ops::RangeInclusive<u32> = 2..=150;

/// Largest accepted [`Config::key_cache_percent`]. The rest of the memory
/// budget always stays with the page arena.
pub const MAX_KEY_CACHE_PERCENT: u32 = 90;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Requested number of hash directory slots. Rounded up to a prime
    /// when the database is created.
    pub hash_table_size: u32,

    /// Size of one key page in bytes.
    pub key_page_size: usize,

    /// Size of one value page in bytes.
    pub value_page_size: usize,

    /// Share of physical memory the page arena and the key page cache
    /// may use together, in percent.
    pub memory_usage_percent: u32,

    /// Part of that memory budget given to the key page cache, in percent.
    /// Zero disables the cache.
    pub key_cache_percent: u32,

    /// Sync the value file after every write.
    pub sync_data_file: bool,

    /// Sync the key file after every write.
    pub sync_index_file: bool,

    /// Largest value accepted by `set`.
    pub max_value_len: usize,

    /// Optional hard cap in bytes on the memory budget shared by the page
    /// arena and the key page cache.
    pub arena_limit: Option<usize>,

    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hash_table_size: 500_000,
            key_page_size: 128,
            value_page_size: 256,
            memory_usage_percent: 75,
            key_cache_percent: 25,
            sync_data_file: true,
            sync_index_file: false,
            max_value_len: 1024 * 1024, // 1 MiB
            arena_limit: None,
            create_if_missing: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the requested hash directory size.
    #[must_use]
    pub const fn hash_table_size(mut self, size: u32) -> Self {
        self.hash_table_size = size;
        self
    }

    /// Sets the key page size.
    #[must_use]
    pub const fn key_page_size(mut self, size: usize) -> Self {
        self.key_page_size = size;
        self
    }

    /// Sets the value page size.
    #[must_use]
    pub const fn value_page_size(mut self, size: usize) -> Self {
        self.value_page_size = size;
        self
    }

    /// Sets the memory usage percentage for the page arena.
    #[must_use]
    pub const fn memory_usage_percent(mut self, percent: u32) -> Self {
        self.memory_usage_percent = percent;
        self
    }

    /// Sets the share of the memory budget used for caching key pages.
    #[must_use]
    pub const fn key_cache_percent(mut self, percent: u32) -> Self {
        self.key_cache_percent = percent;
        self
    }

    /// Sets whether value file writes are synced.
    #[must_use]
    pub const fn sync_data_file(mut self, value: bool) -> Self {
        self.sync_data_file = value;
        self
    }

    /// Sets whether key file writes are synced.
    #[must_use]
    pub const fn sync_index_file(mut self, value: bool) -> Self {
        self.sync_index_file = value;
        self
    }

    /// Sets the largest accepted value length.
    #[must_use]
    pub const fn max_value_len(mut self, len: usize) -> Self {
        self.max_value_len = len;
        self
    }

    /// Caps the memory budget at `bytes`.
    #[must_use]
    pub const fn arena_limit(mut self, bytes: usize) -> Self {
        self.arena_limit = Some(bytes);
        self
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Longest key a key page of this configuration can hold.
    #[must_use]
    pub const fn max_key_len(&self) -> usize {
        self.key_page_size.saturating_sub(KEY_HEADER_SIZE)
    }

    /// Checks every field against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the first offending field.
    pub fn validate(&self) -> CoreResult<()> {
        validate_hash_table_size(self.hash_table_size)?;
        validate_key_page_size(self.key_page_size)?;
        validate_value_page_size(self.value_page_size)?;

        if !MEMORY_USAGE_RANGE.contains(&self.memory_usage_percent) {
            return Err(CoreError::invalid_argument(format!(
                "memory usage {}% outside [{}, {}]",
                self.memory_usage_percent,
                MEMORY_USAGE_RANGE.start(),
                MEMORY_USAGE_RANGE.end()
            )));
        }

        if self.key_cache_percent > MAX_KEY_CACHE_PERCENT {
            return Err(CoreError::invalid_argument(format!(
                "key cache share {}% above {MAX_KEY_CACHE_PERCENT}%",
                self.key_cache_percent
            )));
        }

        if self.max_value_len == 0 || self.max_value_len > u32::MAX as usize {
            return Err(CoreError::invalid_argument(format!(
                "max value length {} out of range",
                self.max_value_len
            )));
        }

        if self.arena_limit == Some(0) {
            return Err(CoreError::invalid_argument("arena limit must be non-zero"));
        }

        Ok(())
    }
}

pub(crate) fn validate_hash_table_size(size: u32) -> CoreResult<()> {
    if size == 0 || size > MAX_HASH_TABLE_SIZE {
        return Err(CoreError::invalid_argument(format!(
            "hash table size {size} outside [1, {MAX_HASH_TABLE_SIZE}]"
        )));
    }
    Ok(())
}

pub(crate) fn validate_key_page_size(size: usize) -> CoreResult<()> {
    if !(MIN_KEY_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) {
        return Err(CoreError::invalid_argument(format!(
            "key page size {size} outside [{MIN_KEY_PAGE_SIZE}, {MAX_PAGE_SIZE}]"
        )));
    }
    debug_assert!(size > KEY_HEADER_SIZE);
    Ok(())
}

pub(crate) fn validate_value_page_size(size: usize) -> CoreResult<()> {
    if !(MIN_VALUE_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) {
        return Err(CoreError::invalid_argument(format!(
            "value page size {size} outside [{MIN_VALUE_PAGE_SIZE}, {MAX_PAGE_SIZE}]"
        )));
    }
    debug_assert!(size > VALUE_HEADER_SIZE);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.hash_table_size, 500_000);
        assert_eq!(config.memory_usage_percent, 75);
        assert!(config.sync_data_file);
        assert!(!config.sync_index_file);
        assert!(config.create_if_missing);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .hash_table_size(101)
            .key_page_size(96)
            .value_page_size(64)
            .sync_data_file(false)
            .arena_limit(1 << 20);

        assert_eq!(config.hash_table_size, 101);
        assert_eq!(config.max_key_len(), 96 - KEY_HEADER_SIZE);
        assert!(!config.sync_data_file);
        assert_eq!(config.arena_limit, Some(1 << 20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn memory_usage_bounds() {
        assert!(Config::new().memory_usage_percent(1).validate().is_err());
        assert!(Config::new().memory_usage_percent(2).validate().is_ok());
        assert!(Config::new().memory_usage_percent(150).validate().is_ok());
        assert!(Config::new().memory_usage_percent(151).validate().is_err());
    }

    #[test]
    fn key_cache_share_bounds() {
        assert_eq!(Config::default().key_cache_percent, 25);
        assert!(Config::new().key_cache_percent(0).validate().is_ok());
        assert!(Config::new().key_cache_percent(90).validate().is_ok());
        assert!(Config::new().key_cache_percent(91).validate().is_err());
    }

    #[test]
    fn page_size_bounds() {
        assert!(Config::new().key_page_size(MIN_KEY_PAGE_SIZE - 1).validate().is_err());
        assert!(Config::new().value_page_size(MIN_VALUE_PAGE_SIZE - 1).validate().is_err());
        assert!(Config::new().value_page_size(MAX_PAGE_SIZE + 1).validate().is_err());
        assert!(Config::new().hash_table_size(0).validate().is_err());
    }
}
