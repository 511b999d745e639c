//! Database attributes.
//!
//! A single fixed-size record at offset 0 of `<name>.attr`:
//!
//! ```text
//! ┌──────────┬─────────┬──────────┬──────────┬──────────┬──────────┬──────────┐
//! │ "RDBA"   │ version │ reserved │ htsize   │ key page │ val page │ reserved │
//! │ 4 bytes  │ u16     │ u16      │ u32      │ u32      │ u32      │ 12 bytes │
//! └──────────┴─────────┴──────────┴──────────┴──────────┴──────────┴──────────┘
//! ```

use crate::config::{validate_key_page_size, validate_value_page_size, MAX_PAGE_SIZE};
use crate::error::{CoreError, CoreResult};
use crate::prime::is_prime;
use rdb_storage::StorageBackend;
use std::io;

/// Magic bytes at the start of the attribute file.
pub const ATTR_MAGIC: [u8; 4] = *b"RDBA";

/// Current on-disk format version.
pub const FORMAT_VERSION: u16 = 1;

/// Size of the attribute record in bytes.
pub const ATTR_RECORD_SIZE: usize = 32;

/// Geometry of a database, fixed until the next rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    /// Format version the files were written with.
    pub version: u16,
    /// Number of hash directory slots. Always prime.
    pub hash_table_size: u32,
    /// Key page size in bytes.
    pub key_page_size: u32,
    /// Value page size in bytes.
    pub value_page_size: u32,
}

impl Attributes {
    /// Creates attributes for the current format version.
    #[must_use]
    pub fn new(hash_table_size: u32, key_page_size: u32, value_page_size: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            hash_table_size,
            key_page_size,
            value_page_size,
        }
    }

    /// Encodes the attribute record.
    #[must_use]
    pub fn encode(&self) -> [u8; ATTR_RECORD_SIZE] {
        let mut buf = [0u8; ATTR_RECORD_SIZE];
        buf[0..4].copy_from_slice(&ATTR_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.hash_table_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.key_page_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.value_page_size.to_le_bytes());
        buf
    }

    /// Decodes and validates an attribute record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for a bad magic, an unknown version, a
    /// non-prime directory size or out-of-range page sizes.
    pub fn decode(buf: &[u8; ATTR_RECORD_SIZE]) -> CoreResult<Self> {
        if buf[0..4] != ATTR_MAGIC {
            return Err(CoreError::invalid_format("bad attribute file magic"));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version == 0 || version > FORMAT_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported format version {version}"
            )));
        }

        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let attrs = Self {
            version,
            hash_table_size: word(8),
            key_page_size: word(12),
            value_page_size: word(16),
        };

        if !is_prime(u64::from(attrs.hash_table_size)) {
            return Err(CoreError::invalid_format(format!(
                "hash table size {} is not prime",
                attrs.hash_table_size
            )));
        }
        let page_sizes_ok = validate_key_page_size(attrs.key_page_size as usize).is_ok()
            && validate_value_page_size(attrs.value_page_size as usize).is_ok();
        if !page_sizes_ok {
            return Err(CoreError::invalid_format(format!(
                "page sizes {}/{} outside the supported range (max {MAX_PAGE_SIZE})",
                attrs.key_page_size, attrs.value_page_size
            )));
        }

        Ok(attrs)
    }
}

/// The attribute file.
pub struct AttributeStore {
    backend: Box<dyn StorageBackend>,
}

impl std::fmt::Debug for AttributeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeStore").finish_non_exhaustive()
    }
}

impl AttributeStore {
    /// Wraps an opened attribute file.
    #[must_use]
    pub fn open(backend: Box<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Reads the attribute record, or `None` for an empty file.
    ///
    /// # Errors
    ///
    /// Returns an `UnexpectedEof` I/O error if the file is shorter than
    /// one record, `InvalidFormat` if the record is invalid, or any other
    /// I/O error.
    pub fn read(&self) -> CoreResult<Option<Attributes>> {
        let size = self.backend.size()?;
        if size == 0 {
            return Ok(None);
        }
        if size < ATTR_RECORD_SIZE as u64 {
            return Err(CoreError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("attribute file has {size} of {ATTR_RECORD_SIZE} bytes"),
            )));
        }

        let mut buf = [0u8; ATTR_RECORD_SIZE];
        self.backend.read_into(0, &mut buf)?;
        Attributes::decode(&buf).map(Some)
    }

    /// Writes the attribute record and syncs it.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write or sync fails.
    pub fn write(&mut self, attrs: &Attributes) -> CoreResult<()> {
        self.backend.write_at(0, &attrs.encode())?;
        self.backend.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FailSwitch, FlakyBackend};
    use rdb_storage::{FileBackend, InMemoryBackend};
    use tempfile::tempdir;

    #[test]
    fn empty_file_has_no_attributes() {
        let store = AttributeStore::open(Box::new(InMemoryBackend::new()));
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.attr");
        let attrs = Attributes::new(101, 128, 256);

        {
            let mut store = AttributeStore::open(Box::new(FileBackend::open(&path).unwrap()));
            store.write(&attrs).unwrap();
        }

        let store = AttributeStore::open(Box::new(FileBackend::open(&path).unwrap()));
        assert_eq!(store.read().unwrap(), Some(attrs));
    }

    #[test]
    fn short_file_is_an_io_error() {
        let store = AttributeStore::open(Box::new(InMemoryBackend::with_data(b"RDBA\x01".to_vec())));
        match store.read().unwrap_err() {
            CoreError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn invalid_records_are_rejected() {
        let mut bad_magic = Attributes::new(101, 128, 256).encode();
        bad_magic[0] = b'X';
        assert!(Attributes::decode(&bad_magic).is_err());

        let not_prime = Attributes::new(100, 128, 256).encode();
        assert!(Attributes::decode(&not_prime).is_err());

        let mut newer = Attributes::new(101, 128, 256).encode();
        newer[4..6].copy_from_slice(&(FORMAT_VERSION + 1).to_le_bytes());
        assert!(Attributes::decode(&newer).is_err());

        let tiny_pages = Attributes::new(101, 8, 256).encode();
        assert!(Attributes::decode(&tiny_pages).is_err());
    }

    #[test]
    fn failed_write_carries_os_error() {
        let switch = FailSwitch::new();
        switch.fail_writes(true);
        let mut store =
            AttributeStore::open(Box::new(FlakyBackend::new(InMemoryBackend::new(), switch)));
        let err = store.write(&Attributes::new(7, 64, 64)).unwrap_err();
        assert_eq!(err.os_error(), Some(28));
    }
}
