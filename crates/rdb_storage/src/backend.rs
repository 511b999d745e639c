//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level storage backend for RDB.
///
/// Storage backends are **opaque byte stores**. They provide positional
/// reads and writes plus appends. RDB owns all file format interpretation -
/// backends do not understand pages, chains or directories.
///
/// # Invariants
///
/// - `write_at` followed by `read_at` on the same range returns the written bytes
/// - Writing past the current end grows the storage, zero-filling any gap
/// - `append` returns the offset where data was written
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The offset is beyond the current size
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        self.read_into(offset, &mut buffer)?;
        Ok(buffer)
    }

    /// Fills `buf` with the bytes starting at `offset`.
    ///
    /// This is the allocation-free form of [`read_at`](Self::read_at), used
    /// to read pages straight into caller-owned staging buffers.
    ///
    /// # Errors
    ///
    /// Same conditions as [`read_at`](Self::read_at).
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()>;

    /// Writes `data` at `offset`, growing the storage if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Appends data to the end of the storage.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Flushes all pending writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// This is the offset where the next `append` will write.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// This is a stronger guarantee than `flush` - it ensures that
    /// file metadata (size, timestamps) is also durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the storage to the given size.
    ///
    /// This removes all data after the specified offset. RDB uses it to
    /// pop entries off the persisted free-page journal.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The truncation fails
    /// - `new_size` is greater than current size
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}

impl<B: StorageBackend + ?Sized> StorageBackend for Box<B> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        (**self).read_at(offset, len)
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        (**self).read_into(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        (**self).write_at(offset, data)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        (**self).append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        (**self).flush()
    }

    fn size(&self) -> StorageResult<u64> {
        (**self).size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        (**self).sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        (**self).truncate(new_size)
    }
}
