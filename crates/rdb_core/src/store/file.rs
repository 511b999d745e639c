//! Raw page I/O shared by the key and value stores.

use crate::error::{CoreError, CoreResult};
use crate::freelist::FreePageAllocator;
use rdb_storage::{StorageBackend, StorageError};

/// A page file and its allocator. Always used under the owning store's
/// mutex.
pub(crate) struct PageFile {
    backend: Box<dyn StorageBackend>,
    pub(crate) allocator: FreePageAllocator,
    name: &'static str,
}

impl std::fmt::Debug for PageFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFile")
            .field("name", &self.name)
            .field("allocator", &self.allocator)
            .finish()
    }
}

impl PageFile {
    pub(crate) fn new(
        backend: Box<dyn StorageBackend>,
        allocator: FreePageAllocator,
        name: &'static str,
    ) -> Self {
        Self {
            backend,
            allocator,
            name,
        }
    }

    pub(crate) fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Reads `buf.len()` bytes at `offset`. A read past the end of the file
    /// means a link points nowhere and is reported as a corrupt page.
    pub(crate) fn read(&self, offset: u64, buf: &mut [u8]) -> CoreResult<()> {
        match self.backend.read_into(offset, buf) {
            Ok(()) => Ok(()),
            Err(StorageError::ReadPastEnd { size, .. }) => Err(CoreError::corrupt_page(
                self.name,
                offset,
                format!("page lies past the end of the file ({size} bytes)"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn write(&mut self, offset: u64, data: &[u8]) -> CoreResult<()> {
        self.backend.write_at(offset, data)?;
        Ok(())
    }

    /// Allocates an offset and writes `data` there. On a failed write the
    /// offset goes back to the allocator before the error is returned.
    pub(crate) fn write_new(&mut self, data: &[u8]) -> CoreResult<u64> {
        let offset = self.allocator.get()?;
        if let Err(e) = self.backend.write_at(offset, data) {
            if let Err(free_err) = self.allocator.free(offset) {
                tracing::error!(
                    file = self.name,
                    offset,
                    error = %free_err,
                    "could not return offset after failed write"
                );
            }
            return Err(e.into());
        }
        Ok(offset)
    }

    pub(crate) fn free_page(&mut self, offset: u64) -> CoreResult<()> {
        self.allocator.free(offset)
    }

    pub(crate) fn sync(&mut self) -> CoreResult<()> {
        self.backend.sync()?;
        self.allocator.sync()
    }
}
