//! Free-page allocation for the page files.
//!
//! Each page file owns one [`FreePageAllocator`]: a stack of reusable page
//! offsets whose bottom entry is the end-of-file frontier. Popping the
//! frontier pushes the next one, so the file grows one page at a time and
//! released pages are reused most-recent first.
//!
//! The value file keeps its stack on disk in a [`FreePageJournal`] so it
//! can be loaded on open instead of scanning the whole file.

use crate::error::{CoreError, CoreResult};
use rdb_storage::StorageBackend;
use tracing::error;

const ENTRY_SIZE: u64 = 8;

/// Persisted copy of a free-page stack.
///
/// The journal is a flat array of little-endian `u64` offsets. Pushing
/// appends an entry and popping truncates the last one.
pub struct FreePageJournal {
    backend: Box<dyn StorageBackend>,
}

impl std::fmt::Debug for FreePageJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreePageJournal")
            .field("size", &self.backend.size().ok())
            .finish()
    }
}

impl FreePageJournal {
    /// Wraps a backend holding the journal.
    #[must_use]
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Reads every entry, bottom of the stack first.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the journal length is not a whole number
    /// of entries, or an I/O error if it cannot be read.
    pub fn load(&self) -> CoreResult<Vec<u64>> {
        let size = self.backend.size()?;
        if size % ENTRY_SIZE != 0 {
            return Err(CoreError::invalid_format(format!(
                "free page journal has {size} bytes, not a multiple of {ENTRY_SIZE}"
            )));
        }

        let data = self.backend.read_at(0, size as usize)?;
        Ok(data
            .chunks_exact(ENTRY_SIZE as usize)
            .map(|chunk| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(chunk);
                u64::from_le_bytes(bytes)
            })
            .collect())
    }

    fn push(&mut self, offset: u64) -> CoreResult<()> {
        self.backend.append(&offset.to_le_bytes())?;
        Ok(())
    }

    fn pop(&mut self) -> CoreResult<()> {
        let size = self.backend.size()?;
        if size < ENTRY_SIZE {
            return Err(CoreError::invalid_state("free page journal is empty"));
        }
        self.backend.truncate(size - ENTRY_SIZE)?;
        Ok(())
    }

    fn clear(&mut self) -> CoreResult<()> {
        self.backend.truncate(0)?;
        Ok(())
    }

    fn sync(&mut self) -> CoreResult<()> {
        self.backend.sync()?;
        Ok(())
    }
}

/// Offset allocator for one page file.
///
/// Not synchronized: the owning store calls it under its own file mutex.
#[derive(Debug)]
pub struct FreePageAllocator {
    page_size: u64,
    /// Offset of the first page; everything before it is not paged.
    base: u64,
    stack: Vec<u64>,
    journal: Option<FreePageJournal>,
}

impl FreePageAllocator {
    /// Creates an empty allocator for pages of `page_size` bytes starting
    /// at `base`. It must be seeded before use.
    #[must_use]
    pub fn new(page_size: u64, base: u64) -> Self {
        Self {
            page_size,
            base,
            stack: Vec::new(),
            journal: None,
        }
    }

    /// Creates an allocator that mirrors every change into `journal`.
    #[must_use]
    pub fn with_journal(page_size: u64, base: u64, journal: FreePageJournal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new(page_size, base)
        }
    }

    /// Page size served by this allocator.
    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Number of entries on the stack, the frontier included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// Returns true if the allocator has not been seeded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Current stack contents, bottom first.
    #[must_use]
    pub fn entries(&self) -> &[u64] {
        &self.stack
    }

    /// Offset just past the highest page ever handed out.
    #[must_use]
    pub fn frontier(&self) -> Option<u64> {
        self.stack.first().copied()
    }

    /// Rounds a file size up to the next page boundary.
    #[must_use]
    pub fn align_end(&self, file_size: u64) -> u64 {
        if file_size <= self.base {
            return self.base;
        }
        let used = file_size - self.base;
        self.base + used.div_ceil(self.page_size) * self.page_size
    }

    /// Empties the stack and the journal, then pushes the frontier for a
    /// file of `file_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be rewritten.
    pub fn reset(&mut self, file_size: u64) -> CoreResult<()> {
        self.stack.clear();
        if let Some(journal) = self.journal.as_mut() {
            journal.clear()?;
        }
        let frontier = self.align_end(file_size);
        self.free(frontier)
    }

    /// Replaces the stack with entries loaded from the journal.
    pub(crate) fn restore(&mut self, entries: Vec<u64>) {
        self.stack = entries;
    }

    /// Loads the journal, if any.
    pub(crate) fn load_journal(&self) -> Option<CoreResult<Vec<u64>>> {
        self.journal.as_ref().map(FreePageJournal::load)
    }

    /// Takes an offset for a new page.
    ///
    /// # Errors
    ///
    /// Returns `AllocationExhausted` if the stack was never seeded or the
    /// file cannot grow further, or an I/O error if the journal update
    /// fails. The stack is unchanged on error.
    pub fn get(&mut self) -> CoreResult<u64> {
        let offset = self
            .stack
            .pop()
            .ok_or_else(|| CoreError::allocation_exhausted("free page stack is empty"))?;

        if let Err(e) = self.journal_pop() {
            self.stack.push(offset);
            return Err(e);
        }

        if self.stack.is_empty() {
            let Some(next) = offset.checked_add(self.page_size) else {
                self.undo_pop(offset);
                return Err(CoreError::allocation_exhausted("page file offset space"));
            };
            if let Err(e) = self.journal_push(next) {
                self.undo_pop(offset);
                return Err(e);
            }
            self.stack.push(next);
        }

        Ok(offset)
    }

    /// Returns an offset for reuse.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an offset that is not on a page
    /// boundary, or an I/O error if the journal update fails. The stack is
    /// unchanged on error.
    pub fn free(&mut self, offset: u64) -> CoreResult<()> {
        if offset < self.base || (offset - self.base) % self.page_size != 0 {
            return Err(CoreError::invalid_argument(format!(
                "offset {offset} is not a page boundary (base {}, page size {})",
                self.base, self.page_size
            )));
        }

        self.journal_push(offset)?;
        self.stack.push(offset);
        Ok(())
    }

    /// Flushes the journal to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be synced.
    pub fn sync(&mut self) -> CoreResult<()> {
        match self.journal.as_mut() {
            Some(journal) => journal.sync(),
            None => Ok(()),
        }
    }

    fn journal_push(&mut self, offset: u64) -> CoreResult<()> {
        match self.journal.as_mut() {
            Some(journal) => journal.push(offset),
            None => Ok(()),
        }
    }

    fn journal_pop(&mut self) -> CoreResult<()> {
        match self.journal.as_mut() {
            Some(journal) => journal.pop(),
            None => Ok(()),
        }
    }

    fn undo_pop(&mut self, offset: u64) {
        if let Err(e) = self.journal_push(offset) {
            error!(offset, error = %e, "free page journal is out of step with memory");
        }
        self.stack.push(offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FailSwitch, FlakyBackend};
    use rdb_storage::InMemoryBackend;

    #[test]
    fn frontier_grows_one_page_at_a_time() {
        let mut alloc = FreePageAllocator::new(64, 0);
        alloc.reset(0).unwrap();

        assert_eq!(alloc.get().unwrap(), 0);
        assert_eq!(alloc.get().unwrap(), 64);
        assert_eq!(alloc.get().unwrap(), 128);
        assert_eq!(alloc.frontier(), Some(192));
        assert_eq!(alloc.len(), 1);
    }

    #[test]
    fn freed_pages_are_reused_lifo() {
        let mut alloc = FreePageAllocator::new(64, 0);
        alloc.reset(256).unwrap();

        alloc.free(64).unwrap();
        alloc.free(128).unwrap();
        assert_eq!(alloc.get().unwrap(), 128);
        assert_eq!(alloc.get().unwrap(), 64);
        assert_eq!(alloc.get().unwrap(), 256);
        assert_eq!(alloc.get().unwrap(), 320);
    }

    #[test]
    fn base_offset_and_alignment() {
        let mut alloc = FreePageAllocator::new(100, 1000);
        alloc.reset(1050).unwrap();
        assert_eq!(alloc.frontier(), Some(1100));

        assert!(alloc.free(1050).is_err());
        assert!(alloc.free(900).is_err());
        assert!(alloc.free(1000).is_ok());
        assert_eq!(alloc.get().unwrap(), 1000);
    }

    #[test]
    fn unseeded_get_is_exhausted() {
        let mut alloc = FreePageAllocator::new(64, 0);
        let err = alloc.get().unwrap_err();
        assert!(matches!(err, CoreError::AllocationExhausted { .. }));
    }

    #[test]
    fn journal_tracks_stack() {
        let journal = FreePageJournal::new(Box::new(InMemoryBackend::new()));
        let mut alloc = FreePageAllocator::with_journal(32, 0, journal);
        alloc.reset(96).unwrap();
        alloc.free(32).unwrap();
        alloc.free(0).unwrap();
        assert_eq!(alloc.load_journal().unwrap().unwrap(), vec![96, 32, 0]);

        assert_eq!(alloc.get().unwrap(), 0);
        assert_eq!(alloc.get().unwrap(), 32);
        assert_eq!(alloc.get().unwrap(), 96);
        assert_eq!(alloc.load_journal().unwrap().unwrap(), vec![128]);
        assert_eq!(alloc.entries(), &[128]);
    }

    #[test]
    fn failed_journal_write_leaves_stack_unchanged() {
        let switch = FailSwitch::new();
        let backend = FlakyBackend::new(InMemoryBackend::new(), switch.clone());
        let mut alloc =
            FreePageAllocator::with_journal(32, 0, FreePageJournal::new(Box::new(backend)));
        alloc.reset(0).unwrap();
        alloc.free(64).unwrap();

        switch.fail_writes(true);
        assert!(alloc.free(96).is_err());
        assert!(alloc.get().is_err());
        assert_eq!(alloc.entries(), &[0, 64]);

        switch.fail_writes(false);
        assert_eq!(alloc.get().unwrap(), 64);
        assert_eq!(alloc.load_journal().unwrap().unwrap(), vec![0]);
    }
}
