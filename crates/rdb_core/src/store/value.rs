//! Value store: value pages addressed by offset.
//!
//! The free-page stack of the value file is persisted in a journal. On
//! open the journal is trusted only if it is consistent with the page
//! flags on disk; otherwise the file is scanned.

use super::file::PageFile;
use crate::arena::PageArena;
use crate::error::{CoreError, CoreResult};
use crate::freelist::{FreePageAllocator, FreePageJournal};
use crate::page::{self, is_live, ValuePage, VALUE_FILE};
use parking_lot::Mutex;
use rdb_storage::StorageBackend;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Value pages plus their allocator.
#[derive(Debug)]
pub struct ValueStore {
    file: Mutex<PageFile>,
    page_size: usize,
}

impl ValueStore {
    /// Opens the value store on `backend`.
    ///
    /// With a `journal`, the free list is loaded from it when it passes
    /// validation and rebuilt by scanning the value file when it does not.
    /// Without one, the value file is always scanned.
    ///
    /// # Errors
    ///
    /// Returns an I/O error, or `AllocationExhausted` if no arena page is
    /// free for the scan.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        journal: Option<Box<dyn StorageBackend>>,
        page_size: usize,
        arena: &PageArena,
    ) -> CoreResult<Self> {
        let mut allocator = match journal {
            Some(journal) => FreePageAllocator::with_journal(
                page_size as u64,
                0,
                FreePageJournal::new(journal),
            ),
            None => FreePageAllocator::new(page_size as u64, 0),
        };

        let size = backend.size()?;
        let journaled = match allocator.load_journal() {
            Some(Ok(entries)) if !entries.is_empty() => {
                match validate_journal(backend.as_ref(), &allocator, &entries, size, arena) {
                    Ok(()) => Some(entries),
                    Err(e) => {
                        warn!(error = %e, "free page journal rejected, scanning value file");
                        None
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "free page journal unreadable, scanning value file");
                None
            }
            _ => None,
        };

        match journaled {
            Some(entries) => {
                debug!(entries = entries.len(), "loaded value free list from journal");
                allocator.restore(entries);
            }
            None => {
                allocator.reset(size)?;
                scan_free_pages(backend.as_ref(), &mut allocator, page_size, size, arena)?;
            }
        }

        Ok(Self {
            file: Mutex::new(PageFile::new(backend, allocator, VALUE_FILE)),
            page_size,
        })
    }

    /// Value page size in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Current size of the value file.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    pub fn size(&self) -> CoreResult<u64> {
        self.file.lock().size()
    }

    /// Offsets of every page slot currently in the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file size cannot be determined.
    pub fn page_offsets(&self) -> CoreResult<impl Iterator<Item = u64>> {
        let size = self.size()?;
        let end = size - size % self.page_size as u64;
        Ok((0..end).step_by(self.page_size))
    }

    /// Reusable offsets, excluding the end-of-file frontier.
    #[must_use]
    pub fn free_pages(&self) -> Vec<u64> {
        let file = self.file.lock();
        file.allocator.entries().iter().skip(1).copied().collect()
    }

    /// Reads raw bytes of the page at `offset` into `buf`.
    ///
    /// # Errors
    ///
    /// Returns `CorruptPage` if the range is past the end of the file, or
    /// an I/O error.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> CoreResult<()> {
        self.file.lock().read(offset, buf)
    }

    /// Reads and decodes the live value page at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `CorruptPage` if the page is not live or fails validation,
    /// `AllocationExhausted` if no arena page is free, or an I/O error.
    pub fn read_page(&self, offset: u64, arena: &PageArena) -> CoreResult<ValuePage> {
        let mut lease = arena.lease()?;
        let buf = &mut lease[..self.page_size];
        self.read(offset, buf)?;
        ValuePage::decode(buf, offset)
    }

    /// Reads only the flags of the page at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `CorruptPage` if the page is past the end of the file, or
    /// an I/O error.
    pub fn read_flags(&self, offset: u64) -> CoreResult<u16> {
        let mut flags = [0u8; 2];
        self.read(offset, &mut flags)?;
        Ok(page::page_flags(&flags))
    }

    /// Writes a whole page image at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails.
    pub fn write(&self, offset: u64, buf: &[u8]) -> CoreResult<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        self.check_offset(offset)?;
        self.file.lock().write(offset, buf)
    }

    /// Writes a whole page image at a freshly allocated offset.
    ///
    /// # Errors
    ///
    /// Returns an allocation or I/O error. No offset is leaked on failure.
    pub fn write_new(&self, buf: &[u8]) -> CoreResult<u64> {
        debug_assert_eq!(buf.len(), self.page_size);
        self.file.lock().write_new(buf)
    }

    /// Rewrites only the flags of the page at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails.
    pub fn write_flags(&self, offset: u64, flags: u16) -> CoreResult<()> {
        self.check_offset(offset)?;
        self.file.lock().write(offset, &flags.to_le_bytes())
    }

    /// Returns the page at `offset` to the free list.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `offset` is not a page boundary, or an
    /// I/O error if the journal update fails.
    pub fn free_page(&self, offset: u64) -> CoreResult<()> {
        self.file.lock().free_page(offset)
    }

    /// Syncs the value file and its journal to disk.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.file.lock().sync()
    }

    fn check_offset(&self, offset: u64) -> CoreResult<()> {
        if offset % self.page_size as u64 != 0 {
            return Err(CoreError::invalid_argument(format!(
                "{offset} is not a value page offset"
            )));
        }
        Ok(())
    }
}

/// Accepts a journal only if its bottom entry covers the end of the file
/// and every other entry is a distinct, free page inside the file.
fn validate_journal(
    backend: &dyn StorageBackend,
    allocator: &FreePageAllocator,
    entries: &[u64],
    size: u64,
    arena: &PageArena,
) -> CoreResult<()> {
    let page_size = allocator.page_size();
    let (&frontier, pages) = entries
        .split_first()
        .ok_or_else(|| CoreError::invalid_format("empty free page journal"))?;

    if frontier % page_size != 0 || frontier < allocator.align_end(size) {
        return Err(CoreError::invalid_format(format!(
            "journal frontier {frontier} does not cover a {size}-byte value file"
        )));
    }

    let mut lease = arena.lease()?;
    let header = &mut lease[..2];
    let mut seen = HashSet::with_capacity(pages.len());

    for &offset in pages {
        if offset % page_size != 0 || offset + page_size > size {
            return Err(CoreError::invalid_format(format!(
                "journal names {offset}, which is not a page in the value file"
            )));
        }
        if !seen.insert(offset) {
            return Err(CoreError::invalid_format(format!(
                "journal names {offset} twice"
            )));
        }
        backend.read_into(offset, header)?;
        if is_live(page::page_flags(header)) {
            return Err(CoreError::invalid_format(format!(
                "journal names {offset}, which is in use"
            )));
        }
    }

    Ok(())
}

fn scan_free_pages(
    backend: &dyn StorageBackend,
    allocator: &mut FreePageAllocator,
    page_size: usize,
    size: u64,
    arena: &PageArena,
) -> CoreResult<()> {
    let mut lease = arena.lease()?;
    let header = &mut lease[..2];
    let mut offset = 0u64;
    let mut free = 0usize;

    while offset + page_size as u64 <= size {
        backend.read_into(offset, header)?;
        let flags = page::page_flags(header);
        if flags & !(page::FLAG_IN_USE | page::FLAG_DELETED | page::FLAG_OVERFLOW) != 0 {
            warn!(offset, flags, "value page has unknown flags, leaving it out of the free list");
        } else if !is_live(flags) {
            allocator.free(offset)?;
            free += 1;
        }
        offset += page_size as u64;
    }

    debug!(free, size, "scanned value file");
    Ok(())
}
