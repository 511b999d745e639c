//! Key store: the hash directory and the chained key pages.
//!
//! ```text
//! key file
//! ┌──────────────────────────────┬─────────┬────────┬────────┬─────
//! │ slot 0 │ slot 1 │ … │ slot N-1│ padding │ page 0 │ page 1 │ …
//! └──────────────────────────────┴─────────┴────────┴────────┴─────
//!   8 bytes each, u64::MAX = empty           key_page_size each
//! ```
//!
//! The directory is mirrored in memory. Its slots are only changed under
//! the owning bucket's write lock, so the mirror never needs the file
//! mutex to be read.
//!
//! Decoded pages may be kept in a [`KeyPageCache`]. Every writer drops the
//! cached copy of the page it touched.

use super::file::PageFile;
use crate::arena::PageArena;
use crate::cache::KeyPageCache;
use crate::error::{CoreError, CoreResult};
use crate::freelist::FreePageAllocator;
use crate::page::{
    self, is_live, KeyPage, KEY_FILE, KEY_FLAGS_OFFSET, KEY_NEXT_OFFSET, KEY_PREV_OFFSET,
    KEY_VALUE_REF_OFFSET, NIL,
};
use parking_lot::Mutex;
use rdb_storage::StorageBackend;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

const SLOT_SIZE: u64 = 8;
const INIT_CHUNK: usize = 64 * 1024;

/// Persistent hash directory plus key pages.
#[derive(Debug)]
pub struct KeyStore {
    file: Mutex<PageFile>,
    directory: Vec<AtomicU64>,
    cache: KeyPageCache,
    page_size: usize,
    data_start: u64,
}

impl KeyStore {
    /// Opens the key store on `backend`, creating an empty directory of
    /// `slots` entries if the backend is empty.
    ///
    /// Existing files are scanned once to rebuild the free-page list.
    /// Pages with unreadable flags are left alone and logged.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the file is too short for its directory
    /// or a slot holds an impossible offset, or an I/O error.
    pub fn open(
        mut backend: Box<dyn StorageBackend>,
        slots: u32,
        page_size: usize,
        arena: &PageArena,
    ) -> CoreResult<Self> {
        let directory_len = u64::from(slots) * SLOT_SIZE;
        let data_start = directory_len.div_ceil(page_size as u64) * page_size as u64;
        let mut allocator = FreePageAllocator::new(page_size as u64, data_start);

        let size = backend.size()?;
        let directory = if size == 0 {
            debug!(slots, page_size, "creating key file");
            write_empty_directory(backend.as_mut(), directory_len, data_start)?;
            allocator.reset(data_start)?;
            (0..slots).map(|_| AtomicU64::new(NIL)).collect()
        } else {
            if size < data_start {
                return Err(CoreError::invalid_format(format!(
                    "key file has {size} bytes, less than its {data_start}-byte directory"
                )));
            }
            let directory = load_directory(backend.as_ref(), slots, page_size, data_start, size)?;
            allocator.reset(size)?;
            scan_free_pages(backend.as_ref(), &mut allocator, page_size, data_start, size, arena)?;
            directory
        };

        Ok(Self {
            file: Mutex::new(PageFile::new(backend, allocator, KEY_FILE)),
            directory,
            cache: KeyPageCache::disabled(),
            page_size,
            data_start,
        })
    }

    /// Keeps up to `pages` decoded key pages in memory.
    #[must_use]
    pub fn with_cache_capacity(mut self, pages: usize) -> Self {
        self.cache = KeyPageCache::new(pages, self.page_size);
        self
    }

    /// The decoded-page cache.
    #[must_use]
    pub fn cache(&self) -> &KeyPageCache {
        &self.cache
    }

    /// Number of directory slots.
    #[must_use]
    pub fn slots(&self) -> u32 {
        self.directory.len() as u32
    }

    /// Key page size in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Offset of the first key page.
    #[must_use]
    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    /// Head of `bucket`'s chain, or [`NIL`].
    #[must_use]
    pub fn head(&self, bucket: u32) -> u64 {
        self.directory[bucket as usize].load(Ordering::Acquire)
    }

    /// Current size of the key file.
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
        let end = size - (size - self.data_start) % self.page_size as u64;
        Ok((self.data_start..end).step_by(self.page_size))
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

    /// Reads and decodes the live key page at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `CorruptPage` if the page is not live or fails validation,
    /// `AllocationExhausted` if no arena page is free, or an I/O error.
    pub fn read_page(&self, offset: u64, arena: &PageArena) -> CoreResult<KeyPage> {
        if let Some(page) = self.cache.get(offset) {
            return Ok(page);
        }
        let mut lease = arena.lease()?;
        let buf = &mut lease[..self.page_size];
        self.read(offset, buf)?;
        let page = KeyPage::decode(buf, offset)?;
        if self.cache.is_enabled() {
            self.cache.insert(offset, page.clone());
        }
        Ok(page)
    }

    /// Writes a whole page image at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails.
    pub fn write(&self, offset: u64, buf: &[u8]) -> CoreResult<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let result = self.file.lock().write(offset, buf);
        self.cache.invalidate(offset);
        result
    }

    /// Writes a whole page image at a freshly allocated offset.
    ///
    /// # Errors
    ///
    /// Returns an allocation or I/O error. No offset is leaked on failure.
    pub fn write_new(&self, buf: &[u8]) -> CoreResult<u64> {
        debug_assert_eq!(buf.len(), self.page_size);
        let offset = self.file.lock().write_new(buf)?;
        self.cache.invalidate(offset);
        Ok(offset)
    }

    /// Encodes `page` and writes it at a freshly allocated offset.
    ///
    /// # Errors
    ///
    /// Same as [`write_new`](Self::write_new), plus `AllocationExhausted`
    /// if no arena page is free.
    pub fn write_page_new(&self, page: &KeyPage, arena: &PageArena) -> CoreResult<u64> {
        let mut lease = arena.lease()?;
        let buf = &mut lease[..self.page_size];
        page.encode_into(buf);
        self.write_new(buf)
    }

    /// Rewrites only the flags of the page at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails; `mirror` is then untouched.
    pub fn write_flags(
        &self,
        offset: u64,
        flags: u16,
        mirror: Option<&mut KeyPage>,
    ) -> CoreResult<()> {
        self.write_field(offset, KEY_FLAGS_OFFSET, &flags.to_le_bytes())?;
        if let Some(page) = mirror {
            page.flags = flags;
        }
        Ok(())
    }

    /// Rewrites only the previous-page link of the page at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails; `mirror` is then untouched.
    pub fn write_prev_offset(
        &self,
        offset: u64,
        prev: u64,
        mirror: Option<&mut KeyPage>,
    ) -> CoreResult<()> {
        self.write_field(offset, KEY_PREV_OFFSET, &prev.to_le_bytes())?;
        if let Some(page) = mirror {
            page.prev = prev;
        }
        Ok(())
    }

    /// Rewrites only the next-page link of the page at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails; `mirror` is then untouched.
    pub fn write_next_offset(
        &self,
        offset: u64,
        next: u64,
        mirror: Option<&mut KeyPage>,
    ) -> CoreResult<()> {
        self.write_field(offset, KEY_NEXT_OFFSET, &next.to_le_bytes())?;
        if let Some(page) = mirror {
            page.next = next;
        }
        Ok(())
    }

    /// Rewrites the value length and value offset of the page at `offset`
    /// in one write.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails; `mirror` is then untouched.
    pub fn write_value_ref(
        &self,
        offset: u64,
        value_offset: u64,
        value_len: u32,
        mirror: Option<&mut KeyPage>,
    ) -> CoreResult<()> {
        let field = page::key_value_ref(value_offset, value_len);
        self.write_field(offset, KEY_VALUE_REF_OFFSET, &field)?;
        if let Some(page) = mirror {
            page.value_offset = value_offset;
            page.value_len = value_len;
        }
        Ok(())
    }

    /// Points directory slot `bucket` at `head`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails; the in-memory slot is then
    /// untouched.
    pub fn write_slot(&self, bucket: u32, head: u64) -> CoreResult<()> {
        let at = u64::from(bucket) * SLOT_SIZE;
        self.file.lock().write(at, &head.to_le_bytes())?;
        self.directory[bucket as usize].store(head, Ordering::Release);
        Ok(())
    }

    /// Returns the page at `offset` to the free list.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `offset` is not a page boundary.
    pub fn free_page(&self, offset: u64) -> CoreResult<()> {
        self.cache.invalidate(offset);
        self.file.lock().free_page(offset)
    }

    /// Syncs the key file to disk.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.file.lock().sync()
    }

    fn write_field(&self, offset: u64, field: usize, bytes: &[u8]) -> CoreResult<()> {
        if offset < self.data_start || (offset - self.data_start) % self.page_size as u64 != 0 {
            return Err(CoreError::invalid_argument(format!(
                "{offset} is not a key page offset"
            )));
        }
        let result = self.file.lock().write(offset + field as u64, bytes);
        self.cache.invalidate(offset);
        result
    }
}

fn write_empty_directory(
    backend: &mut dyn StorageBackend,
    directory_len: u64,
    data_start: u64,
) -> CoreResult<()> {
    let chunk = vec![0xFFu8; INIT_CHUNK];
    let mut at = 0u64;
    while at < directory_len {
        let n = (directory_len - at).min(INIT_CHUNK as u64) as usize;
        backend.write_at(at, &chunk[..n])?;
        at += n as u64;
    }
    if data_start > directory_len {
        let padding = vec![0u8; (data_start - directory_len) as usize];
        backend.write_at(directory_len, &padding)?;
    }
    backend.sync()?;
    Ok(())
}

fn load_directory(
    backend: &dyn StorageBackend,
    slots: u32,
    page_size: usize,
    data_start: u64,
    size: u64,
) -> CoreResult<Vec<AtomicU64>> {
    let raw = backend.read_at(0, slots as usize * SLOT_SIZE as usize)?;
    let mut directory = Vec::with_capacity(slots as usize);

    for (bucket, chunk) in raw.chunks_exact(SLOT_SIZE as usize).enumerate() {
        let head = page::read_u64(chunk, 0);
        let misplaced = head != NIL
            && (head < data_start
                || head >= size
                || (head - data_start) % page_size as u64 != 0);
        if misplaced {
            return Err(CoreError::invalid_format(format!(
                "hash directory slot {bucket} points at {head}, not a key page"
            )));
        }
        directory.push(AtomicU64::new(head));
    }

    Ok(directory)
}

fn scan_free_pages(
    backend: &dyn StorageBackend,
    allocator: &mut FreePageAllocator,
    page_size: usize,
    data_start: u64,
    size: u64,
    arena: &PageArena,
) -> CoreResult<()> {
    let mut lease = arena.lease()?;
    let header = &mut lease[..2];
    let mut offset = data_start;
    let mut free = 0usize;

    while offset + page_size as u64 <= size {
        backend.read_into(offset, header)?;
        let flags = page::page_flags(header);
        if flags & !(page::FLAG_IN_USE | page::FLAG_DELETED) != 0 {
            warn!(offset, flags, "key page has unknown flags, leaving it out of the free list");
        } else if !is_live(flags) {
            allocator.free(offset)?;
            free += 1;
        }
        offset += page_size as u64;
    }

    debug!(free, size, "scanned key file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{FLAG_DELETED, FLAG_IN_USE};
    use crate::testutil::{FailSwitch, FlakyBackend};
    use rdb_storage::InMemoryBackend;

    fn arena() -> PageArena {
        PageArena::with_capacity(64, 64 * 8).unwrap()
    }

    #[test]
    fn new_directory_is_empty_and_padded() {
        let arena = arena();
        let store = KeyStore::open(Box::new(InMemoryBackend::new()), 13, 64, &arena).unwrap();

        assert_eq!(store.slots(), 13);
        assert_eq!(store.data_start(), 128);
        assert_eq!(store.size().unwrap(), 128);
        assert!((0..13).all(|b| store.head(b) == NIL));
    }

    #[test]
    fn pages_and_partial_writes() {
        let arena = arena();
        let store = KeyStore::open(Box::new(InMemoryBackend::new()), 5, 64, &arena).unwrap();

        let page = KeyPage::new(b"apple", 2, 0, 5);
        let offset = store.write_page_new(&page, &arena).unwrap();
        assert_eq!(offset, store.data_start());

        let mut mirror = store.read_page(offset, &arena).unwrap();
        store.write_next_offset(offset, 640, Some(&mut mirror)).unwrap();
        store.write_prev_offset(offset, 704, Some(&mut mirror)).unwrap();
        store.write_value_ref(offset, 4096, 77, Some(&mut mirror)).unwrap();

        let reread = store.read_page(offset, &arena).unwrap();
        assert_eq!(reread, mirror);
        assert_eq!(reread.next, 640);
        assert_eq!(reread.value_len, 77);

        store.write_flags(offset, FLAG_IN_USE | FLAG_DELETED, Some(&mut mirror)).unwrap();
        assert!(store.read_page(offset, &arena).unwrap_err().is_corrupt_page());
        assert_eq!(mirror.flags, FLAG_IN_USE | FLAG_DELETED);
    }

    #[test]
    fn slots_persist_across_reopen() {
        let arena = arena();
        let backend = InMemoryBackend::new();
        let store = KeyStore::open(Box::new(backend), 7, 64, &arena).unwrap();
        let offset = store
            .write_page_new(&KeyPage::new(b"k", 3, 0, 0), &arena)
            .unwrap();
        store.write_slot(3, offset).unwrap();
        assert_eq!(store.head(3), offset);

        let image = {
            let mut buf = vec![0u8; store.size().unwrap() as usize];
            store.read(0, &mut buf).unwrap();
            buf
        };

        let reopened =
            KeyStore::open(Box::new(InMemoryBackend::with_data(image)), 7, 64, &arena).unwrap();
        assert_eq!(reopened.head(3), offset);
        assert_eq!(reopened.head(4), NIL);
        assert!(reopened.free_pages().is_empty());
    }

    #[test]
    fn reopen_collects_deleted_pages() {
        let arena = arena();
        let store = KeyStore::open(Box::new(InMemoryBackend::new()), 3, 64, &arena).unwrap();
        let a = store.write_page_new(&KeyPage::new(b"a", 0, 0, 0), &arena).unwrap();
        let b = store.write_page_new(&KeyPage::new(b"b", 0, 0, 0), &arena).unwrap();
        store.write_flags(a, FLAG_DELETED, None).unwrap();

        let mut image = vec![0u8; store.size().unwrap() as usize];
        store.read(0, &mut image).unwrap();

        let reopened =
            KeyStore::open(Box::new(InMemoryBackend::with_data(image)), 3, 64, &arena).unwrap();
        assert_eq!(reopened.free_pages(), vec![a]);
        assert_eq!(reopened.read_page(b, &arena).unwrap().key, b"b");

        // The freed page is handed out before the file grows.
        let c = reopened.write_page_new(&KeyPage::new(b"c", 1, 0, 0), &arena).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn bad_slot_is_rejected() {
        let arena = arena();
        let mut image = vec![0xFFu8; 64];
        image[0..8].copy_from_slice(&5u64.to_le_bytes());
        let err = KeyStore::open(Box::new(InMemoryBackend::with_data(image)), 2, 64, &arena)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidFormat { .. }));
    }

    #[test]
    fn failed_write_returns_offset() {
        let arena = arena();
        let switch = FailSwitch::new();
        let backend = FlakyBackend::new(InMemoryBackend::new(), switch.clone());
        let store = KeyStore::open(Box::new(backend), 3, 64, &arena).unwrap();

        switch.fail_writes(true);
        let err = store
            .write_page_new(&KeyPage::new(b"x", 0, 0, 0), &arena)
            .unwrap_err();
        assert_eq!(err.os_error(), Some(28));
        assert!(store.write_slot(1, 64).is_err());
        assert_eq!(store.head(1), NIL);

        switch.fail_writes(false);
        let offset = store
            .write_page_new(&KeyPage::new(b"x", 0, 0, 0), &arena)
            .unwrap();
        assert_eq!(offset, store.data_start());
        assert_eq!(arena.in_use(), 0);
    }

    #[test]
    fn full_disk_fails_every_later_write() {
        let arena = arena();
        let switch = FailSwitch::new();
        let backend = FlakyBackend::new(InMemoryBackend::new(), switch.clone());
        let store = KeyStore::open(Box::new(backend), 3, 64, &arena).unwrap();
        let start = store.data_start();

        switch.fail_after(2);
        for key in [b"a", b"b"] {
            store.write_page_new(&KeyPage::new(key, 0, 0, 0), &arena).unwrap();
        }
        for key in [b"c", b"d"] {
            let err = store
                .write_page_new(&KeyPage::new(key, 0, 0, 0), &arena)
                .unwrap_err();
            assert_eq!(err.os_error(), Some(28));
        }
        assert!(store.write_flags(start, FLAG_DELETED, None).is_err());
        assert_eq!(store.read_page(start, &arena).unwrap().key, b"a");

        // Both failed allocations gave their offset back.
        switch.fail_writes(false);
        let offset = store
            .write_page_new(&KeyPage::new(b"e", 0, 0, 0), &arena)
            .unwrap();
        assert_eq!(offset, start + 128);
        assert_eq!(store.size().unwrap(), start + 128 + 64);
    }

    #[test]
    fn cached_pages_follow_writes() {
        let arena = arena();
        let store = KeyStore::open(Box::new(InMemoryBackend::new()), 5, 64, &arena)
            .unwrap()
            .with_cache_capacity(8);

        let offset = store
            .write_page_new(&KeyPage::new(b"pear", 1, 0, 4), &arena)
            .unwrap();
        let first = store.read_page(offset, &arena).unwrap();
        assert_eq!(store.read_page(offset, &arena).unwrap(), first);
        let stats = store.cache().stats();
        assert_eq!((stats.hits, stats.misses, stats.len), (1, 1, 1));

        store.write_next_offset(offset, 640, None).unwrap();
        assert!(store.cache().is_empty());
        assert_eq!(store.read_page(offset, &arena).unwrap().next, 640);

        store.write_value_ref(offset, 4096, 9, None).unwrap();
        assert_eq!(store.read_page(offset, &arena).unwrap().value_len, 9);

        let mut image = vec![0u8; 64];
        KeyPage::new(b"plum", 1, 0, 4).encode_into(&mut image);
        store.write(offset, &image).unwrap();
        assert_eq!(store.read_page(offset, &arena).unwrap().key, b"plum");

        store.write_flags(offset, FLAG_DELETED, None).unwrap();
        assert!(store.read_page(offset, &arena).unwrap_err().is_corrupt_page());
        assert!(store.cache().is_empty());
    }

    #[test]
    fn failed_partial_write_drops_cached_page() {
        let arena = arena();
        let switch = FailSwitch::new();
        let backend = FlakyBackend::new(InMemoryBackend::new(), switch.clone());
        let store = KeyStore::open(Box::new(backend), 3, 64, &arena)
            .unwrap()
            .with_cache_capacity(4);
        let offset = store
            .write_page_new(&KeyPage::new(b"k", 0, 0, 0), &arena)
            .unwrap();
        store.read_page(offset, &arena).unwrap();
        assert_eq!(store.cache().len(), 1);

        switch.fail_writes(true);
        assert!(store.write_prev_offset(offset, 128, None).is_err());
        assert!(store.cache().is_empty());

        store.free_page(offset).unwrap();
        assert!(store.cache().is_empty());
    }
}
