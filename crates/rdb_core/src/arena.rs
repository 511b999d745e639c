//! Fixed-capacity page arena.
//!
//! One large block is reserved up front and carved into page-sized slots
//! on demand. Slots are handed out as [`ArenaPage`] handles that carry
//! their slot index, and are returned to a free stack when released.
//!
//! The arena is sized from a share of physical memory. If the reservation
//! fails it is retried with a smaller target until it succeeds or nothing
//! is left to try.

use crate::error::{CoreError, CoreResult};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::System;
use tracing::{debug, warn};

/// Amount the reservation target shrinks by after a failed attempt.
pub const ARENA_SHRINK_STEP: usize = 100 * 1024 * 1024;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// A page-sized buffer on loan from a [`PageArena`].
#[derive(Debug)]
pub struct ArenaPage {
    arena: u64,
    index: usize,
    buf: BytesMut,
}

impl ArenaPage {
    /// Slot index of this page within its arena.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Deref for ArenaPage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for ArenaPage {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

#[derive(Debug)]
struct ArenaState {
    /// Slots ready to be handed out.
    free: Vec<ArenaPage>,
    /// Part of the block no slot has been carved from yet.
    unclaimed: BytesMut,
    /// Number of slots carved so far.
    claimed: usize,
    /// Number of slots currently on loan.
    issued: usize,
}

/// A fixed pool of page buffers.
///
/// # Thread Safety
///
/// One mutex guards slot issuance. Page contents are owned by the
/// borrower while on loan and need no locking.
#[derive(Debug)]
pub struct PageArena {
    id: u64,
    page_size: usize,
    capacity: usize,
    state: Mutex<ArenaState>,
}

impl PageArena {
    /// Creates an arena sized to `percent` of physical memory, optionally
    /// capped at `limit` bytes.
    ///
    /// # Errors
    ///
    /// Returns `AllocationExhausted` if not even one page can be reserved.
    pub fn from_memory_percent(
        page_size: usize,
        percent: u32,
        limit: Option<usize>,
    ) -> CoreResult<Self> {
        let target = memory_budget(percent, limit);
        debug!(percent, target, page_size, "sizing page arena");
        Self::with_capacity(page_size, target)
    }

    /// Creates an arena holding at most `bytes / page_size` pages.
    ///
    /// # Errors
    ///
    /// Returns `AllocationExhausted` if not even one page can be reserved.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is zero.
    pub fn with_capacity(page_size: usize, bytes: usize) -> CoreResult<Self> {
        assert!(page_size > 0, "page size must be non-zero");

        let block = reserve_block(page_size, bytes)?;
        let capacity = block.capacity() / page_size;

        let mut state = ArenaState {
            free: Vec::new(),
            unclaimed: block,
            claimed: 0,
            issued: 0,
        };

        let id = NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed);
        let first = carve(&mut state, id, page_size);
        state.free.push(first);

        Ok(Self {
            id,
            page_size,
            capacity,
            state: Mutex::new(state),
        })
    }

    /// Size of each page in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Total number of pages the arena can have on loan at once.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of pages currently on loan.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.state.lock().issued
    }

    /// Number of slots carved from the block so far.
    #[must_use]
    pub fn claimed(&self) -> usize {
        self.state.lock().claimed
    }

    /// Takes a zero-filled page, or `None` if every page is on loan.
    pub fn get(&self) -> Option<ArenaPage> {
        let mut state = self.state.lock();

        let mut page = state.free.pop()?;
        state.issued += 1;

        if state.free.is_empty() && state.claimed < self.capacity {
            let next = carve(&mut state, self.id, self.page_size);
            state.free.push(next);
        }
        drop(state);

        page.fill(0);
        Some(page)
    }

    /// Returns a page to the arena.
    ///
    /// # Panics
    ///
    /// Panics if the page was issued by another arena, its slot index is
    /// out of range, its length was changed, or more pages are returned
    /// than were issued. Each of these means the caller broke the loan
    /// protocol.
    pub fn free(&self, page: ArenaPage) {
        assert_eq!(page.arena, self.id, "page returned to the wrong arena");
        assert!(
            page.index < self.capacity,
            "arena slot {} out of range (capacity {})",
            page.index,
            self.capacity
        );
        assert_eq!(page.buf.len(), self.page_size, "arena page was resized");

        let mut state = self.state.lock();
        assert!(state.issued > 0, "arena page freed twice");
        state.issued -= 1;
        state.free.push(page);
    }

    /// Borrows a page for the lifetime of the returned lease.
    ///
    /// # Errors
    ///
    /// Returns `AllocationExhausted` if every page is on loan.
    pub fn lease(&self) -> CoreResult<PageLease<'_>> {
        let page = self
            .get()
            .ok_or_else(|| CoreError::allocation_exhausted("page arena"))?;
        Ok(PageLease {
            arena: self,
            page: Some(page),
        })
    }
}

/// A page borrowed from a [`PageArena`] and returned on drop.
#[derive(Debug)]
pub struct PageLease<'a> {
    arena: &'a PageArena,
    page: Option<ArenaPage>,
}

impl Deref for PageLease<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.page.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PageLease<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.page.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PageLease<'_> {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            self.arena.free(page);
        }
    }
}

/// Bytes making up `percent` of physical memory, capped at `limit`.
#[must_use]
pub fn memory_budget(percent: u32, limit: Option<usize>) -> usize {
    let physical = physical_memory();
    let budget = (u128::from(physical) * u128::from(percent) / 100) as usize;
    limit.map_or(budget, |limit| budget.min(limit))
}

fn physical_memory() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory()
}

fn reserve_block(page_size: usize, bytes: usize) -> CoreResult<BytesMut> {
    let mut target = bytes - bytes % page_size;

    while target >= page_size {
        // Probe first so a failed reservation is reported instead of aborting.
        let mut probe: Vec<u8> = Vec::new();
        if probe.try_reserve_exact(target).is_ok() {
            drop(probe);
            return Ok(BytesMut::with_capacity(target));
        }

        warn!(target, "page arena reservation failed, shrinking");
        target = target.saturating_sub(ARENA_SHRINK_STEP);
        target -= target % page_size;
    }

    Err(CoreError::allocation_exhausted(format!(
        "page arena: cannot reserve a single {page_size}-byte page"
    )))
}

fn carve(state: &mut ArenaState, arena: u64, page_size: usize) -> ArenaPage {
    state.unclaimed.resize(page_size, 0);
    let buf = state.unclaimed.split_to(page_size);
    let index = state.claimed;
    state.claimed += 1;
    ArenaPage { arena, index, buf }
}
