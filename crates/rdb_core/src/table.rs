//! Bucket chains over the key and value stores.
//!
//! Each directory slot roots a doubly linked chain of key pages. New keys
//! are linked at the head. Every multi-page mutation records its undo
//! actions as it goes, and pages it retires are only freed after the
//! mutation is committed.
//!
//! Callers hold the bucket lock: shared for [`HashTable::lookup`] and
//! [`HashTable::read_value`], exclusive for everything that writes.

use crate::arena::PageArena;
use crate::error::{CoreError, CoreResult};
use crate::page::{
    value_page_count, KeyPage, ValuePage, FLAG_DELETED, FLAG_IN_USE, FLAG_OVERFLOW, KEY_FILE, NIL,
    VALUE_FILE, VALUE_HEADER_SIZE,
};
use crate::store::{KeyStore, ValueStore};
use crate::undo::{UndoLog, UndoOp};
use tracing::warn;

/// One page of a value chain as found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChainPage {
    pub(crate) offset: u64,
    pub(crate) flags: u16,
}

/// The stores of one database viewed as a chained hash table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HashTable<'a> {
    pub(crate) keys: &'a KeyStore,
    pub(crate) values: &'a ValueStore,
    pub(crate) arena: &'a PageArena,
}

impl<'a> HashTable<'a> {
    pub(crate) fn new(keys: &'a KeyStore, values: &'a ValueStore, arena: &'a PageArena) -> Self {
        Self {
            keys,
            values,
            arena,
        }
    }

    /// Iterates over the key pages of `bucket`, head first.
    pub(crate) fn chain(&self, bucket: u32) -> CoreResult<Chain<'a>> {
        let pages = (self.keys.size()? - self.keys.data_start()) / self.keys.page_size() as u64;
        Ok(Chain {
            table: *self,
            bucket,
            next: self.keys.head(bucket),
            prev: NIL,
            remaining: pages,
            done: false,
        })
    }

    /// Finds `key` in `bucket`, returning its page offset and decoded page.
    pub(crate) fn lookup(&self, bucket: u32, key: &[u8]) -> CoreResult<Option<(u64, KeyPage)>> {
        for entry in self.chain(bucket)? {
            let (offset, page) = entry?;
            if page.key == key {
                return Ok(Some((offset, page)));
            }
        }
        Ok(None)
    }

    /// Offsets and flags of every page in the value chain of `page`,
    /// checked against the length it records.
    pub(crate) fn value_chain(&self, page: &KeyPage) -> CoreResult<Vec<ChainPage>> {
        let mut chain = Vec::new();
        self.walk_value(page, |offset, value| {
            chain.push(ChainPage {
                offset,
                flags: value.flags,
            });
        })?;
        Ok(chain)
    }

    /// Reads the whole value `page` refers to.
    pub(crate) fn read_value(&self, page: &KeyPage) -> CoreResult<Vec<u8>> {
        let mut out = Vec::with_capacity(page.value_len as usize);
        self.walk_value(page, |_, value| out.extend_from_slice(&value.payload))?;
        Ok(out)
    }

    /// Links a new key at the head of `bucket`.
    ///
    /// Order of writes: value pages, key page, old head's back link,
    /// directory slot. Nothing is reachable before the slot is written.
    pub(crate) fn insert(&self, bucket: u32, key: &[u8], value: &[u8]) -> CoreResult<u64> {
        let mut undo = UndoLog::new(self.keys, self.values);

        let value_offset = self.write_value_chain(value, &mut undo)?;
        let old_head = self.keys.head(bucket);

        let mut page = KeyPage::new(key, bucket, value_offset, value.len() as u32);
        page.next = old_head;
        let offset = self.keys.write_page_new(&page, self.arena)?;
        undo.push(UndoOp::ReleaseKeyPage(offset));

        if old_head != NIL {
            self.keys.write_prev_offset(old_head, offset, None)?;
            undo.push(UndoOp::KeyPrev {
                offset: old_head,
                prev: NIL,
            });
        }

        self.keys.write_slot(bucket, offset)?;
        undo.commit();
        Ok(offset)
    }

    /// Replaces the value of the key page at `offset`.
    ///
    /// A value that needs as many pages as the old one is written over the
    /// old chain. Otherwise a new chain is written, the key page is pointed
    /// at it, and the old chain is freed.
    pub(crate) fn overwrite(&self, offset: u64, page: &mut KeyPage, value: &[u8]) -> CoreResult<()> {
        let page_size = self.values.page_size();
        let old = self.value_chain(page)?;
        let mut undo = UndoLog::new(self.keys, self.values);

        if old.len() == value_page_count(value.len(), page_size) {
            let mut lease = self.arena.lease()?;
            let mut saved = vec![0u8; page_size];
            let chunks = payload_chunks(value, page_size);

            for (i, (slot, chunk)) in old.iter().zip(chunks).enumerate() {
                let next = old.get(i + 1).map_or(NIL, |p| p.offset);
                self.values.read(slot.offset, &mut saved)?;
                undo.push(UndoOp::ValueImage {
                    offset: slot.offset,
                    image: saved.clone(),
                });
                let buf = &mut lease[..page_size];
                ValuePage::encode_into(buf, chunk, next, i > 0);
                self.values.write(slot.offset, buf)?;
            }

            if page.value_len != value.len() as u32 {
                self.keys
                    .write_value_ref(offset, page.value_offset, value.len() as u32, None)?;
                undo.push(UndoOp::KeyValueRef {
                    offset,
                    value_offset: page.value_offset,
                    value_len: page.value_len,
                });
            }
            undo.commit();
            page.value_len = value.len() as u32;
            return Ok(());
        }

        let value_offset = self.write_value_chain(value, &mut undo)?;
        self.keys
            .write_value_ref(offset, value_offset, value.len() as u32, None)?;
        undo.commit();

        page.value_offset = value_offset;
        page.value_len = value.len() as u32;
        self.retire_value_pages(&old);
        Ok(())
    }

    /// Unlinks the key page at `offset` from its chain and frees it along
    /// with its value pages.
    pub(crate) fn unlink(&self, offset: u64, page: &KeyPage) -> CoreResult<()> {
        let chain = self.value_chain(page)?;
        let mut undo = UndoLog::new(self.keys, self.values);

        for slot in &chain {
            self.values.write_flags(slot.offset, FLAG_DELETED)?;
            undo.push(UndoOp::ValueFlags {
                offset: slot.offset,
                flags: slot.flags,
            });
        }

        self.keys.write_flags(offset, FLAG_DELETED, None)?;
        undo.push(UndoOp::KeyFlags {
            offset,
            flags: page.flags,
        });

        if page.is_head() {
            self.keys.write_slot(page.bucket, page.next)?;
            undo.push(UndoOp::Slot {
                bucket: page.bucket,
                head: offset,
            });
        } else {
            self.keys.write_next_offset(page.prev, page.next, None)?;
            undo.push(UndoOp::KeyNext {
                offset: page.prev,
                next: offset,
            });
        }

        if page.next != NIL {
            self.keys.write_prev_offset(page.next, page.prev, None)?;
            undo.push(UndoOp::KeyPrev {
                offset: page.next,
                prev: offset,
            });
        }

        undo.commit();

        if let Err(e) = self.keys.free_page(offset) {
            warn!(offset, error = %e, "key page leaked");
        }
        for slot in &chain {
            if let Err(e) = self.values.free_page(slot.offset) {
                warn!(offset = slot.offset, error = %e, "value page leaked");
            }
        }
        Ok(())
    }

    /// Writes `value` as a fresh chain, tail first so every page is
    /// written with its final link. Returns the head offset.
    fn write_value_chain(&self, value: &[u8], undo: &mut UndoLog<'_>) -> CoreResult<u64> {
        let page_size = self.values.page_size();
        let chunks: Vec<&[u8]> = payload_chunks(value, page_size).collect();
        let mut lease = self.arena.lease()?;
        let buf = &mut lease[..page_size];

        let mut next = NIL;
        for (i, chunk) in chunks.iter().enumerate().rev() {
            ValuePage::encode_into(buf, chunk, next, i > 0);
            next = self.values.write_new(buf)?;
            undo.push(UndoOp::ReleaseValuePage(next));
        }
        Ok(next)
    }

    /// Frees pages of a value chain that is no longer referenced.
    fn retire_value_pages(&self, chain: &[ChainPage]) {
        for slot in chain {
            let freed = self
                .values
                .write_flags(slot.offset, FLAG_DELETED)
                .and_then(|()| self.values.free_page(slot.offset));
            if let Err(e) = freed {
                warn!(offset = slot.offset, error = %e, "value page leaked");
            }
        }
    }

    fn walk_value(
        &self,
        page: &KeyPage,
        mut visit: impl FnMut(u64, ValuePage),
    ) -> CoreResult<()> {
        let expected = value_page_count(page.value_len as usize, self.values.page_size());
        let mut offset = page.value_offset;
        let mut total = 0usize;

        for i in 0..expected {
            if offset == NIL {
                return Err(CoreError::corrupt_page(
                    VALUE_FILE,
                    page.value_offset,
                    format!("value chain ends after {i} of {expected} pages"),
                ));
            }
            let value = self.values.read_page(offset, self.arena)?;
            if value.is_overflow() != (i > 0) {
                return Err(CoreError::corrupt_page(
                    VALUE_FILE,
                    offset,
                    "overflow flag does not match chain position",
                ));
            }
            total += value.payload.len();
            let next = value.next;
            visit(offset, value);
            offset = next;
        }

        if offset != NIL || total != page.value_len as usize {
            return Err(CoreError::corrupt_page(
                VALUE_FILE,
                page.value_offset,
                format!(
                    "value chain holds {total} bytes, key page records {}",
                    page.value_len
                ),
            ));
        }
        Ok(())
    }
}

/// Iterator over one bucket chain. Stops after the first error.
#[derive(Debug)]
pub(crate) struct Chain<'a> {
    table: HashTable<'a>,
    bucket: u32,
    next: u64,
    prev: u64,
    /// Upper bound on chain length; running out means a cycle.
    remaining: u64,
    done: bool,
}

impl Chain<'_> {
    fn step(&mut self) -> CoreResult<(u64, KeyPage)> {
        let offset = self.next;
        if self.remaining == 0 {
            return Err(CoreError::corrupt_page(
                KEY_FILE,
                offset,
                format!("chain of bucket {} does not terminate", self.bucket),
            ));
        }
        self.remaining -= 1;

        let page = self.table.keys.read_page(offset, self.table.arena)?;
        if page.bucket != self.bucket {
            return Err(CoreError::corrupt_page(
                KEY_FILE,
                offset,
                format!(
                    "page of bucket {} found in chain of bucket {}",
                    page.bucket, self.bucket
                ),
            ));
        }
        if page.prev != self.prev {
            return Err(CoreError::corrupt_page(
                KEY_FILE,
                offset,
                format!("back link {} should be {}", page.prev, self.prev),
            ));
        }

        self.prev = offset;
        self.next = page.next;
        Ok((offset, page))
    }
}

impl Iterator for Chain<'_> {
    type Item = CoreResult<(u64, KeyPage)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next == NIL {
            return None;
        }
        let item = self.step();
        self.done = item.is_err();
        Some(item)
    }
}

/// Splits a value into per-page payloads. An empty value is one empty page.
fn payload_chunks(value: &[u8], page_size: usize) -> impl Iterator<Item = &[u8]> {
    let capacity = page_size - VALUE_HEADER_SIZE;
    let empty: &[u8] = &[];
    let first = value.is_empty().then_some(empty);
    first.into_iter().chain(value.chunks(capacity))
}

/// Flags a value page carries at position `index` of its chain.
pub(crate) const fn value_flags_at(index: usize) -> u16 {
    if index == 0 {
        FLAG_IN_USE
    } else {
        FLAG_IN_USE | FLAG_OVERFLOW
    }
}
