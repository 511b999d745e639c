//! Compensating actions for multi-page mutations.
//!
//! A `set` or `remove` touches several pages in sequence. Each step that
//! succeeds pushes the action that reverses it. If a later step fails the
//! log is replayed newest-first; once the final step has been written the
//! log is committed and forgotten.

use crate::error::CoreResult;
use crate::page::FLAG_DELETED;
use crate::store::{KeyStore, ValueStore};
use tracing::error;

/// One reversing action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UndoOp {
    /// Restore the flags of a key page.
    KeyFlags { offset: u64, flags: u16 },
    /// Restore the previous-page link of a key page.
    KeyPrev { offset: u64, prev: u64 },
    /// Restore the next-page link of a key page.
    KeyNext { offset: u64, next: u64 },
    /// Restore the value reference of a key page.
    KeyValueRef {
        offset: u64,
        value_offset: u64,
        value_len: u32,
    },
    /// Restore a directory slot.
    Slot { bucket: u32, head: u64 },
    /// Restore the flags of a value page.
    ValueFlags { offset: u64, flags: u16 },
    /// Restore a whole value page image.
    ValueImage { offset: u64, image: Vec<u8> },
    /// Retire a key page written by the failed mutation.
    ReleaseKeyPage(u64),
    /// Retire a value page written by the failed mutation.
    ReleaseValuePage(u64),
}

/// Undo log bound to one pair of stores. Rolls back on drop unless
/// committed.
#[derive(Debug)]
pub(crate) struct UndoLog<'a> {
    keys: &'a KeyStore,
    values: &'a ValueStore,
    ops: Vec<UndoOp>,
}

impl<'a> UndoLog<'a> {
    pub(crate) fn new(keys: &'a KeyStore, values: &'a ValueStore) -> Self {
        Self {
            keys,
            values,
            ops: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, op: UndoOp) {
        self.ops.push(op);
    }

    #[cfg(test)]
    pub(crate) fn ops(&self) -> &[UndoOp] {
        &self.ops
    }

    /// Discards the log. The mutation is complete.
    pub(crate) fn commit(mut self) {
        self.ops.clear();
    }

    /// Replays every action newest-first and returns how many failed.
    /// A failing action is logged and does not stop the rest.
    #[cfg(test)]
    pub(crate) fn rollback(mut self) -> usize {
        self.replay()
    }

    fn replay(&mut self) -> usize {
        let mut failed = 0;
        while let Some(op) = self.ops.pop() {
            if let Err(e) = self.apply(&op) {
                error!(?op, error = %e, "rollback step failed");
                failed += 1;
            }
        }
        failed
    }

    fn apply(&self, op: &UndoOp) -> CoreResult<()> {
        match *op {
            UndoOp::KeyFlags { offset, flags } => self.keys.write_flags(offset, flags, None),
            UndoOp::KeyPrev { offset, prev } => self.keys.write_prev_offset(offset, prev, None),
            UndoOp::KeyNext { offset, next } => self.keys.write_next_offset(offset, next, None),
            UndoOp::KeyValueRef {
                offset,
                value_offset,
                value_len,
            } => self
                .keys
                .write_value_ref(offset, value_offset, value_len, None),
            UndoOp::Slot { bucket, head } => self.keys.write_slot(bucket, head),
            UndoOp::ValueFlags { offset, flags } => self.values.write_flags(offset, flags),
            UndoOp::ValueImage { offset, ref image } => self.values.write(offset, image),
            UndoOp::ReleaseKeyPage(offset) => {
                self.keys.write_flags(offset, FLAG_DELETED, None)?;
                self.keys.free_page(offset)
            }
            UndoOp::ReleaseValuePage(offset) => {
                self.values.write_flags(offset, FLAG_DELETED)?;
                self.values.free_page(offset)
            }
        }
    }
}

impl Drop for UndoLog<'_> {
    fn drop(&mut self) {
        if !self.ops.is_empty() {
            self.replay();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::PageArena;
    use crate::page::{KeyPage, ValuePage, FLAG_IN_USE, NIL};
    use crate::testutil::{FailSwitch, FlakyBackend};
    use rdb_storage::InMemoryBackend;

    struct Fixture {
        arena: PageArena,
        keys: KeyStore,
        values: ValueStore,
    }

    fn fixture() -> Fixture {
        let arena = PageArena::with_capacity(64, 64 * 8).unwrap();
        let keys = KeyStore::open(Box::new(InMemoryBackend::new()), 7, 64, &arena).unwrap();
        let values = ValueStore::open(Box::new(InMemoryBackend::new()), None, 64, &arena).unwrap();
        Fixture {
            arena,
            keys,
            values,
        }
    }

    fn value_page(payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        ValuePage::encode_into(&mut buf, payload, NIL, false);
        buf
    }

    #[test]
    fn rollback_runs_newest_first() {
        let f = fixture();
        let page = f
            .keys
            .write_page_new(&KeyPage::new(b"k", 1, 0, 0), &f.arena)
            .unwrap();

        let mut undo = UndoLog::new(&f.keys, &f.values);
        // Two changes to the same field: the oldest value must win.
        f.keys.write_next_offset(page, 640, None).unwrap();
        undo.push(UndoOp::KeyNext {
            offset: page,
            next: NIL,
        });
        f.keys.write_next_offset(page, 704, None).unwrap();
        undo.push(UndoOp::KeyNext {
            offset: page,
            next: 640,
        });
        f.keys.write_slot(1, page).unwrap();
        undo.push(UndoOp::Slot {
            bucket: 1,
            head: NIL,
        });

        assert_eq!(undo.rollback(), 0);
        assert_eq!(f.keys.read_page(page, &f.arena).unwrap().next, NIL);
        assert_eq!(f.keys.head(1), NIL);
    }

    #[test]
    fn release_retires_fresh_pages() {
        let f = fixture();
        let mut undo = UndoLog::new(&f.keys, &f.values);
        let v = f.values.write_new(&value_page(b"v")).unwrap();
        undo.push(UndoOp::ReleaseValuePage(v));
        let k = f
            .keys
            .write_page_new(&KeyPage::new(b"k", 0, v, 1), &f.arena)
            .unwrap();
        undo.push(UndoOp::ReleaseKeyPage(k));
        drop(undo);

        assert_eq!(f.values.read_flags(v).unwrap(), FLAG_DELETED);
        assert_eq!(f.values.free_pages(), vec![v]);
        assert_eq!(f.keys.free_pages(), vec![k]);
    }

    #[test]
    fn commit_keeps_changes() {
        let f = fixture();
        let v = f.values.write_new(&value_page(b"old")).unwrap();

        let mut undo = UndoLog::new(&f.keys, &f.values);
        undo.push(UndoOp::ValueImage {
            offset: v,
            image: value_page(b"old"),
        });
        f.values.write(v, &value_page(b"new")).unwrap();
        undo.push(UndoOp::ValueFlags {
            offset: v,
            flags: FLAG_IN_USE,
        });
        assert_eq!(undo.ops().len(), 2);
        undo.commit();

        assert_eq!(f.values.read_page(v, &f.arena).unwrap().payload, b"new");
    }

    #[test]
    fn failing_step_does_not_stop_rollback() {
        let arena = PageArena::with_capacity(64, 64 * 8).unwrap();
        let switch = FailSwitch::new();
        let keys = KeyStore::open(
            Box::new(FlakyBackend::new(InMemoryBackend::new(), switch.clone())),
            7,
            64,
            &arena,
        )
        .unwrap();
        let values = ValueStore::open(Box::new(InMemoryBackend::new()), None, 64, &arena).unwrap();
        let v = values.write_new(&value_page(b"v")).unwrap();
        values.write_flags(v, FLAG_DELETED).unwrap();

        let mut undo = UndoLog::new(&keys, &values);
        undo.push(UndoOp::ValueFlags {
            offset: v,
            flags: FLAG_IN_USE,
        });
        undo.push(UndoOp::Slot { bucket: 2, head: 0 });

        switch.fail_writes(true);
        assert_eq!(undo.rollback(), 1);
        assert_eq!(values.read_flags(v).unwrap(), FLAG_IN_USE);
    }
}
