//! Pooled reader/writer locks.

use crate::error::{CoreError, CoreResult};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A reader/writer lock that counts its live holders.
///
/// The count is for diagnostics and for the drop-time check that nobody
/// still holds the lock.
#[derive(Debug, Default)]
pub struct RwLockHandle {
    lock: Arc<RwLock<()>>,
    holders: AtomicUsize,
}

/// Shared hold on an [`RwLockHandle`]. Dropping it unlocks.
pub struct ReadHold {
    handle: Arc<RwLockHandle>,
    _guard: ArcRwLockReadGuard<RawRwLock, ()>,
}

/// Exclusive hold on an [`RwLockHandle`]. Dropping it unlocks.
pub struct WriteHold {
    handle: Arc<RwLockHandle>,
    _guard: ArcRwLockWriteGuard<RawRwLock, ()>,
}

impl RwLockHandle {
    /// Creates an unlocked handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of threads currently holding the lock.
    #[must_use]
    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::Acquire)
    }

    /// Blocks until a shared hold is acquired.
    pub fn read_lock(self: &Arc<Self>) -> ReadHold {
        let guard = self.lock.read_arc();
        self.holders.fetch_add(1, Ordering::AcqRel);
        ReadHold {
            handle: Arc::clone(self),
            _guard: guard,
        }
    }

    /// Acquires a shared hold if no writer holds the lock.
    pub fn try_read_lock(self: &Arc<Self>) -> Option<ReadHold> {
        let guard = self.lock.try_read_arc()?;
        self.holders.fetch_add(1, Ordering::AcqRel);
        Some(ReadHold {
            handle: Arc::clone(self),
            _guard: guard,
        })
    }

    /// Blocks until an exclusive hold is acquired.
    pub fn write_lock(self: &Arc<Self>) -> WriteHold {
        let guard = self.lock.write_arc();
        self.holders.fetch_add(1, Ordering::AcqRel);
        WriteHold {
            handle: Arc::clone(self),
            _guard: guard,
        }
    }

    /// Acquires an exclusive hold if the lock is free.
    pub fn try_write_lock(self: &Arc<Self>) -> Option<WriteHold> {
        let guard = self.lock.try_write_arc()?;
        self.holders.fetch_add(1, Ordering::AcqRel);
        Some(WriteHold {
            handle: Arc::clone(self),
            _guard: guard,
        })
    }

    fn release(&self) {
        let previous = self.holders.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "lock holder count went negative");
    }
}

impl Drop for RwLockHandle {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert_eq!(
                self.holders.load(Ordering::Acquire),
                0,
                "lock destroyed while held"
            );
        }
    }
}

impl fmt::Debug for ReadHold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadHold")
            .field("holders", &self.handle.holders())
            .finish()
    }
}

impl fmt::Debug for WriteHold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteHold")
            .field("holders", &self.handle.holders())
            .finish()
    }
}

impl Drop for ReadHold {
    fn drop(&mut self) {
        self.handle.release();
    }
}

impl Drop for WriteHold {
    fn drop(&mut self) {
        self.handle.release();
    }
}

/// A stack of idle lock handles.
///
/// `get` and `put` take `&mut self`: the pool does no locking of its own
/// and is only reachable through its owner's mutex.
#[derive(Debug, Default)]
pub struct LockPool {
    idle: Vec<Arc<RwLockHandle>>,
    created: usize,
}

impl LockPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes an idle handle, creating one if the pool is empty.
    pub fn get(&mut self) -> Arc<RwLockHandle> {
        self.idle.pop().unwrap_or_else(|| {
            self.created += 1;
            Arc::new(RwLockHandle::new())
        })
    }

    /// Returns a handle for reuse.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the handle is still held or still shared
    /// with another owner. The handle is dropped in that case.
    pub fn put(&mut self, handle: Arc<RwLockHandle>) -> CoreResult<()> {
        if handle.holders() != 0 {
            return Err(CoreError::invalid_state(format!(
                "lock returned to pool with {} holders",
                handle.holders()
            )));
        }
        if Arc::strong_count(&handle) != 1 {
            return Err(CoreError::invalid_state(
                "lock returned to pool while still referenced",
            ));
        }
        self.idle.push(handle);
        Ok(())
    }

    /// Number of idle handles.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    /// Number of handles ever created by this pool.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share_writers_exclude() {
        let handle = Arc::new(RwLockHandle::new());

        let r1 = handle.read_lock();
        let r2 = handle.try_read_lock().expect("second reader");
        assert_eq!(handle.holders(), 2);
        assert!(handle.try_write_lock().is_none());

        drop(r1);
        drop(r2);
        assert_eq!(handle.holders(), 0);

        let w = handle.write_lock();
        assert_eq!(handle.holders(), 1);
        assert!(handle.try_read_lock().is_none());
        assert!(handle.try_write_lock().is_none());
        drop(w);

        assert!(handle.try_write_lock().is_some());
        assert_eq!(handle.holders(), 0);
    }

    #[test]
    fn pool_reuses_handles() {
        let mut pool = LockPool::new();

        let a = pool.get();
        let a_ptr = Arc::as_ptr(&a);
        pool.put(a).unwrap();
        assert_eq!(pool.idle(), 1);

        let b = pool.get();
        assert_eq!(Arc::as_ptr(&b), a_ptr);
        assert_eq!(pool.created(), 1);

        let c = pool.get();
        assert_eq!(pool.created(), 2);
        pool.put(b).unwrap();
        pool.put(c).unwrap();
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn pool_rejects_held_handle() {
        let mut pool = LockPool::new();
        let handle = pool.get();
        let hold = handle.read_lock();

        let err = pool.put(Arc::clone(&handle)).unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
        assert_eq!(pool.idle(), 0);
        drop(hold);
    }

    #[test]
    fn writer_blocks_until_reader_leaves() {
        use std::sync::atomic::AtomicBool;
        use std::thread;
        use std::time::Duration;

        let handle = Arc::new(RwLockHandle::new());
        let acquired = Arc::new(AtomicBool::new(false));

        let reader = handle.read_lock();
        let writer = {
            let handle = Arc::clone(&handle);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _w = handle.write_lock();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(reader);
        writer.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
