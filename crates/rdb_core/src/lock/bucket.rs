//! Per-bucket lock table.

use super::pool::{LockPool, ReadHold, RwLockHandle, WriteHold};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

#[derive(Debug)]
struct ActiveLock {
    handle: Arc<RwLockHandle>,
    /// Guards that reference this handle, including ones still waiting.
    refs: usize,
}

#[derive(Debug, Default)]
struct LockTable {
    pool: LockPool,
    active: HashMap<u32, ActiveLock>,
}

/// Lock table mapping busy buckets to pooled reader/writer locks.
///
/// The table mutex is only held while handing out or returning a handle,
/// never while waiting for a bucket lock. A waiter registers its interest
/// first, so the handle cannot be recycled under it.
#[derive(Debug, Default)]
pub struct BucketLocks {
    table: Mutex<LockTable>,
}

/// The guard is only held for its drop.
#[derive(Debug)]
enum Hold {
    Read { _guard: ReadHold },
    Write { _guard: WriteHold },
}

/// A shared or exclusive hold on one bucket. Dropping it releases the
/// bucket and, if nobody else is using it, returns its lock to the pool.
#[derive(Debug)]
pub struct BucketGuard<'a> {
    locks: &'a BucketLocks,
    bucket: u32,
    hold: Option<Hold>,
}

impl BucketLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until a shared hold on `bucket` is acquired.
    pub fn read(&self, bucket: u32) -> BucketGuard<'_> {
        let handle = self.checkout(bucket);
        let hold = Hold::Read {
            _guard: handle.read_lock(),
        };
        BucketGuard {
            locks: self,
            bucket,
            hold: Some(hold),
        }
    }

    /// Blocks until an exclusive hold on `bucket` is acquired.
    pub fn write(&self, bucket: u32) -> BucketGuard<'_> {
        let handle = self.checkout(bucket);
        let hold = Hold::Write {
            _guard: handle.write_lock(),
        };
        BucketGuard {
            locks: self,
            bucket,
            hold: Some(hold),
        }
    }

    /// Acquires an exclusive hold on `bucket` if nobody else holds it.
    pub fn try_write(&self, bucket: u32) -> Option<BucketGuard<'_>> {
        let handle = self.checkout(bucket);
        match handle.try_write_lock() {
            Some(hold) => Some(BucketGuard {
                locks: self,
                bucket,
                hold: Some(Hold::Write { _guard: hold }),
            }),
            None => {
                drop(handle);
                self.checkin(bucket);
                None
            }
        }
    }

    /// Number of buckets that currently own a lock.
    #[must_use]
    pub fn active(&self) -> usize {
        self.table.lock().active.len()
    }

    /// Number of idle locks waiting in the pool.
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.table.lock().pool.idle()
    }

    fn checkout(&self, bucket: u32) -> Arc<RwLockHandle> {
        let mut table = self.table.lock();
        let LockTable { pool, active } = &mut *table;
        let entry = active.entry(bucket).or_insert_with(|| ActiveLock {
            handle: pool.get(),
            refs: 0,
        });
        entry.refs += 1;
        Arc::clone(&entry.handle)
    }

    fn checkin(&self, bucket: u32) {
        let mut table = self.table.lock();
        let LockTable { pool, active } = &mut *table;

        let Some(entry) = active.get_mut(&bucket) else {
            error!(bucket, "released a bucket that holds no lock");
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(idle) = active.remove(&bucket) {
                if let Err(e) = pool.put(idle.handle) {
                    error!(bucket, error = %e, "lock not returned to pool");
                }
            }
        }
    }
}

impl BucketGuard<'_> {
    /// The bucket this guard holds.
    #[must_use]
    pub fn bucket(&self) -> u32 {
        self.bucket
    }

    /// Returns true for an exclusive hold.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        matches!(self.hold, Some(Hold::Write { .. }))
    }
}

impl Drop for BucketGuard<'_> {
    fn drop(&mut self) {
        // Unlock before touching the table so waiters can proceed.
        drop(self.hold.take());
        self.locks.checkin(self.bucket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn locks_return_to_pool() {
        let locks = BucketLocks::new();
        {
            let a = locks.read(7);
            let b = locks.read(7);
            assert!(!a.is_exclusive());
            assert_eq!(b.bucket(), 7);
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
        assert_eq!(locks.pooled(), 1);

        {
            let _w = locks.write(9);
            let _r = locks.read(10);
            assert_eq!(locks.active(), 2);
            assert_eq!(locks.pooled(), 0);
        }
        assert_eq!(locks.pooled(), 2);
    }

    #[test]
    fn try_write_fails_while_read_held() {
        let locks = BucketLocks::new();
        let reader = locks.read(3);
        assert!(locks.try_write(3).is_none());
        assert!(locks.try_write(4).is_some());
        drop(reader);

        let writer = locks.try_write(3).expect("bucket is free");
        assert!(writer.is_exclusive());
        drop(writer);
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn writers_on_one_bucket_serialize() {
        let locks = Arc::new(BucketLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let _guard = locks.write(1);
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(locks.active(), 0);
        assert_eq!(locks.pooled(), 1);
    }
}
