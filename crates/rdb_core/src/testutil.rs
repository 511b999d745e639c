//! Test helpers shared by unit tests.

use rdb_storage::{StorageBackend, StorageError, StorageResult};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Shared switch that makes a [`FlakyBackend`] fail its writes.
#[derive(Debug, Clone, Default)]
pub struct FailSwitch {
    fail: Arc<AtomicBool>,
    /// Writes left before failing, or negative for "never".
    countdown: Arc<AtomicI64>,
    /// Recover after the countdown failure instead of failing from then on.
    once: Arc<AtomicBool>,
}

impl FailSwitch {
    pub fn new() -> Self {
        let switch = Self::default();
        switch.countdown.store(-1, Ordering::SeqCst);
        switch
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
        self.countdown.store(-1, Ordering::SeqCst);
    }

    /// Lets `n` more writes through, then fails every write.
    pub fn fail_after(&self, n: i64) {
        self.fail.store(false, Ordering::SeqCst);
        self.once.store(false, Ordering::SeqCst);
        self.countdown.store(n, Ordering::SeqCst);
    }

    /// Lets `n` more writes through, fails the next one, then recovers.
    pub fn fail_nth(&self, n: i64) {
        self.fail.store(false, Ordering::SeqCst);
        self.once.store(true, Ordering::SeqCst);
        self.countdown.store(n, Ordering::SeqCst);
    }

    fn check(&self) -> StorageResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(injected());
        }
        let left = self.countdown.load(Ordering::SeqCst);
        if left == 0 {
            if self.once.load(Ordering::SeqCst) {
                self.countdown.store(-1, Ordering::SeqCst);
            } else {
                self.fail.store(true, Ordering::SeqCst);
            }
            return Err(injected());
        }
        if left > 0 {
            self.countdown.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn injected() -> StorageError {
    StorageError::Io(io::Error::from_raw_os_error(28))
}

/// Backend wrapper whose writes fail on demand.
#[derive(Debug)]
pub struct FlakyBackend<B> {
    inner: B,
    switch: FailSwitch,
}

impl<B: StorageBackend> FlakyBackend<B> {
    pub fn new(inner: B, switch: FailSwitch) -> Self {
        Self { inner, switch }
    }
}

impl<B: StorageBackend> StorageBackend for FlakyBackend<B> {
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        self.inner.read_into(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.switch.check()?;
        self.inner.write_at(offset, data)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.switch.check()?;
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.switch.check()?;
        self.inner.truncate(new_size)
    }
}
