//! Bucket-striped locking.
//!
//! Each bucket that is being operated on borrows a reader/writer lock from
//! a shared [`LockPool`]. Idle buckets hold no lock at all, so the number
//! of live locks tracks the number of buckets in use rather than the size
//! of the hash directory.

mod bucket;
mod pool;

pub use bucket::{BucketGuard, BucketLocks};
pub use pool::{LockPool, ReadHold, RwLockHandle, WriteHold};
