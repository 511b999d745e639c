//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },
}

impl StorageError {
    /// Returns the operating system error code behind this error, if any.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(err) => err.raw_os_error(),
            Self::ReadPastEnd { .. } => None,
        }
    }

    /// Returns true if the error is a short read past the end of storage.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        match self {
            Self::ReadPastEnd { .. } => true,
            Self::Io(err) => err.kind() == io::ErrorKind::UnexpectedEof,
        }
    }
}
