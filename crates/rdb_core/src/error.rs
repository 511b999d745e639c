//! Error types for RDB core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in RDB core operations.
///
/// A missing key is not an error: lookups return `Option` and removal
/// returns `bool`.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] rdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation not permitted in the current state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// A page allocator or the page arena cannot satisfy a request.
    #[error("allocation exhausted: {resource}")]
    AllocationExhausted {
        /// The resource that ran out.
        resource: String,
    },

    /// A page failed a sanity check on read.
    #[error("corrupt page in {file} at offset {offset}: {message}")]
    CorruptPage {
        /// Which page file the page lives in.
        file: &'static str,
        /// Offset of the page.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A caller-supplied argument is out of range.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// Invalid database format or version.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Database is already open or locked.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,
}

impl CoreError {
    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an allocation exhausted error.
    pub fn allocation_exhausted(resource: impl Into<String>) -> Self {
        Self::AllocationExhausted {
            resource: resource.into(),
        }
    }

    /// Creates a corrupt page error.
    pub fn corrupt_page(file: &'static str, offset: u64, message: impl Into<String>) -> Self {
        Self::CorruptPage {
            file,
            offset,
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Returns the operating system error code behind an I/O failure.
    #[must_use]
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Self::Io(err) => err.raw_os_error(),
            Self::Storage(err) => err.raw_os_error(),
            _ => None,
        }
    }

    /// Returns true for failures of the underlying files.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Storage(_))
    }

    /// Returns true if this error reports a corrupt page.
    #[must_use]
    pub fn is_corrupt_page(&self) -> bool {
        matches!(self, Self::CorruptPage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_error_is_preserved() {
        let err = CoreError::from(io::Error::from_raw_os_error(28));
        assert_eq!(err.os_error(), Some(28));
        assert!(err.is_io());

        let err = CoreError::from(rdb_storage::StorageError::Io(io::Error::from_raw_os_error(5)));
        assert_eq!(err.os_error(), Some(5));
    }

    #[test]
    fn non_io_errors_have_no_os_code() {
        assert_eq!(CoreError::invalid_state("closed").os_error(), None);
        assert!(!CoreError::DatabaseLocked.is_io());
    }

    #[test]
    fn corrupt_page_display() {
        let err = CoreError::corrupt_page("key file", 4096, "bad flags 0x80");
        assert!(err.is_corrupt_page());
        assert_eq!(
            err.to_string(),
            "corrupt page in key file at offset 4096: bad flags 0x80"
        );
    }
}
