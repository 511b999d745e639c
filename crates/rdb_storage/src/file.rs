//! File-based storage backend for persistent storage.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A file-based storage backend.
///
/// This backend provides persistent storage using OS file APIs.
/// Data survives process restarts.
///
/// # Durability
///
/// - `flush()` calls `File::flush()` to push data to the OS
/// - `sync()` calls `File::sync_all()` to ensure data is on disk
/// - with [`with_sync_writes`](Self::with_sync_writes) enabled, every
///   `write_at`/`append` is followed by `File::sync_data()`
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads.
/// Internal locking ensures consistent access.
///
/// # Example
///
/// ```no_run
/// use rdb_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("data.bin")).unwrap();
/// backend.write_at(0, b"persistent data").unwrap();
/// backend.sync().unwrap();  // Ensure data is durable
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: RwLock<File>,
    size: RwLock<u64>,
    sync_writes: bool,
}

impl FileBackend {
    /// Opens or creates a file backend at the given path.
    ///
    /// If the file exists, it is opened for reading and writing.
    /// If it doesn't exist, a new file is created.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(size),
            sync_writes: false,
        })
    }

    /// Opens or creates a file backend, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Requests a data sync after every write.
    #[must_use]
    pub fn with_sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    /// Returns whether every write is followed by a data sync.
    #[must_use]
    pub fn sync_writes(&self) -> bool {
        self.sync_writes
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let size = *self.size.read();
        let len = buf.len();
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        if len == 0 {
            return Ok(());
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;

        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut file = self.file.write();
        let mut size = self.size.write();

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        if self.sync_writes {
            file.sync_data()?;
        }

        let end = offset + data.len() as u64;
        if end > *size {
            *size = end;
        }

        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        if data.is_empty() {
            return Ok(*self.size.read());
        }

        let mut file = self.file.write();
        let mut size = self.size.write();

        let offset = *size;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        if self.sync_writes {
            file.sync_data()?;
        }
        *size += data.len() as u64;

        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        let mut file = self.file.write();
        file.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn sync(&mut self) -> StorageResult<()> {
        let file = self.file.write();
        file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let file = self.file.write();
        let mut size = self.size.write();

        if new_size > *size {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "cannot truncate to size {} which is greater than current size {}",
                    new_size, *size
                ),
            )));
        }

        file.set_len(new_size)?;
        if self.sync_writes {
            file.sync_data()?;
        }
        *size = new_size;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.idx");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
        assert!(!backend.sync_writes());
    }

    #[test]
    fn file_write_at_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.write_at(0, b"hello world").unwrap();
        backend.write_at(6, b"pages").unwrap();

        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(&backend.read_at(0, 11).unwrap(), b"hello pages");
    }

    #[test]
    fn file_write_past_end_zero_fills() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.write_at(8, b"xy").unwrap();

        assert_eq!(backend.size().unwrap(), 10);
        assert_eq!(backend.read_at(0, 10).unwrap(), b"\0\0\0\0\0\0\0\0xy");
    }

    #[test]
    fn file_read_into_buffer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(b"0123456789").unwrap();

        let mut buf = [0u8; 4];
        backend.read_into(3, &mut buf).unwrap();
        assert_eq!(&buf, b"3456");
    }

    #[test]
    fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(b"hello").unwrap();

        let result = backend.read_at(3, 5);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
        assert!(result.unwrap_err().is_eof());
    }

    #[test]
    fn file_append_after_write_at() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.fdp");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.write_at(0, b"abc").unwrap();
        let offset = backend.append(b"def").unwrap();

        assert_eq!(offset, 3);
        assert_eq!(&backend.read_at(0, 6).unwrap(), b"abcdef");
    }

    #[test]
    fn file_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.fdp");

        let mut backend = FileBackend::open(&path).unwrap().with_sync_writes(true);
        backend.append(&[1u8; 24]).unwrap();
        backend.truncate(16).unwrap();
        assert_eq!(backend.size().unwrap(), 16);

        assert!(backend.truncate(32).is_err());
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.attr");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.write_at(0, b"persistent data").unwrap();
            backend.sync().unwrap();
        }

        {
            let backend = FileBackend::open(&path).unwrap();
            assert_eq!(backend.size().unwrap(), 15);
            assert_eq!(&backend.read_at(0, 15).unwrap(), b"persistent data");
        }
    }

    #[test]
    fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("path").join("test.idx");

        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
        assert_eq!(backend.path(), path);
    }
}
