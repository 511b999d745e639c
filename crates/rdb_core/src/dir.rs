//! Database directory management.
//!
//! This module handles the file system layout for RDB:
//!
//! ```text
//! <db_path>/
//! ├─ <name>.lock       # Advisory lock for single-process access
//! ├─ <name>.attr       # Attribute record (geometry, format version)
//! ├─ <name>.idx        # Hash directory and key pages
//! ├─ <name>.db         # Value pages
//! └─ <name>.fdp        # Free-page journal of the value file
//! ```
//!
//! A rebuild writes a complete second file set with a `.new` suffix and
//! swaps it in by renaming, keeping the old set as `.bak` until the swap
//! has finished.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const LOCK_EXT: &str = "lock";
const ATTR_EXT: &str = "attr";
const KEY_EXT: &str = "idx";
const VALUE_EXT: &str = "db";
const FREE_LIST_EXT: &str = "fdp";

const STAGED_SUFFIX: &str = ".new";
const BACKUP_SUFFIX: &str = ".bak";

/// Manages the database file set and the process lock.
///
/// # Thread Safety
///
/// The `DatabaseDir` holds an exclusive lock on `<name>.lock`. Only one
/// `DatabaseDir` instance can exist per database at a time.
///
/// # Example
///
/// ```rust,ignore
/// use rdb_core::dir::DatabaseDir;
/// use std::path::Path;
///
/// let dir = DatabaseDir::open(Path::new("data"), "users", true)?;
/// println!("key file: {:?}", dir.key_path());
/// ```
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    name: String,
    /// Lock file handle (held for exclusive access).
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens or creates a database directory and locks database `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `name` is empty or contains a path separator (`InvalidArgument`)
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `DatabaseLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, name: &str, create_if_missing: bool) -> CoreResult<Self> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(CoreError::invalid_argument(format!(
                "invalid database name {name:?}"
            )));
        }

        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "database directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_path = path.join(format!("{name}.{LOCK_EXT}"));
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        // Try to acquire exclusive lock (non-blocking)
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            name: name.to_string(),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the path to the attribute file.
    #[must_use]
    pub fn attr_path(&self) -> PathBuf {
        self.file(ATTR_EXT)
    }

    /// Returns the path to the key file.
    #[must_use]
    pub fn key_path(&self) -> PathBuf {
        self.file(KEY_EXT)
    }

    /// Returns the path to the value file.
    #[must_use]
    pub fn value_path(&self) -> PathBuf {
        self.file(VALUE_EXT)
    }

    /// Returns the path to the value file's free-page journal.
    #[must_use]
    pub fn free_list_path(&self) -> PathBuf {
        self.file(FREE_LIST_EXT)
    }

    /// Every file that makes up the database, lock file excluded.
    #[must_use]
    pub fn data_files(&self) -> [PathBuf; 4] {
        [
            self.attr_path(),
            self.key_path(),
            self.value_path(),
            self.free_list_path(),
        ]
    }

    /// Checks if the database has been created.
    #[must_use]
    pub fn is_new_database(&self) -> bool {
        fs::metadata(self.attr_path()).map_or(true, |m| m.len() == 0)
    }

    /// Returns the path a rebuild writes the replacement for `current` to.
    #[must_use]
    pub fn staged_path(current: &Path) -> PathBuf {
        with_suffix(current, STAGED_SUFFIX)
    }

    /// Returns the path `current` is parked at while a rebuild swaps files.
    #[must_use]
    pub fn backup_path(current: &Path) -> PathBuf {
        with_suffix(current, BACKUP_SUFFIX)
    }

    /// Deletes any staged files left by an unfinished rebuild.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a staged file exists but cannot be removed.
    pub fn remove_staged(&self) -> CoreResult<()> {
        for current in self.data_files() {
            remove_if_exists(&Self::staged_path(&current))?;
        }
        Ok(())
    }

    /// Replaces the current file set with the staged one.
    ///
    /// Current files are renamed to backups, staged files are renamed into
    /// place, then backups are deleted. If any rename fails, the backups
    /// are put back and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of the failed rename.
    pub fn swap_in_staged(&self) -> CoreResult<()> {
        let files = self.data_files();
        let mut parked: Vec<&PathBuf> = Vec::new();

        for current in &files {
            if !current.exists() {
                continue;
            }
            if let Err(e) = fs::rename(current, Self::backup_path(current)) {
                self.restore_backups(&parked);
                return Err(e.into());
            }
            parked.push(current);
        }

        for (installed, current) in files.iter().enumerate() {
            if let Err(e) = fs::rename(Self::staged_path(current), current) {
                for done in &files[..installed] {
                    if let Err(undo) = fs::rename(done, Self::staged_path(done)) {
                        error!(file = %done.display(), error = %undo, "could not move staged file back");
                    }
                }
                self.restore_backups(&parked);
                return Err(e.into());
            }
        }

        self.sync_directory()?;

        for current in parked {
            if let Err(e) = fs::remove_file(Self::backup_path(current)) {
                warn!(file = %current.display(), error = %e, "could not remove rebuild backup");
            }
        }

        Ok(())
    }

    /// Cleans up after a rebuild that was interrupted by a crash.
    ///
    /// If staged files remain, the swap never completed: every backup is
    /// restored and the staged files are deleted. If only backups remain,
    /// the swap completed and the backups are stale.
    ///
    /// Returns true if anything was recovered or removed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a file cannot be renamed or removed.
    pub fn recover_interrupted_rebuild(&self) -> CoreResult<bool> {
        let files = self.data_files();
        let staged = files.iter().any(|f| Self::staged_path(f).exists());
        let backups: Vec<&PathBuf> = files
            .iter()
            .filter(|f| Self::backup_path(f).exists())
            .collect();

        if !staged && backups.is_empty() {
            return Ok(false);
        }

        if staged {
            for current in &backups {
                remove_if_exists(current)?;
                fs::rename(Self::backup_path(current), current)?;
            }
            self.remove_staged()?;
            info!(restored = backups.len(), "rolled back an interrupted rebuild");
        } else {
            for current in &backups {
                fs::remove_file(Self::backup_path(current))?;
            }
            info!(removed = backups.len(), "removed backups of a completed rebuild");
        }

        self.sync_directory()?;
        Ok(true)
    }

    /// Syncs the database directory to ensure metadata updates are durable.
    ///
    /// On Windows, directory fsync is not supported in the same way as Unix.
    /// NTFS journals metadata operations, so the explicit fsync is skipped.
    #[cfg(unix)]
    pub fn sync_directory(&self) -> CoreResult<()> {
        let dir = File::open(&self.path)?;
        dir.sync_all()?;
        Ok(())
    }

    /// Syncs the database directory to ensure metadata updates are durable.
    #[cfg(not(unix))]
    pub fn sync_directory(&self) -> CoreResult<()> {
        Ok(())
    }

    fn file(&self, ext: &str) -> PathBuf {
        self.path.join(format!("{}.{ext}", self.name))
    }

    fn restore_backups(&self, parked: &[&PathBuf]) {
        for current in parked {
            if let Err(e) = fs::rename(Self::backup_path(current), current) {
                error!(file = %current.display(), error = %e, "could not restore rebuild backup");
            }
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> CoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
