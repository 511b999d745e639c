//! Database facade.

use crate::arena::{memory_budget, PageArena};
use crate::attr::{AttributeStore, Attributes};
use crate::config::{
    validate_hash_table_size, validate_key_page_size, validate_value_page_size, Config,
};
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::hash::bucket_of;
use crate::lock::BucketLocks;
use crate::page::{KeyPage, KEY_HEADER_SIZE, NIL};
use crate::prime::next_prime;
use crate::rebuild::{self, RebuildStats};
use crate::stats::{DatabaseInfo, DatabaseStats, StatsSnapshot};
use crate::store::{KeyStore, ValueStore};
use crate::table::HashTable;
use crate::verify::{self, VerifyReport};
use parking_lot::{Mutex, RwLock};
use rdb_storage::FileBackend;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Geometry requested through the setters, applied when the database is
/// created or on the next rebuild.
#[derive(Debug, Default, Clone, Copy)]
struct PendingGeometry {
    hash_table_size: Option<u32>,
    key_page_size: Option<usize>,
    value_page_size: Option<usize>,
}

/// Paths of one complete file set.
#[derive(Debug, Clone)]
pub(crate) struct StoreFiles {
    pub(crate) attr: PathBuf,
    pub(crate) key: PathBuf,
    pub(crate) value: PathBuf,
    pub(crate) free_list: PathBuf,
}

impl StoreFiles {
    fn current(dir: &DatabaseDir) -> Self {
        Self {
            attr: dir.attr_path(),
            key: dir.key_path(),
            value: dir.value_path(),
            free_list: dir.free_list_path(),
        }
    }

    fn staged(dir: &DatabaseDir) -> Self {
        let current = Self::current(dir);
        Self {
            attr: DatabaseDir::staged_path(&current.attr),
            key: DatabaseDir::staged_path(&current.key),
            value: DatabaseDir::staged_path(&current.value),
            free_list: DatabaseDir::staged_path(&current.free_list),
        }
    }
}

/// Everything that exists only while the database is open.
#[derive(Debug)]
pub(crate) struct OpenDb {
    pub(crate) dir: DatabaseDir,
    pub(crate) attrs: Attributes,
    pub(crate) keys: KeyStore,
    pub(crate) values: ValueStore,
    pub(crate) arena: PageArena,
    pub(crate) locks: BucketLocks,
}

/// The main database handle.
///
/// A `Database` names a file set (`<path>/<name>.*`) and moves between
/// two states: closed and open. Every data operation requires the open
/// state and fails with `InvalidState` otherwise.
///
/// Operations on different buckets run in parallel. [`rebuild`](Self::rebuild)
/// and [`verify`](Self::verify) exclude everything else.
///
/// # Example
///
/// ```rust,ignore
/// use rdb_core::{Config, Database};
/// use std::path::Path;
///
/// let db = Database::open_with_config(Path::new("data"), "users", Config::default())?;
/// db.set(b"alice", b"admin")?;
/// assert_eq!(db.get(b"alice")?, Some(b"admin".to_vec()));
/// db.close()?;
/// ```
#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    name: String,
    config: Config,
    pending: Mutex<PendingGeometry>,
    state: RwLock<Option<OpenDb>>,
    stats: DatabaseStats,
}

impl Database {
    /// Creates a closed handle. Nothing touches the disk until
    /// [`open`](Self::open).
    #[must_use]
    pub fn new(path: impl AsRef<Path>, name: impl Into<String>, config: Config) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            name: name.into(),
            config,
            pending: Mutex::new(PendingGeometry::default()),
            state: RwLock::new(None),
            stats: DatabaseStats::new(),
        }
    }

    /// Creates a handle and opens it.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn open_with_config(
        path: impl AsRef<Path>,
        name: impl Into<String>,
        config: Config,
    ) -> CoreResult<Self> {
        let db = Self::new(path, name, config);
        db.open()?;
        Ok(db)
    }

    /// Opens the database, creating it if it does not exist yet.
    ///
    /// The method:
    /// - Locks `<name>.lock` against other processes
    /// - Finishes or rolls back a rebuild interrupted by a crash
    /// - Reads the attributes, or writes them for a new database
    /// - Opens the key and value files and sizes the page arena
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The database is already open (`InvalidState`)
    /// - The configuration is invalid (`InvalidArgument`)
    /// - Another process has the database locked (`DatabaseLocked`)
    /// - The database does not exist and `create_if_missing` is false
    /// - The files are damaged (`InvalidFormat`) or I/O fails
    pub fn open(&self) -> CoreResult<()> {
        let mut state = self.state.write();
        if state.is_some() {
            return Err(CoreError::invalid_state("database is already open"));
        }

        self.config.validate()?;
        let dir = DatabaseDir::open(&self.path, &self.name, self.config.create_if_missing)?;
        dir.recover_interrupted_rebuild()?;

        let pending = *self.pending.lock();
        let opened = OpenDb::open(dir, &self.config, pending)?;
        debug!(
            path = %self.path.display(),
            name = %self.name,
            hash_table_size = opened.attrs.hash_table_size,
            "database opened"
        );
        *state = Some(opened);
        Ok(())
    }

    /// Syncs and closes the database. Closing a closed database is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails. The database is closed
    /// either way.
    pub fn close(&self) -> CoreResult<()> {
        let Some(db) = self.state.write().take() else {
            return Ok(());
        };
        db.sync()?;
        debug!(name = %self.name, "database closed");
        Ok(())
    }

    /// Returns whether the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.read().is_some()
    }

    /// Returns the database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns database configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Looks up `key`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty key, `InvalidState` if the
    /// database is closed, `CorruptPage` if the chain or value is damaged,
    /// or an I/O error.
    pub fn get(&self, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        check_key(key)?;
        let value = self.with_open(|db| {
            if key.len() > db.max_key_len() {
                return Ok(None);
            }
            let bucket = db.bucket(key);
            let _guard = db.locks.read(bucket);
            let table = db.table();
            match table.lookup(bucket, key)? {
                Some((_, page)) => table.read_value(&page).map(Some),
                None => Ok(None),
            }
        })?;
        self.stats.record_read(value.as_ref().map(Vec::len));
        Ok(value)
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty key, a key longer than the
    /// key page allows, or a value longer than `max_value_len`. Returns
    /// `InvalidState` if the database is closed, or a storage error. A
    /// failed `set` leaves the previous value in place.
    pub fn set(&self, key: &[u8], value: &[u8]) -> CoreResult<()> {
        check_key(key)?;
        self.check_value(value)?;
        self.with_open(|db| {
            db.check_key_fits(key)?;
            let bucket = db.bucket(key);
            let _guard = db.locks.write(bucket);
            db.store(bucket, key, value)
        })?;
        self.stats.record_write(value.len());
        Ok(())
    }

    /// Removes `key`. Returns false if it was not present.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty key, `InvalidState` if the
    /// database is closed, or a storage error.
    pub fn remove(&self, key: &[u8]) -> CoreResult<bool> {
        check_key(key)?;
        let removed = self.with_open(|db| {
            if key.len() > db.max_key_len() {
                return Ok(false);
            }
            let bucket = db.bucket(key);
            let _guard = db.locks.write(bucket);
            let table = db.table();
            match table.lookup(bucket, key)? {
                Some((offset, page)) => table.unlink(offset, &page).map(|()| true),
                None => Ok(false),
            }
        })?;
        if removed {
            self.stats.record_delete();
        }
        Ok(removed)
    }

    /// Replaces the value of `key` with `f(current)` while holding the
    /// bucket exclusively.
    ///
    /// `f` must not call back into this database.
    ///
    /// # Errors
    ///
    /// Same as [`set`](Self::set), checked against the value `f` returns.
    pub fn update<F>(&self, key: &[u8], f: F) -> CoreResult<()>
    where
        F: FnOnce(Option<&[u8]>) -> Vec<u8>,
    {
        check_key(key)?;
        self.stats.record_update();
        let written = self.with_open(|db| {
            db.check_key_fits(key)?;
            let bucket = db.bucket(key);
            let _guard = db.locks.write(bucket);
            let table = db.table();

            let found = table.lookup(bucket, key)?;
            let current = match &found {
                Some((_, page)) => Some(table.read_value(page)?),
                None => None,
            };
            let value = f(current.as_deref());
            self.check_value(&value)?;

            match found {
                Some((offset, mut page)) => table.overwrite(offset, &mut page, &value)?,
                None => {
                    table.insert(bucket, key, &value)?;
                }
            }
            Ok(value.len())
        })?;
        self.stats.record_write(written);
        Ok(())
    }

    /// Returns every key/value pair, in directory order.
    ///
    /// Each bucket is read under its own shared lock, so the result is not
    /// a point-in-time snapshot while writers are active.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the database is closed, `CorruptPage` if
    /// a chain is damaged, or an I/O error.
    pub fn scan(&self) -> CoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.stats.record_scan();
        self.with_open(|db| {
            let mut out = Vec::new();
            db.for_each_key(|table, page| {
                let value = table.read_value(&page)?;
                out.push((page.key, value));
                Ok(())
            })?;
            Ok(out)
        })
    }

    /// Counts the keys in the database by walking every chain.
    ///
    /// # Errors
    ///
    /// Same as [`scan`](Self::scan).
    pub fn len(&self) -> CoreResult<u64> {
        self.with_open(|db| {
            let mut count = 0u64;
            db.for_each_key(|_, _| {
                count += 1;
                Ok(())
            })?;
            Ok(count)
        })
    }

    /// Returns true if the database holds no keys.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the database is closed.
    pub fn is_empty(&self) -> CoreResult<bool> {
        self.with_open(|db| Ok((0..db.keys.slots()).all(|b| db.keys.head(b) == NIL)))
    }

    /// Rewrites every live record into fresh files, compacting free space
    /// and applying any geometry set through the `set_*` methods.
    ///
    /// Other operations wait until the rebuild has finished. On error the
    /// database keeps its previous files and stays usable, unless the
    /// final reopen fails, in which case it is left closed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the database is closed, `InvalidArgument`
    /// if a stored key does not fit the new key page size, or a storage
    /// error.
    pub fn rebuild(&self) -> CoreResult<RebuildStats> {
        let mut state = self.state.write();
        let db = state.as_ref().ok_or_else(not_open)?;
        let pending = *self.pending.lock();
        let target = rebuild_attributes(&db.attrs, pending)?;

        info!(
            name = %self.name,
            from = db.attrs.hash_table_size,
            to = target.hash_table_size,
            key_page_size = target.key_page_size,
            value_page_size = target.value_page_size,
            "rebuilding database"
        );

        db.dir.remove_staged()?;
        let staged = StoreFiles::staged(&db.dir);
        let stats = match rebuild::copy_live(db, &staged, target, &self.config) {
            Ok(stats) => stats,
            Err(e) => {
                if let Err(cleanup) = db.dir.remove_staged() {
                    warn!(error = %cleanup, "could not remove staged rebuild files");
                }
                self.stats.record_error();
                return Err(e);
            }
        };

        let dir = state.take().ok_or_else(not_open)?.into_dir();
        if let Err(e) = dir.swap_in_staged() {
            self.stats.record_error();
            if let Err(cleanup) = dir.remove_staged() {
                warn!(error = %cleanup, "could not remove staged rebuild files");
            }
            *state = Some(OpenDb::open(dir, &self.config, pending)?);
            return Err(e);
        }

        *state = Some(OpenDb::open(dir, &self.config, PendingGeometry::default())?);
        *self.pending.lock() = PendingGeometry::default();
        self.stats.record_rebuild();

        info!(
            keys = stats.keys,
            skipped = stats.skipped,
            recovered = stats.recovered,
            key_file = stats.key_file_after,
            value_file = stats.value_file_after,
            "rebuild complete"
        );
        Ok(stats)
    }

    /// Sets the key page size used when the database is created or next
    /// rebuilt.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `size` is out of range.
    pub fn set_key_page_size(&self, size: usize) -> CoreResult<()> {
        validate_key_page_size(size)?;
        self.pending.lock().key_page_size = Some(size);
        Ok(())
    }

    /// Sets the value page size used when the database is created or next
    /// rebuilt.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `size` is out of range.
    pub fn set_value_page_size(&self, size: usize) -> CoreResult<()> {
        validate_value_page_size(size)?;
        self.pending.lock().value_page_size = Some(size);
        Ok(())
    }

    /// Sets the directory size used when the database is created or next
    /// rebuilt. It is rounded up to a prime when applied.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `size` is out of range.
    pub fn set_hash_table_size(&self, size: u32) -> CoreResult<()> {
        validate_hash_table_size(size)?;
        self.pending.lock().hash_table_size = Some(size);
        Ok(())
    }

    /// Checks every on-disk invariant while holding the database
    /// exclusively.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the database is closed or an I/O error.
    /// Damage is reported in the returned [`VerifyReport`].
    pub fn verify(&self) -> CoreResult<VerifyReport> {
        let state = self.state.write();
        let db = state.as_ref().ok_or_else(not_open)?;
        verify::verify(db)
    }

    /// Returns a snapshot of the operation counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns geometry and space usage.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the database is closed or an I/O error.
    pub fn info(&self) -> CoreResult<DatabaseInfo> {
        self.with_open(|db| {
            Ok(DatabaseInfo {
                version: db.attrs.version,
                hash_table_size: db.attrs.hash_table_size,
                key_page_size: db.attrs.key_page_size as usize,
                value_page_size: db.attrs.value_page_size as usize,
                key_file_size: db.keys.size()?,
                value_file_size: db.values.size()?,
                free_key_pages: db.keys.free_pages().len(),
                free_value_pages: db.values.free_pages().len(),
                arena_capacity: db.arena.capacity(),
                arena_in_use: db.arena.in_use(),
                key_cache: db.keys.cache().stats(),
            })
        })
    }

    /// Flushes both page files to disk.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the database is closed or an I/O error.
    pub fn sync(&self) -> CoreResult<()> {
        self.with_open(OpenDb::sync)
    }

    fn with_open<T>(&self, f: impl FnOnce(&OpenDb) -> CoreResult<T>) -> CoreResult<T> {
        let state = self.state.read();
        let db = state.as_ref().ok_or_else(not_open)?;
        let result = f(db);
        if result.is_err() {
            self.stats.record_error();
        }
        result
    }

    fn check_value(&self, value: &[u8]) -> CoreResult<()> {
        if value.len() > self.config.max_value_len {
            return Err(CoreError::invalid_argument(format!(
                "value of {} bytes exceeds the {}-byte limit",
                value.len(),
                self.config.max_value_len
            )));
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(name = %self.name, error = %e, "close on drop failed");
        }
    }
}

impl OpenDb {
    fn open(dir: DatabaseDir, config: &Config, pending: PendingGeometry) -> CoreResult<Self> {
        let files = StoreFiles::current(&dir);
        if dir.is_new_database() && !config.create_if_missing {
            return Err(CoreError::invalid_state(format!(
                "database {} does not exist",
                dir.name()
            )));
        }

        let mut attr_store = AttributeStore::open(Box::new(FileBackend::open(&files.attr)?));
        let attrs = match attr_store.read()? {
            Some(attrs) => attrs,
            None => {
                let attrs = creation_attributes(config, pending)?;
                attr_store.write(&attrs)?;
                debug!(
                    name = dir.name(),
                    hash_table_size = attrs.hash_table_size,
                    key_page_size = attrs.key_page_size,
                    value_page_size = attrs.value_page_size,
                    "created database"
                );
                attrs
            }
        };

        let page_size = attrs.key_page_size.max(attrs.value_page_size) as usize;
        let budget = memory_budget(config.memory_usage_percent, config.arena_limit);
        let cache_bytes = budget / 100 * config.key_cache_percent as usize;
        let cache_pages = cache_bytes / attrs.key_page_size as usize;
        debug!(budget, cache_pages, "splitting memory budget");

        let arena = PageArena::with_capacity(page_size, budget - cache_bytes)?;
        let (keys, values) = open_stores(&files, &attrs, config, &arena, true)?;
        let keys = keys.with_cache_capacity(cache_pages);

        Ok(Self {
            dir,
            attrs,
            keys,
            values,
            arena,
            locks: BucketLocks::new(),
        })
    }

    pub(crate) fn table(&self) -> HashTable<'_> {
        HashTable::new(&self.keys, &self.values, &self.arena)
    }

    fn bucket(&self, key: &[u8]) -> u32 {
        bucket_of(key, self.attrs.hash_table_size)
    }

    fn max_key_len(&self) -> usize {
        self.attrs.key_page_size as usize - KEY_HEADER_SIZE
    }

    fn check_key_fits(&self, key: &[u8]) -> CoreResult<()> {
        if key.len() > self.max_key_len() {
            return Err(CoreError::invalid_argument(format!(
                "key of {} bytes exceeds the {}-byte limit of this database",
                key.len(),
                self.max_key_len()
            )));
        }
        Ok(())
    }

    /// Inserts or overwrites. The caller holds the bucket exclusively.
    fn store(&self, bucket: u32, key: &[u8], value: &[u8]) -> CoreResult<()> {
        let table = self.table();
        match table.lookup(bucket, key)? {
            Some((offset, mut page)) => table.overwrite(offset, &mut page, value),
            None => table.insert(bucket, key, value).map(|_| ()),
        }
    }

    /// Visits every reachable key page, one bucket at a time under that
    /// bucket's shared lock.
    fn for_each_key(
        &self,
        mut visit: impl FnMut(&HashTable<'_>, KeyPage) -> CoreResult<()>,
    ) -> CoreResult<()> {
        let table = self.table();
        for bucket in 0..self.keys.slots() {
            if self.keys.head(bucket) == NIL {
                continue;
            }
            let _guard = self.locks.read(bucket);
            for entry in table.chain(bucket)? {
                let (_, page) = entry?;
                visit(&table, page)?;
            }
        }
        Ok(())
    }

    fn sync(&self) -> CoreResult<()> {
        self.keys.sync()?;
        self.values.sync()
    }

    /// Closes the page files, keeping only the directory lock.
    fn into_dir(self) -> DatabaseDir {
        if let Err(e) = self.sync() {
            warn!(error = %e, "sync before file swap failed");
        }
        self.dir
    }
}

/// Opens the key and value stores of one file set. `sync` enables the
/// per-write sync flags from `config`; a staged set is synced once at the
/// end instead.
pub(crate) fn open_stores(
    files: &StoreFiles,
    attrs: &Attributes,
    config: &Config,
    arena: &PageArena,
    sync: bool,
) -> CoreResult<(KeyStore, ValueStore)> {
    let key_backend =
        FileBackend::open(&files.key)?.with_sync_writes(sync && config.sync_index_file);
    let value_backend =
        FileBackend::open(&files.value)?.with_sync_writes(sync && config.sync_data_file);
    let journal =
        FileBackend::open(&files.free_list)?.with_sync_writes(sync && config.sync_data_file);

    let keys = KeyStore::open(
        Box::new(key_backend),
        attrs.hash_table_size,
        attrs.key_page_size as usize,
        arena,
    )?;
    let values = ValueStore::open(
        Box::new(value_backend),
        Some(Box::new(journal)),
        attrs.value_page_size as usize,
        arena,
    )?;
    Ok((keys, values))
}

fn creation_attributes(config: &Config, pending: PendingGeometry) -> CoreResult<Attributes> {
    geometry(
        pending.hash_table_size.unwrap_or(config.hash_table_size),
        pending.key_page_size.unwrap_or(config.key_page_size),
        pending.value_page_size.unwrap_or(config.value_page_size),
    )
}

fn rebuild_attributes(current: &Attributes, pending: PendingGeometry) -> CoreResult<Attributes> {
    geometry(
        pending.hash_table_size.unwrap_or(current.hash_table_size),
        pending
            .key_page_size
            .unwrap_or(current.key_page_size as usize),
        pending
            .value_page_size
            .unwrap_or(current.value_page_size as usize),
    )
}

fn geometry(
    hash_table_size: u32,
    key_page_size: usize,
    value_page_size: usize,
) -> CoreResult<Attributes> {
    validate_hash_table_size(hash_table_size)?;
    validate_key_page_size(key_page_size)?;
    validate_value_page_size(value_page_size)?;

    let slots = u32::try_from(next_prime(u64::from(hash_table_size))).map_err(|_| {
        CoreError::invalid_argument(format!("hash table size {hash_table_size} is too large"))
    })?;
    Ok(Attributes::new(
        slots,
        key_page_size as u32,
        value_page_size as u32,
    ))
}

fn check_key(key: &[u8]) -> CoreResult<()> {
    if key.is_empty() {
        return Err(CoreError::invalid_argument("key must not be empty"));
    }
    Ok(())
}

fn not_open() -> CoreError {
    CoreError::invalid_state("database is not open")
}
