//! Rebuild (compaction and resizing).
//!
//! Every live record reachable from the hash directory is copied into a
//! staged file set with the target geometry. The engine then swaps the
//! staged set in; see [`DatabaseDir::swap_in_staged`](crate::dir::DatabaseDir::swap_in_staged).
//!
//! A chain that fails validation is walked up to the bad page. The rest
//! of its bucket is then recovered by scanning the key file for live
//! pages that name the bucket. A corrupt value skips its record. Lost
//! records are logged and counted, never fatal.

use crate::arena::PageArena;
use crate::attr::{AttributeStore, Attributes};
use crate::config::Config;
use crate::database::{open_stores, OpenDb, StoreFiles};
use crate::error::{CoreError, CoreResult};
use crate::hash::bucket_of;
use crate::page::{
    key_page_bucket, page_flags, KeyPage, FLAG_DELETED, FLAG_IN_USE, KEY_BUCKET_END,
    KEY_HEADER_SIZE,
};
use crate::table::HashTable;
use rdb_storage::FileBackend;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Arena pages the copy needs at most at once, with headroom.
const REBUILD_ARENA_PAGES: usize = 8;

/// Outcome of a rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RebuildStats {
    /// Records copied into the new files.
    pub keys: u64,
    /// Records lost because a page failed validation.
    pub skipped: u64,
    /// Records of damaged chains found by scanning the key file. Included
    /// in `keys`.
    pub recovered: u64,
    /// Directory size before the rebuild.
    pub old_hash_table_size: u32,
    /// Directory size after the rebuild.
    pub hash_table_size: u32,
    /// Key page size after the rebuild.
    pub key_page_size: u32,
    /// Value page size after the rebuild.
    pub value_page_size: u32,
    /// Key file size before the rebuild.
    pub key_file_before: u64,
    /// Key file size after the rebuild.
    pub key_file_after: u64,
    /// Value file size before the rebuild.
    pub value_file_before: u64,
    /// Value file size after the rebuild.
    pub value_file_after: u64,
}

/// Copies every live record of `db` into `staged` using `target`.
///
/// The staged files are synced before returning. They are not removed on
/// error; the caller owns cleanup.
pub(crate) fn copy_live(
    db: &OpenDb,
    staged: &StoreFiles,
    target: Attributes,
    config: &Config,
) -> CoreResult<RebuildStats> {
    let page_size = target.key_page_size.max(target.value_page_size) as usize;
    let arena = PageArena::with_capacity(page_size, page_size * REBUILD_ARENA_PAGES)?;
    let max_key_len = target.key_page_size as usize - KEY_HEADER_SIZE;

    let mut attr_store = AttributeStore::open(Box::new(FileBackend::open(&staged.attr)?));
    attr_store.write(&target)?;
    let (keys, values) = open_stores(staged, &target, config, &arena, false)?;

    let mut copier = Copier {
        old: db.table(),
        new: HashTable::new(&keys, &values, &arena),
        target,
        max_key_len,
        stats: RebuildStats {
            old_hash_table_size: db.attrs.hash_table_size,
            hash_table_size: target.hash_table_size,
            key_page_size: target.key_page_size,
            value_page_size: target.value_page_size,
            key_file_before: db.keys.size()?,
            value_file_before: db.values.size()?,
            ..RebuildStats::default()
        },
    };

    let mut damaged = HashMap::new();
    for bucket in 0..db.keys.slots() {
        for entry in copier.old.chain(bucket)? {
            match entry {
                Ok((offset, page)) => copier.copy(offset, &page)?,
                Err(e) => {
                    warn!(bucket, error = %e, "damaged chain, recovering its pages by scan");
                    damaged.insert(bucket, copier.chain_prefix(bucket)?);
                }
            }
        }
    }
    if !damaged.is_empty() {
        copier.recover(db, damaged)?;
    }

    let mut stats = copier.stats;
    keys.sync()?;
    values.sync()?;
    stats.key_file_after = keys.size()?;
    stats.value_file_after = values.size()?;

    debug!(
        keys = stats.keys,
        skipped = stats.skipped,
        recovered = stats.recovered,
        "staged files written"
    );
    Ok(stats)
}

struct Copier<'a> {
    old: HashTable<'a>,
    new: HashTable<'a>,
    target: Attributes,
    max_key_len: usize,
    stats: RebuildStats,
}

impl Copier<'_> {
    /// Copies one record. A value that fails validation skips the record.
    fn copy(&mut self, offset: u64, page: &KeyPage) -> CoreResult<()> {
        let value = match self.old.read_value(page) {
            Ok(value) => value,
            Err(e) => {
                warn!(offset, error = %e, "skipping record with a corrupt value");
                self.stats.skipped += 1;
                return Ok(());
            }
        };

        if page.key.len() > self.max_key_len {
            return Err(CoreError::invalid_argument(format!(
                "key of {} bytes does not fit a {}-byte key page",
                page.key.len(),
                self.target.key_page_size
            )));
        }

        self.new.insert(
            bucket_of(&page.key, self.target.hash_table_size),
            &page.key,
            &value,
        )?;
        self.stats.keys += 1;
        Ok(())
    }

    /// Keys of the valid part of a damaged chain, which were handled by
    /// the walk already.
    fn chain_prefix(&self, bucket: u32) -> CoreResult<HashSet<Vec<u8>>> {
        Ok(self
            .old
            .chain(bucket)?
            .map_while(Result::ok)
            .map(|(_, page)| page.key)
            .collect())
    }

    /// Scans the key file for live pages of damaged buckets that the walk
    /// did not reach. A live page of such a bucket that does not decode is
    /// a lost record.
    fn recover(
        &mut self,
        db: &OpenDb,
        mut damaged: HashMap<u32, HashSet<Vec<u8>>>,
    ) -> CoreResult<()> {
        let mut header = [0u8; KEY_BUCKET_END];
        for offset in db.keys.page_offsets()? {
            db.keys.read(offset, &mut header)?;
            let flags = page_flags(&header);
            if flags & FLAG_IN_USE == 0 || flags & FLAG_DELETED != 0 {
                continue;
            }
            let Some(seen) = damaged.get_mut(&key_page_bucket(&header)) else {
                continue;
            };

            let page = match db.keys.read_page(offset, &db.arena) {
                Ok(page) => page,
                Err(e) => {
                    warn!(offset, error = %e, "skipping unreadable key page");
                    self.stats.skipped += 1;
                    continue;
                }
            };
            if seen.contains(&page.key) {
                continue;
            }
            if bucket_of(&page.key, db.attrs.hash_table_size) != page.bucket {
                warn!(
                    offset,
                    bucket = page.bucket,
                    "skipping key page filed under the wrong bucket"
                );
                self.stats.skipped += 1;
                continue;
            }

            let copied = self.stats.keys;
            self.copy(offset, &page)?;
            if self.stats.keys > copied {
                self.stats.recovered += 1;
            }
            seen.insert(page.key);
        }
        Ok(())
    }
}
