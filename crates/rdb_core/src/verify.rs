//! Consistency checks over the whole database.

use crate::database::OpenDb;
use crate::error::CoreResult;
use crate::hash::bucket_of;
use crate::page::{is_live, page_flags, NIL};
use crate::prime::is_prime;
use crate::table::value_flags_at;
use std::collections::HashSet;

/// Result of [`Database::verify`](crate::Database::verify).
///
/// Problems are collected rather than returned as errors so one pass
/// reports everything it finds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Number of hash directory slots.
    pub hash_table_size: u32,
    /// Directory slots with a non-empty chain.
    pub buckets_used: u64,
    /// Key pages reachable from the directory.
    pub live_keys: u64,
    /// Value pages referenced by reachable keys.
    pub live_value_pages: u64,
    /// Page slots in the key file.
    pub key_pages: u64,
    /// Page slots in the value file.
    pub value_pages: u64,
    /// Length of the longest chain.
    pub longest_chain: u64,
    /// Key pages waiting for reuse.
    pub free_key_pages: usize,
    /// Value pages waiting for reuse.
    pub free_value_pages: usize,
    /// Human-readable descriptions of every violation found.
    pub problems: Vec<String>,
}

impl VerifyReport {
    /// Returns true if no problem was found.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }

    fn problem(&mut self, message: impl Into<String>) {
        self.problems.push(message.into());
    }
}

pub(crate) fn verify(db: &OpenDb) -> CoreResult<VerifyReport> {
    let table = db.table();
    let slots = db.keys.slots();
    let mut report = VerifyReport {
        hash_table_size: slots,
        ..VerifyReport::default()
    };

    if !is_prime(u64::from(slots)) {
        report.problem(format!("hash table size {slots} is not prime"));
    }

    let mut reachable = HashSet::new();
    let mut referenced = HashSet::new();

    for bucket in 0..slots {
        if db.keys.head(bucket) == NIL {
            continue;
        }
        report.buckets_used += 1;

        let mut keys_seen = HashSet::new();
        let mut length = 0u64;
        for entry in table.chain(bucket)? {
            let (offset, page) = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    report.problem(format!("bucket {bucket}: {e}"));
                    break;
                }
            };
            length += 1;
            report.live_keys += 1;
            reachable.insert(offset);

            let expected = bucket_of(&page.key, slots);
            if expected != bucket {
                report.problem(format!(
                    "key page {offset} hashes to bucket {expected} but is chained from {bucket}"
                ));
            }
            if !keys_seen.insert(page.key.clone()) {
                report.problem(format!("key page {offset} duplicates a key in bucket {bucket}"));
            }

            match table.value_chain(&page) {
                Ok(chain) => {
                    for (i, slot) in chain.iter().enumerate() {
                        if slot.flags != value_flags_at(i) {
                            report.problem(format!(
                                "value page {} has flags {:#06x} at chain position {i}",
                                slot.offset, slot.flags
                            ));
                        }
                        if !referenced.insert(slot.offset) {
                            report.problem(format!(
                                "value page {} is referenced by more than one key",
                                slot.offset
                            ));
                        }
                    }
                }
                Err(e) => report.problem(format!("key page {offset}: {e}")),
            }
        }
        report.longest_chain = report.longest_chain.max(length);
    }
    report.live_value_pages = referenced.len() as u64;

    let free_keys = db.keys.free_pages();
    let free_values = db.values.free_pages();
    report.free_key_pages = free_keys.len();
    report.free_value_pages = free_values.len();

    for offset in free_keys.into_iter().filter(|o| reachable.contains(o)) {
        report.problem(format!("key page {offset} is live and on the free list"));
    }
    for offset in free_values.into_iter().filter(|o| referenced.contains(o)) {
        report.problem(format!("value page {offset} is live and on the free list"));
    }

    let mut flags = [0u8; 2];
    for offset in db.keys.page_offsets()? {
        report.key_pages += 1;
        db.keys.read(offset, &mut flags)?;
        if is_live(page_flags(&flags)) && !reachable.contains(&offset) {
            report.problem(format!("key page {offset} is in use but unreachable"));
        }
    }
    for offset in db.values.page_offsets()? {
        report.value_pages += 1;
        db.values.read(offset, &mut flags)?;
        if is_live(page_flags(&flags)) && !referenced.contains(&offset) {
            report.problem(format!("value page {offset} is in use but unreferenced"));
        }
    }

    Ok(report)
}
