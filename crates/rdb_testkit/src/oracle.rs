//! A `HashMap` model of the database.
//!
//! [`Oracle::apply`] runs an [`Op`] against both the model and a real
//! database and reports the first disagreement.

use crate::generators::Op;
use rdb_core::{CoreResult, Database};
use std::collections::HashMap;

/// In-memory model of the expected database contents.
#[derive(Debug, Default, Clone)]
pub struct Oracle {
    entries: HashMap<Vec<u8>, Vec<u8>>,
}

impl Oracle {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys the model holds.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the model is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Expected value of `key`.
    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.entries.get(key)
    }

    /// Iterates over the expected entries.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        self.entries.iter()
    }

    /// Applies `op` to the model and to `db`, returning a description of
    /// any mismatch.
    pub fn apply(&mut self, db: &Database, op: &Op) -> CoreResult<Result<(), String>> {
        match op {
            Op::Set(key, value) => {
                db.set(key, value)?;
                self.entries.insert(key.clone(), value.clone());
            }
            Op::Get(key) => {
                let actual = db.get(key)?;
                let expected = self.entries.get(key);
                if actual.as_ref() != expected {
                    return Ok(Err(format!(
                        "get({key:?}): expected {expected:?}, got {actual:?}"
                    )));
                }
            }
            Op::Remove(key) => {
                let removed = db.remove(key)?;
                let expected = self.entries.remove(key).is_some();
                if removed != expected {
                    return Ok(Err(format!(
                        "remove({key:?}): expected {expected}, got {removed}"
                    )));
                }
            }
            Op::Append(key, suffix) => {
                db.update(key, |current| {
                    let mut next = current.map(<[u8]>::to_vec).unwrap_or_default();
                    next.extend_from_slice(suffix);
                    next
                })?;
                self.entries
                    .entry(key.clone())
                    .or_default()
                    .extend_from_slice(suffix);
            }
        }
        Ok(Ok(()))
    }

    /// Compares every entry of the model with `db`, including the key count.
    pub fn check(&self, db: &Database) -> CoreResult<Result<(), String>> {
        for (key, expected) in &self.entries {
            let actual = db.get(key)?;
            if actual.as_ref() != Some(expected) {
                return Ok(Err(format!(
                    "key {key:?}: expected {expected:?}, got {actual:?}"
                )));
            }
        }
        let len = db.len()?;
        if len != self.entries.len() as u64 {
            return Ok(Err(format!(
                "len: expected {}, got {len}",
                self.entries.len()
            )));
        }
        Ok(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestDatabase;

    #[test]
    fn oracle_tracks_append() {
        let db = TestDatabase::new();
        let mut oracle = Oracle::new();
        let ops = [
            Op::Append(b"a".to_vec(), b"x".to_vec()),
            Op::Append(b"a".to_vec(), b"y".to_vec()),
            Op::Get(b"a".to_vec()),
            Op::Remove(b"a".to_vec()),
            Op::Remove(b"a".to_vec()),
        ];
        for op in &ops {
            oracle.apply(&db, op).unwrap().unwrap();
        }
        assert!(oracle.is_empty());
        oracle.check(&db).unwrap().unwrap();
    }
}
