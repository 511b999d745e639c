//! CLI command implementations.

pub mod inspect;
pub mod kv;
pub mod rebuild;
pub mod verify;

use rdb_core::{Config, CoreResult, Database};
use std::path::PathBuf;

/// Database selection and tuning shared by every command.
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Database directory.
    pub path: PathBuf,
    /// Database name.
    pub name: String,
    /// Requested hash directory size.
    pub hash_table_size: Option<u32>,
    /// Requested key page size.
    pub key_page_size: Option<usize>,
    /// Requested value page size.
    pub value_page_size: Option<usize>,
    /// Page arena share of physical memory.
    pub memory_usage_percent: Option<u32>,
    /// Sync the value file on every write.
    pub sync_data_file: Option<bool>,
    /// Sync the key file on every write.
    pub sync_index_file: Option<bool>,
}

impl DbOptions {
    /// Options for `name` in `path` with everything else left at defaults.
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            hash_table_size: None,
            key_page_size: None,
            value_page_size: None,
            memory_usage_percent: None,
            sync_data_file: None,
            sync_index_file: None,
        }
    }

    /// Builds the engine configuration.
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        if let Some(percent) = self.memory_usage_percent {
            config = config.memory_usage_percent(percent);
        }
        if let Some(sync) = self.sync_data_file {
            config = config.sync_data_file(sync);
        }
        if let Some(sync) = self.sync_index_file {
            config = config.sync_index_file(sync);
        }
        config
    }

    /// Opens the database. Geometry options shape a new database and are
    /// kept pending for a rebuild of an existing one.
    pub fn open(&self) -> CoreResult<Database> {
        let db = Database::new(&self.path, self.name.clone(), self.config());
        if let Some(size) = self.hash_table_size {
            db.set_hash_table_size(size)?;
        }
        if let Some(size) = self.key_page_size {
            db.set_key_page_size(size)?;
        }
        if let Some(size) = self.value_page_size {
            db.set_value_page_size(size)?;
        }
        db.open()?;
        Ok(db)
    }
}
