//! Inspect command implementation.

use super::DbOptions;
use rdb_core::DatabaseInfo;
use serde::Serialize;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Database name.
    pub name: String,
    /// On-disk format version.
    pub version: u16,
    /// Number of hash directory slots.
    pub hash_table_size: u32,
    /// Key page size in bytes.
    pub key_page_size: usize,
    /// Value page size in bytes.
    pub value_page_size: usize,
    /// Number of live keys.
    pub keys: u64,
    /// Key file size in bytes.
    pub key_file_size: u64,
    /// Value file size in bytes.
    pub value_file_size: u64,
    /// Total size in bytes.
    pub total_size: u64,
    /// Key pages waiting for reuse.
    pub free_key_pages: usize,
    /// Value pages waiting for reuse.
    pub free_value_pages: usize,
    /// Page arena capacity in pages.
    pub arena_pages: usize,
    /// Key page cache capacity in pages.
    pub key_cache_pages: usize,
    /// Key page lookups served from the cache.
    pub key_cache_hits: u64,
    /// Key page lookups that read the file.
    pub key_cache_misses: u64,
}

impl InspectResult {
    fn new(options: &DbOptions, info: DatabaseInfo, keys: u64) -> Self {
        Self {
            path: options.path.display().to_string(),
            name: options.name.clone(),
            version: info.version,
            hash_table_size: info.hash_table_size,
            key_page_size: info.key_page_size,
            value_page_size: info.value_page_size,
            keys,
            key_file_size: info.key_file_size,
            value_file_size: info.value_file_size,
            total_size: info.key_file_size + info.value_file_size,
            free_key_pages: info.free_key_pages,
            free_value_pages: info.free_value_pages,
            arena_pages: info.arena_capacity,
            key_cache_pages: info.key_cache.capacity,
            key_cache_hits: info.key_cache.hits,
            key_cache_misses: info.key_cache.misses,
        }
    }
}

/// Runs the inspect command.
pub fn run(options: &DbOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = options.open()?;
    let result = InspectResult::new(options, db.info()?, db.len()?);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Database: {} ({})", result.name, result.path);
    println!("Format version:    {}", result.version);
    println!();
    println!("=== Geometry ===");
    println!("Hash table size:   {}", result.hash_table_size);
    println!("Key page size:     {} bytes", result.key_page_size);
    println!("Value page size:   {} bytes", result.value_page_size);
    println!();
    println!("=== Contents ===");
    println!("Keys:              {}", result.keys);
    println!(
        "Key file:          {} bytes ({} free pages)",
        result.key_file_size, result.free_key_pages
    );
    println!(
        "Value file:        {} bytes ({} free pages)",
        result.value_file_size, result.free_value_pages
    );
    println!("Total:             {} bytes", result.total_size);
    println!("Arena capacity:    {} pages", result.arena_pages);
    println!(
        "Key page cache:    {} pages ({} hits, {} misses)",
        result.key_cache_pages, result.key_cache_hits, result.key_cache_misses
    );
}
