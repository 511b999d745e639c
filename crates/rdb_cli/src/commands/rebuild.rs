//! Rebuild command implementation.

use super::DbOptions;

/// Runs the rebuild command.
pub fn run(options: &DbOptions) -> Result<(), Box<dyn std::error::Error>> {
    println!("Rebuilding {} in {:?}", options.name, options.path);

    let db = options.open()?;
    let stats = db.rebuild()?;
    db.close()?;

    println!();
    println!("Records copied:    {}", stats.keys);
    println!("Records skipped:   {}", stats.skipped);
    println!("Records recovered: {}", stats.recovered);
    println!(
        "Hash table size:   {} -> {}",
        stats.old_hash_table_size, stats.hash_table_size
    );
    println!(
        "Page sizes:        key {} / value {}",
        stats.key_page_size, stats.value_page_size
    );
    println!(
        "Key file:          {} -> {} bytes",
        stats.key_file_before, stats.key_file_after
    );
    println!(
        "Value file:        {} -> {} bytes",
        stats.value_file_before, stats.value_file_after
    );

    if stats.skipped > 0 {
        println!();
        println!("! {} damaged records were dropped", stats.skipped);
    }
    if stats.recovered > 0 {
        println!("! {} records were recovered from damaged chains", stats.recovered);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn rebuild_applies_new_table_size() {
        let dir = tempdir().unwrap();
        let mut options = DbOptions::new(dir.path(), "cli");
        options.hash_table_size = Some(11);
        options.memory_usage_percent = Some(2);
        {
            let db = options.open().unwrap();
            db.set(b"a", b"1").unwrap();
            db.set(b"b", b"2").unwrap();
        }

        options.hash_table_size = Some(100);
        run(&options).unwrap();

        let db = options.open().unwrap();
        assert_eq!(db.info().unwrap().hash_table_size, 101);
        assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
    }
}
