//! Single-key commands: get, set, del.

use super::DbOptions;
use std::io::Write;

/// Prints the value stored under `key`. An absent key is an error.
pub fn get(options: &DbOptions, key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = options.open()?;
    let value = db
        .get(key.as_bytes())?
        .ok_or_else(|| format!("Key not found: {key}"))?;

    let mut out = std::io::stdout().lock();
    out.write_all(&value)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Stores `value` under `key`.
pub fn set(options: &DbOptions, key: &str, value: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = options.open()?;
    db.set(key.as_bytes(), value.as_bytes())?;
    db.close()?;
    Ok(())
}

/// Removes `key`. Removing an absent key succeeds.
pub fn del(options: &DbOptions, key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = options.open()?;
    if !db.remove(key.as_bytes())? {
        tracing::info!(key, "key was not present");
    }
    db.close()?;
    Ok(())
}
