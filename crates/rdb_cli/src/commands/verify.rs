//! Verify command implementation.

use super::DbOptions;

/// Runs the verify command.
pub fn run(options: &DbOptions) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying {} in {:?}", options.name, options.path);
    println!();

    let db = options.open()?;
    let report = db.verify()?;

    println!("Hash table size:   {}", report.hash_table_size);
    println!("Buckets in use:    {}", report.buckets_used);
    println!("Longest chain:     {}", report.longest_chain);
    println!("Live keys:         {}", report.live_keys);
    println!(
        "Key pages:         {} ({} free)",
        report.key_pages, report.free_key_pages
    );
    println!(
        "Value pages:       {} ({} live, {} free)",
        report.value_pages, report.live_value_pages, report.free_value_pages
    );

    if !report.problems.is_empty() {
        println!();
        println!("Problems:");
        for problem in &report.problems {
            println!("  - {problem}");
        }
    }

    println!();
    if report.is_ok() {
        println!("✓ Database verification passed");
        Ok(())
    } else {
        println!("✗ Database verification failed");
        Err("Verification failed".into())
    }
}
