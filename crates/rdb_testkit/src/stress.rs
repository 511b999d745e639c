//! Stress tests for RDB.
//!
//! These helpers drive a database from several threads. Each thread owns
//! a disjoint key range, so the final contents are predictable without
//! coordinating the threads.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rdb_core::Database;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Distinct keys per thread.
    pub keys_per_thread: usize,
    /// Largest value in bytes.
    pub max_value_len: usize,
    /// Seed for the per-thread generators.
    pub seed: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 2_000,
            threads: 4,
            keys_per_thread: 64,
            max_value_len: 200,
            seed: 0x5eed,
        }
    }
}

/// Key `index` of thread `thread`.
pub fn thread_key(thread: usize, index: usize) -> Vec<u8> {
    format!("t{thread}-{index}").into_bytes()
}

/// Runs random set/get/remove operations from `config.threads` threads and
/// returns the throughput plus the contents each thread expects to remain.
///
/// A `get` that disagrees with the thread's own model counts as a failed
/// operation.
pub fn stress_concurrent_mixed(
    db: &Database,
    config: &StressConfig,
) -> (StressTestResult, HashMap<Vec<u8>, Vec<u8>>) {
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();

    let models: Vec<HashMap<Vec<u8>, Vec<u8>>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..config.threads)
            .map(|thread| {
                let successful = &successful;
                let failed = &failed;
                scope.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(config.seed + thread as u64);
                    let mut model = HashMap::new();

                    for _ in 0..config.operations {
                        let key = thread_key(thread, rng.gen_range(0..config.keys_per_thread));
                        let ok = match rng.gen_range(0..10) {
                            0..=4 => {
                                let len = rng.gen_range(0..=config.max_value_len);
                                let value: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                                let ok = db.set(&key, &value).is_ok();
                                if ok {
                                    model.insert(key, value);
                                }
                                ok
                            }
                            5..=7 => match db.get(&key) {
                                Ok(actual) => actual.as_ref() == model.get(&key),
                                Err(_) => false,
                            },
                            _ => match db.remove(&key) {
                                Ok(removed) => removed == model.remove(&key).is_some(),
                                Err(_) => false,
                            },
                        };

                        if ok {
                            successful.fetch_add(1, Ordering::Relaxed);
                        } else {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    model
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().expect("stress thread panicked"))
            .collect()
    });

    let result = StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    );
    let expected = models.into_iter().flatten().collect();
    (result, expected)
}

/// Overwrites one key with values of alternating sizes, which moves it
/// between in-place updates and fresh value chains.
pub fn stress_overwrite_churn(db: &Database, key: &[u8], rounds: usize) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for round in 0..rounds {
        let len = if round % 2 == 0 { 10 } else { 250 };
        let value = vec![(round % 256) as u8; len];
        match db.set(key, &value) {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}
