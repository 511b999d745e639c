//! Benchmark utilities.

use rand::Rng;

/// Key for index `i`, the same shape an application would use.
pub fn key(i: usize) -> Vec<u8> {
    format!("user:{i:08}").into_bytes()
}

/// Generate random value data of the specified size.
pub fn random_data<R: Rng>(rng: &mut R, size: usize) -> Vec<u8> {
    (0..size).map(|_| rng.gen()).collect()
}
