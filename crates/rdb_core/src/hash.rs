//! Key hashing.

/// sdbm string hash over the key bytes.
#[must_use]
pub fn sdbm(key: &[u8]) -> u64 {
    key.iter().fold(0u64, |h, &b| {
        u64::from(b)
            .wrapping_add(h << 6)
            .wrapping_add(h << 16)
            .wrapping_sub(h)
    })
}

/// Directory slot for `key` in a directory of `slots` entries.
///
/// # Panics
///
/// Panics if `slots` is zero.
#[must_use]
pub fn bucket_of(key: &[u8], slots: u32) -> u32 {
    (sdbm(key) % u64::from(slots)) as u32
}
