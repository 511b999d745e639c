//! Prime sizing for the hash directory.
//!
//! The directory size is rounded up to a prime once, when a database is
//! created or rebuilt, so that the modulo of the key hash spreads keys
//! more evenly than a power-of-two size would.

/// Integer square root, rounded down, by binary search.
#[must_use]
pub fn floor_sqrt(n: u64) -> u64 {
    if n < 2 {
        return n;
    }

    let mut lo = 1u64;
    // sqrt(u64::MAX) < 2^32
    let mut hi = n.min(u64::from(u32::MAX));
    let mut root = 1u64;

    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        match mid.checked_mul(mid) {
            Some(sq) if sq == n => return mid,
            Some(sq) if sq < n => {
                root = mid;
                lo = mid + 1;
            }
            _ => hi = mid - 1,
        }
    }

    root
}

/// Returns true if `n` is prime.
///
/// Trial division by 2, 3 and then by every `6k ± 1` up to `floor_sqrt(n)`.
#[must_use]
pub fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n < 4 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }

    let limit = floor_sqrt(n);
    let mut divisor = 5u64;
    // alternates 2, 4, 2, 4 to visit 5, 7, 11, 13, 17, 19, ...
    let mut step = 2u64;

    while divisor <= limit {
        if n % divisor == 0 {
            return false;
        }
        divisor += step;
        step = 6 - step;
    }

    true
}

/// Returns the smallest prime `p >= n`.
///
/// Candidates above 3 are drawn from the `6k ± 1` sequence only.
///
/// # Example
///
/// ```rust
/// use rdb_core::prime::next_prime;
///
/// assert_eq!(next_prime(12), 13);
/// assert_eq!(next_prime(512), 521);
/// assert_eq!(next_prime(1024), 1031);
/// ```
#[must_use]
pub fn next_prime(n: u64) -> u64 {
    if n <= 2 {
        return 2;
    }
    if n == 3 {
        return 3;
    }

    // First 6k - 1 or 6k + 1 at or above n.
    let mut candidate = match n % 6 {
        0 => n + 1,
        1 | 5 => n,
        r => n + (5 - r),
    };
    let mut step = if candidate % 6 == 5 { 2 } else { 4 };

    while !is_prime(candidate) {
        candidate += step;
        step = 6 - step;
    }

    candidate
}
