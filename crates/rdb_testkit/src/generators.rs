//! Property-based test generators using proptest.
//!
//! Keys are kept short enough for 64-byte key pages.

use proptest::prelude::*;

/// Longest key the generators produce.
pub const MAX_TEST_KEY_LEN: usize = 16;

/// One database operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// `set(key, value)`
    Set(Vec<u8>, Vec<u8>),
    /// `get(key)`
    Get(Vec<u8>),
    /// `remove(key)`
    Remove(Vec<u8>),
    /// `update(key, value)`: replaces the value, appending to it if present.
    Append(Vec<u8>, Vec<u8>),
}

impl Op {
    /// The key the operation touches.
    pub fn key(&self) -> &[u8] {
        match self {
            Op::Set(key, _) | Op::Get(key) | Op::Remove(key) | Op::Append(key, _) => key,
        }
    }
}

/// Strategy for generating valid keys (non-empty, short).
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..=MAX_TEST_KEY_LEN)
}

/// Strategy for keys from a small alphabet, so sequences revisit them.
pub fn hot_key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::string::string_regex("[a-e]{1,3}")
        .expect("Invalid regex")
        .prop_map(String::into_bytes)
}

/// Strategy for values, including empty and multi-page ones.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        3 => prop::collection::vec(any::<u8>(), 0..32),
        2 => prop::collection::vec(any::<u8>(), 32..300),
        1 => Just(Vec::new()),
    ]
}

/// Strategy for a single operation over hot keys.
pub fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (hot_key_strategy(), value_strategy()).prop_map(|(k, v)| Op::Set(k, v)),
        2 => hot_key_strategy().prop_map(Op::Get),
        2 => hot_key_strategy().prop_map(Op::Remove),
        1 => (hot_key_strategy(), prop::collection::vec(any::<u8>(), 0..40))
            .prop_map(|(k, v)| Op::Append(k, v)),
    ]
}

/// Strategy for a sequence of operations.
pub fn op_sequence_strategy(len: std::ops::Range<usize>) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), len)
}
