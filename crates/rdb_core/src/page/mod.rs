//! On-disk page layouts.
//!
//! Both page files are arrays of fixed-size pages addressed by byte
//! offset. All integers are little-endian.
//!
//! ```text
//! key page (key file)                    value page (value file)
//! ┌────────┬──────────────────────┐      ┌────────┬──────────────────────┐
//! │ 0..2   │ flags                │      │ 0..2   │ flags                │
//! │ 4..8   │ key length           │      │ 4..8   │ payload length       │
//! │ 8..12  │ bucket               │      │ 8..16  │ next overflow page   │
//! │ 12..16 │ total value length   │      │ 16..   │ payload              │
//! │ 16..24 │ value offset         │      └────────┴──────────────────────┘
//! │ 24..32 │ prev key page        │
//! │ 32..40 │ next key page        │
//! │ 40..   │ key bytes            │
//! └────────┴──────────────────────┘
//! ```

mod key;
mod value;

pub use key::{KeyPage, KEY_HEADER_SIZE};
pub use value::{value_page_count, ValuePage, VALUE_HEADER_SIZE};

pub(crate) use key::{
    encode_value_ref as key_value_ref, stored_bucket as key_page_bucket,
    BUCKET_END as KEY_BUCKET_END, FLAGS_OFFSET as KEY_FLAGS_OFFSET,
    NEXT_OFFSET as KEY_NEXT_OFFSET, PREV_OFFSET as KEY_PREV_OFFSET,
    VALUE_REF_OFFSET as KEY_VALUE_REF_OFFSET,
};

/// Link value meaning "no page".
pub const NIL: u64 = u64::MAX;

/// Page holds live data.
pub const FLAG_IN_USE: u16 = 0x0001;

/// Page was released and may be reused.
pub const FLAG_DELETED: u16 = 0x0002;

/// Value page continues a value started on an earlier page.
pub const FLAG_OVERFLOW: u16 = 0x0004;

/// Name used for the key file in diagnostics.
pub const KEY_FILE: &str = "key file";

/// Name used for the value file in diagnostics.
pub const VALUE_FILE: &str = "value file";

/// Reads the flags word at the start of any page.
#[must_use]
pub fn page_flags(buf: &[u8]) -> u16 {
    read_u16(buf, 0)
}

/// Returns true if the flags mark a page that holds live data.
#[must_use]
pub const fn is_live(flags: u16) -> bool {
    flags & FLAG_IN_USE != 0 && flags & FLAG_DELETED == 0
}

pub(crate) fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
