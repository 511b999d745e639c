//! Key page encoding.

use super::{is_live, read_u16, read_u32, read_u64, FLAG_DELETED, FLAG_IN_USE, KEY_FILE, NIL};
use crate::error::{CoreError, CoreResult};

/// Bytes before the inline key.
pub const KEY_HEADER_SIZE: usize = 40;

pub(crate) const FLAGS_OFFSET: usize = 0;
const KEY_LEN_OFFSET: usize = 4;
const BUCKET_OFFSET: usize = 8;
/// Total value length (u32) followed by value offset (u64).
pub(crate) const VALUE_REF_OFFSET: usize = 12;
pub(crate) const PREV_OFFSET: usize = 24;
pub(crate) const NEXT_OFFSET: usize = 32;

const KNOWN_FLAGS: u16 = FLAG_IN_USE | FLAG_DELETED;

/// Bytes needed to read the flags and bucket without decoding the page.
pub(crate) const BUCKET_END: usize = BUCKET_OFFSET + 4;

/// Bucket stored in a raw key page header, even one that fails to decode.
pub(crate) fn stored_bucket(header: &[u8]) -> u32 {
    read_u32(header, BUCKET_OFFSET)
}

/// A decoded key page.
///
/// A key page belongs to exactly one bucket chain and points at the head
/// page of its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPage {
    /// Status flags.
    pub flags: u16,
    /// Directory slot this page is chained from.
    pub bucket: u32,
    /// Total length of the value in bytes.
    pub value_len: u32,
    /// Offset of the first value page.
    pub value_offset: u64,
    /// Previous key page in the chain, or [`NIL`] for the chain head.
    pub prev: u64,
    /// Next key page in the chain, or [`NIL`] for the tail.
    pub next: u64,
    /// The key itself.
    pub key: Vec<u8>,
}

impl KeyPage {
    /// Creates a live key page that is not yet linked.
    #[must_use]
    pub fn new(key: &[u8], bucket: u32, value_offset: u64, value_len: u32) -> Self {
        Self {
            flags: FLAG_IN_USE,
            bucket,
            value_len,
            value_offset,
            prev: NIL,
            next: NIL,
            key: key.to_vec(),
        }
    }

    /// Encodes the page into `buf`, which must be one whole key page.
    ///
    /// # Panics
    ///
    /// Panics if the key does not fit in `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        let key_end = KEY_HEADER_SIZE + self.key.len();
        assert!(key_end <= buf.len(), "key does not fit in key page");

        buf[FLAGS_OFFSET..FLAGS_OFFSET + 2].copy_from_slice(&self.flags.to_le_bytes());
        buf[2..4].fill(0);
        buf[KEY_LEN_OFFSET..KEY_LEN_OFFSET + 4]
            .copy_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf[BUCKET_OFFSET..BUCKET_OFFSET + 4].copy_from_slice(&self.bucket.to_le_bytes());
        buf[VALUE_REF_OFFSET..VALUE_REF_OFFSET + 12]
            .copy_from_slice(&encode_value_ref(self.value_offset, self.value_len));
        buf[PREV_OFFSET..PREV_OFFSET + 8].copy_from_slice(&self.prev.to_le_bytes());
        buf[NEXT_OFFSET..NEXT_OFFSET + 8].copy_from_slice(&self.next.to_le_bytes());
        buf[KEY_HEADER_SIZE..key_end].copy_from_slice(&self.key);
        buf[key_end..].fill(0);
    }

    /// Decodes a live key page read from `offset`.
    ///
    /// # Errors
    ///
    /// Returns `CorruptPage` if the page is not live or any field is out of
    /// range for a page of `buf.len()` bytes.
    pub fn decode(buf: &[u8], offset: u64) -> CoreResult<Self> {
        if buf.len() <= KEY_HEADER_SIZE {
            return Err(CoreError::corrupt_page(
                KEY_FILE,
                offset,
                format!("page of {} bytes is too small", buf.len()),
            ));
        }

        let flags = read_u16(buf, FLAGS_OFFSET);
        if flags & !KNOWN_FLAGS != 0 {
            return Err(CoreError::corrupt_page(
                KEY_FILE,
                offset,
                format!("unknown flags {flags:#06x}"),
            ));
        }
        if !is_live(flags) {
            return Err(CoreError::corrupt_page(
                KEY_FILE,
                offset,
                format!("page is not in use (flags {flags:#06x})"),
            ));
        }

        let key_len = read_u32(buf, KEY_LEN_OFFSET) as usize;
        if key_len == 0 || KEY_HEADER_SIZE + key_len > buf.len() {
            return Err(CoreError::corrupt_page(
                KEY_FILE,
                offset,
                format!("key length {key_len} out of range"),
            ));
        }

        let value_offset = read_u64(buf, VALUE_REF_OFFSET + 4);
        if value_offset == NIL {
            return Err(CoreError::corrupt_page(KEY_FILE, offset, "missing value offset"));
        }

        let prev = read_u64(buf, PREV_OFFSET);
        let next = read_u64(buf, NEXT_OFFSET);
        if prev == offset || next == offset {
            return Err(CoreError::corrupt_page(KEY_FILE, offset, "page links to itself"));
        }

        Ok(Self {
            flags,
            bucket: read_u32(buf, BUCKET_OFFSET),
            value_len: read_u32(buf, VALUE_REF_OFFSET),
            value_offset,
            prev,
            next,
            key: buf[KEY_HEADER_SIZE..KEY_HEADER_SIZE + key_len].to_vec(),
        })
    }

    /// Returns true if this page is the head of its chain.
    #[must_use]
    pub fn is_head(&self) -> bool {
        self.prev == NIL
    }
}

/// Encodes the contiguous `value_len`/`value_offset` pair.
pub(crate) fn encode_value_ref(value_offset: u64, value_len: u32) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[..4].copy_from_slice(&value_len.to_le_bytes());
    out[4..].copy_from_slice(&value_offset.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(page: &KeyPage, size: usize) -> Vec<u8> {
        let mut buf = vec![0xAAu8; size];
        page.encode_into(&mut buf);
        buf
    }

    #[test]
    fn encode_decode() {
        let mut page = KeyPage::new(b"alpha", 17, 4096, 300);
        page.prev = 128;
        page.next = NIL;

        let buf = encoded(&page, 128);
        assert!(buf[KEY_HEADER_SIZE + 5..].iter().all(|&b| b == 0));

        let decoded = KeyPage::decode(&buf, 256).unwrap();
        assert_eq!(decoded, page);
        assert!(!decoded.is_head());
    }

    #[test]
    fn field_offsets_are_stable() {
        let page = KeyPage::new(b"k", 3, 0x0102_0304, 9);
        let buf = encoded(&page, 64);

        assert_eq!(read_u16(&buf, FLAGS_OFFSET), FLAG_IN_USE);
        assert_eq!(read_u32(&buf, VALUE_REF_OFFSET), 9);
        assert_eq!(read_u64(&buf, VALUE_REF_OFFSET + 4), 0x0102_0304);
        assert_eq!(read_u64(&buf, PREV_OFFSET), NIL);
        assert_eq!(read_u64(&buf, NEXT_OFFSET), NIL);
        assert_eq!(buf[KEY_HEADER_SIZE], b'k');
    }

    #[test]
    fn deleted_page_is_rejected() {
        let mut page = KeyPage::new(b"gone", 0, 0, 0);
        page.flags = FLAG_IN_USE | FLAG_DELETED;
        let err = KeyPage::decode(&encoded(&page, 64), 0).unwrap_err();
        assert!(err.is_corrupt_page());

        let zeroed = vec![0u8; 64];
        assert!(KeyPage::decode(&zeroed, 64).is_err());
    }

    #[test]
    fn bad_fields_are_rejected() {
        let page = KeyPage::new(b"key", 0, 0, 0);

        let mut buf = encoded(&page, 64);
        buf[0] = 0x80;
        assert!(KeyPage::decode(&buf, 0).is_err());

        let mut buf = encoded(&page, 64);
        buf[KEY_LEN_OFFSET..KEY_LEN_OFFSET + 4].copy_from_slice(&100u32.to_le_bytes());
        assert!(KeyPage::decode(&buf, 0).is_err());

        let mut self_linked = page.clone();
        self_linked.next = 192;
        assert!(KeyPage::decode(&encoded(&self_linked, 64), 192).is_err());
    }

    #[test]
    #[should_panic(expected = "key does not fit")]
    fn oversized_key_panics() {
        let page = KeyPage::new(&[1u8; 30], 0, 0, 0);
        let mut buf = vec![0u8; 64];
        page.encode_into(&mut buf);
    }
}
