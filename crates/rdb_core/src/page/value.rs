//! Value page encoding.
//!
//! A value that does not fit in one page continues on overflow pages
//! linked through `next`. Every page except the last one is full.

use super::{read_u16, read_u32, read_u64, FLAG_DELETED, FLAG_IN_USE, FLAG_OVERFLOW, NIL, VALUE_FILE};
use crate::error::{CoreError, CoreResult};

/// Bytes before the payload.
pub const VALUE_HEADER_SIZE: usize = 16;

const LEN_OFFSET: usize = 4;
const NEXT_OFFSET: usize = 8;

const KNOWN_FLAGS: u16 = FLAG_IN_USE | FLAG_DELETED | FLAG_OVERFLOW;

/// Number of pages of `page_size` bytes needed to hold `len` value bytes.
///
/// An empty value still takes one page.
#[must_use]
pub fn value_page_count(len: usize, page_size: usize) -> usize {
    let capacity = page_size - VALUE_HEADER_SIZE;
    len.div_ceil(capacity).max(1)
}

/// A decoded value page header plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuePage {
    /// Status flags.
    pub flags: u16,
    /// Next overflow page, or [`NIL`].
    pub next: u64,
    /// Payload bytes stored in this page.
    pub payload: Vec<u8>,
}

impl ValuePage {
    /// Encodes one page of a value chain into `buf`.
    ///
    /// `overflow` marks continuation pages; `next` links to the following
    /// page or is [`NIL`].
    ///
    /// # Panics
    ///
    /// Panics if `payload` does not fit in `buf`.
    pub fn encode_into(buf: &mut [u8], payload: &[u8], next: u64, overflow: bool) {
        let end = VALUE_HEADER_SIZE + payload.len();
        assert!(end <= buf.len(), "payload does not fit in value page");

        let flags = if overflow {
            FLAG_IN_USE | FLAG_OVERFLOW
        } else {
            FLAG_IN_USE
        };

        buf[0..2].copy_from_slice(&flags.to_le_bytes());
        buf[2..4].fill(0);
        buf[LEN_OFFSET..LEN_OFFSET + 4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        buf[NEXT_OFFSET..NEXT_OFFSET + 8].copy_from_slice(&next.to_le_bytes());
        buf[VALUE_HEADER_SIZE..end].copy_from_slice(payload);
        buf[end..].fill(0);
    }

    /// Decodes a live value page read from `offset`.
    ///
    /// # Errors
    ///
    /// Returns `CorruptPage` if the page is free, carries unknown flags,
    /// claims more payload than fits, or is a partially filled page with
    /// a successor.
    pub fn decode(buf: &[u8], offset: u64) -> CoreResult<Self> {
        let flags = read_u16(buf, 0);
        if flags & !KNOWN_FLAGS != 0 {
            return Err(CoreError::corrupt_page(
                VALUE_FILE,
                offset,
                format!("unknown flags {flags:#06x}"),
            ));
        }
        if flags & FLAG_IN_USE == 0 || flags & FLAG_DELETED != 0 {
            return Err(CoreError::corrupt_page(
                VALUE_FILE,
                offset,
                format!("page is not in use (flags {flags:#06x})"),
            ));
        }

        let capacity = buf.len() - VALUE_HEADER_SIZE;
        let len = read_u32(buf, LEN_OFFSET) as usize;
        if len > capacity {
            return Err(CoreError::corrupt_page(
                VALUE_FILE,
                offset,
                format!("payload length {len} exceeds capacity {capacity}"),
            ));
        }

        let next = read_u64(buf, NEXT_OFFSET);
        if next != NIL && len != capacity {
            return Err(CoreError::corrupt_page(
                VALUE_FILE,
                offset,
                "partially filled page has a successor",
            ));
        }
        if next == offset {
            return Err(CoreError::corrupt_page(VALUE_FILE, offset, "page links to itself"));
        }

        Ok(Self {
            flags,
            next,
            payload: buf[VALUE_HEADER_SIZE..VALUE_HEADER_SIZE + len].to_vec(),
        })
    }

    /// Returns true if this page continues an earlier page.
    #[must_use]
    pub fn is_overflow(&self) -> bool {
        self.flags & FLAG_OVERFLOW != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_count() {
        assert_eq!(value_page_count(0, 64), 1);
        assert_eq!(value_page_count(48, 64), 1);
        assert_eq!(value_page_count(49, 64), 2);
        assert_eq!(value_page_count(96, 64), 2);
        assert_eq!(value_page_count(97, 64), 3);
    }

    #[test]
    fn encode_decode() {
        let mut buf = vec![0xFFu8; 64];
        ValuePage::encode_into(&mut buf, b"payload", NIL, false);

        let page = ValuePage::decode(&buf, 0).unwrap();
        assert_eq!(page.payload, b"payload");
        assert_eq!(page.next, NIL);
        assert!(!page.is_overflow());
        assert!(buf[VALUE_HEADER_SIZE + 7..].iter().all(|&b| b == 0));
    }

    #[test]
    fn overflow_page_must_be_full_to_link() {
        let mut buf = vec![0u8; 64];
        ValuePage::encode_into(&mut buf, &[7u8; 48], 128, true);
        let page = ValuePage::decode(&buf, 64).unwrap();
        assert!(page.is_overflow());
        assert_eq!(page.next, 128);

        ValuePage::encode_into(&mut buf, &[7u8; 47], 128, false);
        assert!(ValuePage::decode(&buf, 64).is_err());
    }

    #[test]
    fn free_or_garbled_page_is_rejected() {
        let zeroed = vec![0u8; 64];
        assert!(ValuePage::decode(&zeroed, 0).unwrap_err().is_corrupt_page());

        let mut buf = vec![0u8; 64];
        ValuePage::encode_into(&mut buf, b"x", NIL, false);
        buf[LEN_OFFSET..LEN_OFFSET + 4].copy_from_slice(&1000u32.to_le_bytes());
        assert!(ValuePage::decode(&buf, 0).is_err());
    }
}
