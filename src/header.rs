//! Accessors for the two fixed-size structures that live inside a data page:
//! the per-page [`DataPageHeader`] at offset 0, and the per-record
//! [`RecordHeader`] at the start of each slot.
//!
//! Both are POD structs cast directly over the page bytes via `bytemuck`,
//! kept behind field accessors so callers can't forget to go through the
//! cast and poke raw offsets instead.

use bytemuck::{Pod, Zeroable};

/// Size in bytes of the fixed page header occupying `[0, O_DATA)`.
pub const O_DATA: usize = 8;

/// Size in bytes of a [`RecordHeader`].
pub const HEADER_SIZE: usize = 8;

/// Bytes of page payload available after a continuation page's header.
pub const DATA_PER_PAGE: usize = crate::BLOCK_SIZE - O_DATA;

/// Maximum slack allowed between a slot's `available_size` and `current_size`.
pub const MAX_SIZE_SPACE: u32 = 65535;

/// Round up `n` to the next multiple of 32 bytes, the rounding discipline
/// used for every `available_size` ever written to disk.
///
/// Monotonic, idempotent, and never returns less than `n`.
pub fn round_available_size(n: u32) -> u32 {
    const GRANULARITY: u32 = 32;
    n.div_ceil(GRANULARITY) * GRANULARITY
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawDataPageHeader {
    first: u16,
    _reserved: [u8; 6],
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawRecordHeader {
    available_size: u32,
    current_size: u32,
}

/// Read the `first` field (offset of the first record header on the page,
/// or 0 if the page holds only continuation payload) without borrowing
/// mutably.
pub fn read_first(page: &[u8]) -> u16 {
    bytemuck::from_bytes::<RawDataPageHeader>(&page[..O_DATA]).first
}

/// Read a record header's `available_size` field without borrowing mutably.
pub fn read_available_size(page: &[u8], offset: usize) -> u32 {
    bytemuck::from_bytes::<RawRecordHeader>(&page[offset..offset + HEADER_SIZE]).available_size
}

/// Read a record header's `current_size` field without borrowing mutably.
pub fn read_current_size(page: &[u8], offset: usize) -> u32 {
    bytemuck::from_bytes::<RawRecordHeader>(&page[offset..offset + HEADER_SIZE]).current_size
}

/// Mutable view over the 8-byte header at the start of a data page.
///
/// `first` is the byte offset of the first record header on the page, or 0
/// if the page holds only continuation payload.
pub struct DataPageHeader<'a> {
    raw: &'a mut RawDataPageHeader,
}

impl<'a> DataPageHeader<'a> {
    /// Wrap the first [`O_DATA`] bytes of a page buffer.
    pub fn new(page: &'a mut [u8]) -> Self {
        debug_assert!(page.len() >= O_DATA);
        Self {
            raw: bytemuck::from_bytes_mut(&mut page[..O_DATA]),
        }
    }

    pub fn first(&self) -> u16 {
        self.raw.first
    }

    pub fn set_first(&mut self, first: u16) {
        self.raw.first = first;
    }
}

/// Mutable view over the [`HEADER_SIZE`]-byte record header at a slot's
/// origin offset.
pub struct RecordHeader<'a> {
    raw: &'a mut RawRecordHeader,
}

impl<'a> RecordHeader<'a> {
    /// Wrap the `HEADER_SIZE` bytes starting at `offset` within `page`.
    pub fn at(page: &'a mut [u8], offset: usize) -> Self {
        debug_assert!(offset + HEADER_SIZE <= page.len());
        Self {
            raw: bytemuck::from_bytes_mut(&mut page[offset..offset + HEADER_SIZE]),
        }
    }

    pub fn available_size(&self) -> u32 {
        self.raw.available_size
    }

    pub fn set_available_size(&mut self, size: u32) {
        self.raw.available_size = size;
    }

    pub fn current_size(&self) -> u32 {
        self.raw.current_size
    }

    pub fn set_current_size(&mut self, size: u32) {
        self.raw.current_size = size;
    }

    /// A header with `current_size == 0` denotes a logically free slot.
    pub fn is_free(&self) -> bool {
        self.current_size() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_available_size_is_monotonic_and_idempotent() {
        let mut prev = 0;
        for n in 0..300u32 {
            let r = round_available_size(n);
            assert!(r >= n);
            assert!(r >= prev);
            assert_eq!(round_available_size(r), r);
            prev = r;
        }
    }

    #[test]
    fn record_header_round_trips() {
        let mut page = [0u8; 64];
        {
            let mut h = RecordHeader::at(&mut page, 16);
            h.set_available_size(128);
            h.set_current_size(100);
        }
        let h = RecordHeader::at(&mut page, 16);
        assert_eq!(h.available_size(), 128);
        assert_eq!(h.current_size(), 100);
        assert!(!h.is_free());
    }

    #[test]
    fn data_page_header_round_trips() {
        let mut page = [0u8; O_DATA];
        {
            let mut h = DataPageHeader::new(&mut page);
            h.set_first(O_DATA as u16);
        }
        assert_eq!(DataPageHeader::new(&mut page).first(), O_DATA as u16);
    }
}
