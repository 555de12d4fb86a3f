//! Allocates, reads, writes, updates, and frees variable-length byte
//! records across pages, spanning continuation pages as needed and
//! reusing freed slots through the free-space pool.

use crate::backing::{PageCategory, PageManager, PageStore};
use crate::error::RecordError;
use crate::fpm::FreePhysicalRowIdPageManager;
use crate::header::{
    self, read_available_size, read_current_size, read_first, DataPageHeader, RecordHeader,
    DATA_PER_PAGE, HEADER_SIZE, MAX_SIZE_SPACE, O_DATA,
};
use crate::{RecordId, BLOCK_SIZE};

/// The slack threshold below which `allocNew` rounds a slot up to consume
/// all remaining space on a page, rather than leaving an unusably small
/// fragment behind.
const SLACK_THRESHOLD: usize = 16 + HEADER_SIZE;

/// Allocates, reads, writes, updates, and frees variable-length records.
pub struct PhysicalRowIdManager<S> {
    store: S,
    fpm: FreePhysicalRowIdPageManager,
    // Remembered (page, offset) of the first free byte on the current tail
    // page, so repeated appends don't re-walk the page's record chain.
    cursor: Option<(u64, u16)>,
}

impl<S: PageStore + PageManager> PhysicalRowIdManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            fpm: FreePhysicalRowIdPageManager::new(),
            cursor: None,
        }
    }

    pub fn open(store: S, fpm: FreePhysicalRowIdPageManager) -> Self {
        Self {
            store,
            fpm,
            cursor: None,
        }
    }

    /// Allocate a slot of capacity ≥ `length`, write `bytes[start..start+length]`
    /// into it, and return the new record's id.
    pub fn insert(&mut self, bytes: &[u8], start: usize, length: usize) -> Result<RecordId, RecordError> {
        if length < 1 {
            return Err(RecordError::InvalidArgument("length must be >= 1"));
        }
        if start + length > bytes.len() {
            return Err(RecordError::InvalidArgument("start+length exceeds buffer"));
        }
        let recid = self.alloc(length as u32)?;
        self.write(recid, bytes, start, length)?;
        Ok(recid)
    }

    /// Overwrite a record's payload, relocating it if it no longer fits (or
    /// would leave too much slack) in its current slot.
    pub fn update(
        &mut self,
        recid: RecordId,
        bytes: &[u8],
        start: usize,
        length: usize,
    ) -> Result<RecordId, RecordError> {
        if start + length > bytes.len() {
            return Err(RecordError::InvalidArgument("start+length exceeds buffer"));
        }
        let available = {
            let handle = self.store.get(recid.page())?;
            let a = read_available_size(handle.data(), recid.offset() as usize);
            self.store.release(handle)?;
            a
        };
        let length_u32 = length as u32;
        let new_recid = if length_u32 > available || available.saturating_sub(length_u32) > MAX_SIZE_SPACE {
            self.free(recid)?;
            self.alloc(length_u32)?
        } else {
            recid
        };
        self.write(new_recid, bytes, start, length)?;
        Ok(new_recid)
    }

    /// Read `current_size` bytes of the record's payload into `sink`,
    /// leaving `sink` untouched if the record is logically deleted.
    pub fn fetch(&mut self, sink: &mut Vec<u8>, recid: RecordId) -> Result<(), RecordError> {
        let origin = recid.page();
        let offset = recid.offset() as usize;
        let handle = self.store.get(origin)?;
        let current_size = read_current_size(handle.data(), offset) as usize;
        if current_size == 0 {
            self.store.release(handle)?;
            return Ok(());
        }

        let mut remaining = current_size;
        let mut page = origin;
        let mut pos = offset + HEADER_SIZE;
        let mut handle = handle;
        loop {
            let chunk = (BLOCK_SIZE - pos).min(remaining);
            sink.extend_from_slice(&handle.data()[pos..pos + chunk]);
            remaining -= chunk;
            if remaining == 0 {
                self.store.release(handle)?;
                break;
            }
            let next = self.store.get_next(page);
            if next == 0 {
                self.store.release(handle)?;
                return Err(RecordError::Corruption("record truncated: no continuation page"));
            }
            self.store.release(handle)?;
            page = next;
            handle = self.store.get(page)?;
            pos = O_DATA;
        }
        Ok(())
    }

    /// Write `bytes[start..start+length]` into an already-allocated slot,
    /// spilling across the slot's continuation pages exactly as `fetch`
    /// traverses them.
    pub fn write(
        &mut self,
        recid: RecordId,
        bytes: &[u8],
        start: usize,
        length: usize,
    ) -> Result<(), RecordError> {
        let origin = recid.page();
        let offset = recid.offset() as usize;
        let mut handle = self.store.get(origin)?;
        {
            let mut header = RecordHeader::at(handle.data_mut(), offset);
            header.set_current_size(length as u32);
        }
        if length == 0 {
            self.store.release(handle)?;
            return Ok(());
        }

        let mut remaining = length;
        let mut src = start;
        let mut page = origin;
        let mut pos = offset + HEADER_SIZE;
        loop {
            let chunk = (BLOCK_SIZE - pos).min(remaining);
            handle.data_mut()[pos..pos + chunk].copy_from_slice(&bytes[src..src + chunk]);
            remaining -= chunk;
            src += chunk;
            if remaining == 0 {
                self.store.release(handle)?;
                break;
            }
            let next = self.store.get_next(page);
            if next == 0 {
                self.store.release(handle)?;
                return Err(RecordError::Corruption("record truncated: no continuation page"));
            }
            self.store.release(handle)?;
            page = next;
            handle = self.store.get(page)?;
            pos = O_DATA;
        }
        Ok(())
    }

    /// Mark the record logically deleted and return its slot to the free pool.
    pub fn free(&mut self, recid: RecordId) -> Result<(), RecordError> {
        let origin = recid.page();
        let offset = recid.offset() as usize;
        let mut handle = self.store.get(origin)?;
        let available_size = {
            let mut header = RecordHeader::at(handle.data_mut(), offset);
            let available_size = header.available_size();
            header.set_current_size(0);
            available_size
        };
        self.store.release(handle)?;
        self.fpm.put(recid, available_size);
        Ok(())
    }

    /// Alias of [`PhysicalRowIdManager::free`].
    pub fn delete(&mut self, recid: RecordId) -> Result<(), RecordError> {
        self.free(recid)
    }

    /// Persist the free list. Returns the head page of the newly written
    /// free-list chain; callers that want to `FreePhysicalRowIdPageManager::load`
    /// this state back in a later session must record that page themselves
    /// (root-record bookkeeping is out of scope here).
    pub fn commit(&mut self) -> Result<u64, RecordError> {
        self.fpm.commit(&mut self.store)
    }

    /// Discard the allocation cursor cache; the next allocation re-walks the
    /// tail page. Does not revert any page contents.
    pub fn rollback(&mut self) {
        self.cursor = None;
    }

    fn alloc(&mut self, size: u32) -> Result<RecordId, RecordError> {
        let size = header::round_available_size(size);
        let recid = self.fpm.get(size);
        if !recid.is_none() {
            return Ok(recid);
        }
        let start = self.store.get_last(PageCategory::Used);
        self.alloc_new(size, start)
    }

    fn alloc_new(&mut self, mut size: u32, mut start: u64) -> Result<RecordId, RecordError> {
        loop {
            let tail_full = match self.cursor {
                Some((p, o)) => p == start && o as usize == BLOCK_SIZE,
                None => false,
            };
            if start == 0 || tail_full {
                let page = self.store.allocate(PageCategory::Used)?;
                let mut handle = self.store.get(page)?;
                DataPageHeader::new(handle.data_mut()).set_first(O_DATA as u16);
                {
                    let mut header = RecordHeader::at(handle.data_mut(), O_DATA);
                    header.set_available_size(0);
                    header.set_current_size(0);
                }
                self.store.release(handle)?;
                self.cursor = Some((page, O_DATA as u16));
                start = page;
                continue;
            }

            let mut handle = self.store.get(start)?;
            let first = read_first(handle.data()) as usize;
            let cached = matches!(self.cursor, Some((p, _)) if p == start);
            let pos = if cached {
                self.cursor.unwrap().1 as usize
            } else if first == 0 || first + HEADER_SIZE > BLOCK_SIZE {
                self.store.release(handle)?;
                start = 0;
                continue;
            } else {
                let mut pos = first;
                loop {
                    if pos + HEADER_SIZE > BLOCK_SIZE {
                        break;
                    }
                    let avail = read_available_size(handle.data(), pos);
                    if avail == 0 {
                        break;
                    }
                    pos += HEADER_SIZE + avail as usize;
                }
                if pos + HEADER_SIZE > BLOCK_SIZE {
                    self.store.release(handle)?;
                    start = 0;
                    continue;
                }
                pos
            };

            let hdr = pos;
            let free_here = BLOCK_SIZE - pos - HEADER_SIZE;

            if free_here >= size as usize {
                let mut final_size = size;
                if free_here - final_size as usize <= SLACK_THRESHOLD {
                    final_size = free_here as u32;
                }
                {
                    let mut header = RecordHeader::at(handle.data_mut(), hdr);
                    header.set_available_size(final_size);
                    header.set_current_size(0);
                }
                self.store.release(handle)?;
                self.cursor = Some((start, (hdr + HEADER_SIZE + final_size as usize) as u16));
                return Ok(RecordId::from_parts(start, hdr as u16));
            }

            let mut needed_left = size as usize - free_here;
            let last_fragment = needed_left % DATA_PER_PAGE;
            if last_fragment > 0 && DATA_PER_PAGE - last_fragment < SLACK_THRESHOLD {
                size += (DATA_PER_PAGE - last_fragment) as u32;
                size = header::round_available_size(size);
                needed_left = size as usize - free_here;
            }

            {
                let mut header = RecordHeader::at(handle.data_mut(), hdr);
                header.set_available_size(size);
                header.set_current_size(0);
            }
            self.store.release(handle)?;

            while needed_left >= DATA_PER_PAGE {
                let page = self.store.allocate(PageCategory::Used)?;
                let mut handle = self.store.get(page)?;
                DataPageHeader::new(handle.data_mut()).set_first(0);
                self.store.release(handle)?;
                needed_left -= DATA_PER_PAGE;
            }

            if needed_left > 0 {
                let page = self.store.allocate(PageCategory::Used)?;
                let mut handle = self.store.get(page)?;
                DataPageHeader::new(handle.data_mut()).set_first((O_DATA + needed_left) as u16);
                self.store.release(handle)?;
                self.cursor = Some((page, (O_DATA + needed_left) as u16));
            } else {
                self.cursor = None;
            }

            return Ok(RecordId::from_parts(start, hdr as u16));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::MemPageStore;

    fn prm() -> PhysicalRowIdManager<MemPageStore> {
        PhysicalRowIdManager::new(MemPageStore::new())
    }

    #[test]
    fn single_page_insert_fetch_round_trips() {
        let mut p = prm();
        let recid = p.insert(b"hello", 0, 5).unwrap();
        let mut out = Vec::new();
        p.fetch(&mut out, recid).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn multi_page_record_round_trips() {
        let mut p = prm();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let recid = p.insert(&payload, 0, payload.len()).unwrap();
        let mut out = Vec::new();
        p.fetch(&mut out, recid).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn many_small_records_share_a_page_without_overlap() {
        let mut p = prm();
        let mut ids = Vec::new();
        for i in 0..50u8 {
            let buf = vec![i; 10];
            ids.push((p.insert(&buf, 0, buf.len()).unwrap(), buf));
        }
        for (recid, expected) in &ids {
            let mut out = Vec::new();
            p.fetch(&mut out, *recid).unwrap();
            assert_eq!(&out, expected);
        }
    }

    #[test]
    fn update_in_place_when_it_fits() {
        let mut p = prm();
        let recid = p.insert(&vec![1u8; 100], 0, 100).unwrap();
        let recid2 = p.update(recid, &vec![2u8; 120], 0, 120).unwrap();
        assert_eq!(recid, recid2);
        let mut out = Vec::new();
        p.fetch(&mut out, recid2).unwrap();
        assert_eq!(out, vec![2u8; 120]);
    }

    #[test]
    fn update_relocates_when_it_does_not_fit() {
        let mut p = prm();
        let recid = p.insert(&vec![1u8; 100], 0, 100).unwrap();
        let recid2 = p.update(recid, &vec![2u8; 400_000], 0, 400_000).unwrap();
        assert_ne!(recid, recid2);
        let mut out = Vec::new();
        p.fetch(&mut out, recid2).unwrap();
        assert_eq!(out, vec![2u8; 400_000]);
    }

    #[test]
    fn free_then_alloc_same_size_reuses_slot() {
        let mut p = prm();
        let a = p.insert(&vec![1u8; 50], 0, 50).unwrap();
        p.free(a).unwrap();
        let b = p.insert(&vec![2u8; 40], 0, 40).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fetch_after_free_is_empty() {
        let mut p = prm();
        let a = p.insert(b"hello", 0, 5).unwrap();
        p.free(a).unwrap();
        let mut out = Vec::new();
        p.fetch(&mut out, a).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn rollback_invalidates_cursor_without_reverting_pages() {
        let mut p = prm();
        let a = p.insert(b"one", 0, 3).unwrap();
        p.rollback();
        let mut out = Vec::new();
        p.fetch(&mut out, a).unwrap();
        assert_eq!(out, b"one");
    }
}
