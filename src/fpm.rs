//! Free-space pool: a collection of previously freed record slots, bucketed
//! by `available_size`, served best-fit.

use std::collections::{BTreeMap, BTreeSet};

use crate::backing::{PageCategory, PageManager, PageStore};
use crate::error::RecordError;
use crate::header::MAX_SIZE_SPACE;
use crate::RecordId;

/// Number of bytes after a free-list page's header holding the entry count.
const O_COUNT: usize = crate::header::O_DATA;
/// On-disk size of one `(recid, available_size)` entry.
const ENTRY_SIZE: usize = 12;

/// Maintains a pool of freed record ids, keyed for "smallest slot with
/// capacity ≥ N" lookup, and persists that pool through the page manager.
#[derive(Debug)]
pub struct FreePhysicalRowIdPageManager {
    // available_size -> recids with exactly that available_size, lowest
    // recid served first within a bucket.
    buckets: BTreeMap<u32, BTreeSet<u64>>,
}

impl FreePhysicalRowIdPageManager {
    pub fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
        }
    }

    /// Rebuild the in-memory index from whatever was persisted by a prior
    /// `commit`, given the head page of that commit's chain (as returned by
    /// [`FreePhysicalRowIdPageManager::commit`]).
    pub fn load(store: &mut (impl PageStore + PageManager), head: u64) -> Result<Self, RecordError> {
        let max_entries_per_page = (crate::BLOCK_SIZE - O_COUNT - 2) / ENTRY_SIZE;
        let mut fpm = Self::new();
        let mut page = head;
        while page != 0 {
            let handle = store.get(page)?;
            let count = u16::from_le_bytes([handle.data()[O_COUNT], handle.data()[O_COUNT + 1]]) as usize;
            if count > max_entries_per_page {
                store.release(handle)?;
                return Err(RecordError::Corruption("free-list page entry count out of range"));
            }
            let mut off = O_COUNT + 2;
            for _ in 0..count {
                if off + ENTRY_SIZE > crate::BLOCK_SIZE {
                    store.release(handle)?;
                    return Err(RecordError::Corruption("free-list page entry runs past page end"));
                }
                let bytes = &handle.data()[off..off + ENTRY_SIZE];
                let recid = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
                let available_size = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
                fpm.buckets
                    .entry(available_size)
                    .or_default()
                    .insert(recid);
                off += ENTRY_SIZE;
            }
            let next = store.get_next(page);
            store.release(handle)?;
            page = next;
        }
        Ok(fpm)
    }

    /// Return a freed slot with `available_size >= requested_size`, or
    /// `RecordId::NONE` if no such slot exists. Never returns a slot whose
    /// slack exceeds `MAX_SIZE_SPACE`.
    pub fn get(&mut self, requested_size: u32) -> RecordId {
        let Some((&size, recids)) = self.buckets.range_mut(requested_size..).next() else {
            return RecordId::NONE;
        };
        if size - requested_size > MAX_SIZE_SPACE {
            return RecordId::NONE;
        }
        let recid = *recids.iter().next().expect("bucket is never empty");
        recids.remove(&recid);
        if recids.is_empty() {
            self.buckets.remove(&size);
        }
        RecordId::from_raw(recid)
    }

    /// Enroll a freed slot. Caller must not double-free the same recid.
    pub fn put(&mut self, recid: RecordId, available_size: u32) {
        self.buckets
            .entry(available_size)
            .or_default()
            .insert(recid.raw());
    }

    /// Persist the current free list through the page manager as a fresh
    /// chain of `Free`-category pages. Returns the head page of that chain
    /// (0 if the free list was empty); callers must keep that value and pass
    /// it back to [`FreePhysicalRowIdPageManager::load`] to reload this
    /// state, since a page chain only links forward.
    ///
    /// Pages written by a prior `commit` are not reused or reclaimed —
    /// `PageManager` has no page-deallocation operation to return them
    /// through — so each `commit` call abandons its predecessor's chain
    /// rather than replacing it in place.
    pub fn commit(&mut self, store: &mut (impl PageStore + PageManager)) -> Result<u64, RecordError> {
        let entries: Vec<(u64, u32)> = self
            .buckets
            .iter()
            .flat_map(|(&size, recids)| recids.iter().map(move |&r| (r, size)))
            .collect();

        let max_entries_per_page = (crate::BLOCK_SIZE - O_COUNT - 2) / ENTRY_SIZE;
        let mut chunks = entries.chunks(max_entries_per_page).peekable();
        if chunks.peek().is_none() {
            return Ok(0);
        }
        let mut head = 0u64;
        while let Some(chunk) = chunks.next() {
            let page = store.allocate(PageCategory::Free)?;
            if head == 0 {
                head = page;
            }
            let mut handle = store.get(page)?;
            {
                let buf = handle.data_mut();
                buf[O_COUNT] = (chunk.len() as u16).to_le_bytes()[0];
                buf[O_COUNT + 1] = (chunk.len() as u16).to_le_bytes()[1];
                let mut off = O_COUNT + 2;
                for &(recid, size) in chunk {
                    buf[off..off + 8].copy_from_slice(&recid.to_le_bytes());
                    buf[off + 8..off + 12].copy_from_slice(&size.to_le_bytes());
                    off += ENTRY_SIZE;
                }
            }
            store.release(handle)?;
        }
        Ok(head)
    }
}

impl Default for FreePhysicalRowIdPageManager {
    fn default() -> Self {
        Self::new()
    }
}
