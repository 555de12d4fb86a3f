//! A write-back cache sitting in front of a [`crate::store::RecordStore`]:
//! a bounded-size primary LRU plus an optional second-level cache of weak
//! handles, reaped by a background drainer.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use lru::LruCache;

use crate::error::RecordError;
use crate::store::RecordStore;
use crate::RecordId;

/// How long the background drainer waits between sweeps of the reference
/// cache, and the interval at which it re-checks whether the owning cache
/// has itself been dropped.
const DRAIN_INTERVAL: Duration = Duration::from_secs(10);

/// A strong handle to a cached value. Holding one pins the value in the
/// reference cache; dropping the last handle lets the drainer reclaim it.
pub type CacheHandle<T> = Arc<T>;

/// Converts between a decoded value and its on-disk byte representation.
/// Object serialization *formats* are out of scope; this is the minimal
/// capability the cache needs to write a dirty value through to the lower
/// store.
pub trait RecordCodec<T> {
    fn serialize(&self, value: &T, out: &mut Vec<u8>);
    fn deserialize(&self, bytes: &[u8]) -> Result<T, RecordError>;
}

struct CacheEntry<T> {
    value: Arc<T>,
    dirty: bool,
}

/// The optional second-level cache: a map from recid to a weak handle,
/// holding only values with no dirty data pending write-back, reaped by a
/// background drainer thread.
struct RefCache<T> {
    map: Arc<Mutex<HashMap<RecordId, Weak<T>>>>,
    // Dropped alongside this struct so the drainer's `recv_timeout` wakes
    // with `Disconnected` promptly instead of waiting out a full interval.
    _shutdown: mpsc::Sender<()>,
}

impl<T: Send + Sync + 'static> RefCache<T> {
    fn new() -> Self {
        let map: Arc<Mutex<HashMap<RecordId, Weak<T>>>> = Arc::new(Mutex::new(HashMap::new()));
        let weak_map = Arc::downgrade(&map);
        let (tx, rx) = mpsc::channel::<()>();
        thread::spawn(move || drain_loop(weak_map, rx));
        Self {
            map,
            _shutdown: tx,
        }
    }

    fn put(&self, recid: RecordId, value: Arc<T>) {
        self.map
            .lock()
            .expect("reference cache lock poisoned")
            .insert(recid, Arc::downgrade(&value));
    }

    fn get(&self, recid: RecordId) -> Option<Arc<T>> {
        self.map
            .lock()
            .expect("reference cache lock poisoned")
            .get(&recid)
            .and_then(Weak::upgrade)
    }

    fn remove(&self, recid: RecordId) {
        self.map
            .lock()
            .expect("reference cache lock poisoned")
            .remove(&recid);
    }

    fn clear(&self) {
        self.map.lock().expect("reference cache lock poisoned").clear();
    }

    #[cfg(test)]
    fn sweep_for_test(&self) {
        sweep(&self.map);
    }
}

/// Remove every entry whose value has already been reclaimed.
fn sweep<T>(map: &Mutex<HashMap<RecordId, Weak<T>>>) {
    map.lock()
        .expect("reference cache lock poisoned")
        .retain(|_, weak| weak.upgrade().is_some());
}

/// Background task: periodically reaps reclaimed entries from `weak_map`
/// until either the owning cache is dropped (map no longer upgradable, or
/// the shutdown channel disconnects) or an explicit shutdown signal arrives.
fn drain_loop<T>(weak_map: Weak<Mutex<HashMap<RecordId, Weak<T>>>>, shutdown: mpsc::Receiver<()>) {
    loop {
        match shutdown.recv_timeout(DRAIN_INTERVAL) {
            Ok(()) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }
        let Some(map) = weak_map.upgrade() else {
            return;
        };
        sweep(&map);
    }
}

/// A write-back LRU cache over a lower-level [`RecordStore`].
pub struct RecordCache<T, L, C> {
    lower: L,
    codec: C,
    primary: LruCache<RecordId, CacheEntry<T>>,
    refcache: Option<RefCache<T>>,
}

impl<T, L, C> RecordCache<T, L, C>
where
    T: Send + Sync + 'static,
    L: RecordStore,
    C: RecordCodec<T>,
{
    /// Build a cache with a bounded primary LRU of `max_records` entries and
    /// no second-level reference cache.
    pub fn new(lower: L, codec: C, max_records: usize) -> Self {
        Self {
            lower,
            codec,
            primary: LruCache::new(NonZeroUsize::new(max_records).expect("max_records must be > 0")),
            refcache: None,
        }
    }

    /// Build a cache with both the bounded primary LRU and an optional
    /// second-level reference cache, backed by a background drainer thread.
    pub fn with_reference_cache(lower: L, codec: C, max_records: usize) -> Self {
        Self {
            lower,
            codec,
            primary: LruCache::new(NonZeroUsize::new(max_records).expect("max_records must be > 0")),
            refcache: Some(RefCache::new()),
        }
    }

    fn maybe_auto_commit(&mut self) -> Result<(), RecordError> {
        if self.lower.needs_auto_commit() {
            self.commit()?;
        }
        Ok(())
    }

    /// Write an eviction victim through to the lower store if it was dirty.
    fn flush_entry(&mut self, recid: RecordId, entry: &CacheEntry<T>) -> Result<(), RecordError> {
        if !entry.dirty {
            return Ok(());
        }
        let mut bytes = Vec::new();
        self.codec.serialize(&entry.value, &mut bytes);
        self.lower.update(recid, &bytes, 0, bytes.len())?;
        Ok(())
    }

    /// Insert into the primary LRU, writing back whatever got evicted to
    /// make room (if it was dirty). A same-key replace never counts as an
    /// eviction.
    fn primary_put(&mut self, recid: RecordId, value: Arc<T>, dirty: bool) -> Result<(), RecordError> {
        if let Some((evicted_id, evicted)) = self.primary.push(recid, CacheEntry { value, dirty }) {
            if evicted_id != recid {
                self.flush_entry(evicted_id, &evicted)?;
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, value: T) -> Result<RecordId, RecordError> {
        self.maybe_auto_commit()?;
        let mut bytes = Vec::new();
        self.codec.serialize(&value, &mut bytes);
        let recid = self.lower.insert(&bytes, 0, bytes.len())?;
        let value = Arc::new(value);
        match &self.refcache {
            Some(rc) => rc.put(recid, value),
            None => self.primary_put(recid, value, false)?,
        }
        Ok(recid)
    }

    pub fn fetch(&mut self, recid: RecordId) -> Result<Option<CacheHandle<T>>, RecordError> {
        if let Some(entry) = self.primary.get(&recid) {
            return Ok(Some(Arc::clone(&entry.value)));
        }
        if let Some(rc) = &self.refcache {
            if let Some(value) = rc.get(recid) {
                return Ok(Some(value));
            }
        }
        let mut bytes = Vec::new();
        self.lower.fetch(&mut bytes, recid)?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let value = Arc::new(self.codec.deserialize(&bytes)?);
        match &self.refcache {
            Some(rc) => rc.put(recid, Arc::clone(&value)),
            None => self.primary_put(recid, Arc::clone(&value), false)?,
        }
        Ok(Some(value))
    }

    pub fn update(&mut self, recid: RecordId, value: T) -> Result<(), RecordError> {
        self.maybe_auto_commit()?;
        if let Some(rc) = &self.refcache {
            rc.remove(recid);
        }
        self.primary_put(recid, Arc::new(value), true)
    }

    pub fn delete(&mut self, recid: RecordId) -> Result<(), RecordError> {
        self.maybe_auto_commit()?;
        self.primary.pop(&recid);
        if let Some(rc) = &self.refcache {
            rc.remove(recid);
        }
        self.lower.delete(recid)
    }

    /// Flush every dirty primary entry through to the lower store, then
    /// commit the lower store. After this call no primary entry is dirty.
    pub fn commit(&mut self) -> Result<(), RecordError> {
        let dirty: Vec<RecordId> = self
            .primary
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(recid, _)| *recid)
            .collect();
        for recid in dirty {
            let bytes = {
                let entry = self.primary.peek(&recid).expect("recid just collected from primary");
                let mut bytes = Vec::new();
                self.codec.serialize(&entry.value, &mut bytes);
                bytes
            };
            self.lower.update(recid, &bytes, 0, bytes.len())?;
            if let Some(entry) = self.primary.peek_mut(&recid) {
                entry.dirty = false;
            }
        }
        self.lower.commit()
    }

    /// Roll back the lower store, then discard the primary and reference
    /// caches without writing anything back. If the lower rollback fails,
    /// the caches are left untouched so their dirty state survives for a
    /// retry instead of being discarded along with a rollback that didn't
    /// happen.
    pub fn rollback(&mut self) -> Result<(), RecordError> {
        self.lower.rollback()?;
        self.primary.clear();
        if let Some(rc) = &self.refcache {
            rc.clear();
        }
        Ok(())
    }

    /// Evict every primary entry, writing back dirty ones, without touching
    /// the lower store's transaction state.
    pub fn clear_cache(&mut self) -> Result<(), RecordError> {
        while let Some((recid, entry)) = self.primary.pop_lru() {
            self.flush_entry(recid, &entry)?;
        }
        if let Some(rc) = &self.refcache {
            rc.clear();
        }
        Ok(())
    }

    /// Flush dirty entries and consume the cache, closing the lower store.
    pub fn close(mut self) -> Result<(), RecordError> {
        self.clear_cache()?;
        self.lower.commit()
    }

    pub fn primary_len(&self) -> usize {
        self.primary.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::MemPageStore;
    use crate::prm::PhysicalRowIdManager;

    struct BytesCodec;
    impl RecordCodec<Vec<u8>> for BytesCodec {
        fn serialize(&self, value: &Vec<u8>, out: &mut Vec<u8>) {
            out.extend_from_slice(value);
        }
        fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>, RecordError> {
            Ok(bytes.to_vec())
        }
    }

    fn cache(max_records: usize) -> RecordCache<Vec<u8>, PhysicalRowIdManager<MemPageStore>, BytesCodec> {
        RecordCache::new(PhysicalRowIdManager::new(MemPageStore::new()), BytesCodec, max_records)
    }

    #[test]
    fn insert_then_fetch_hits_primary() {
        let mut c = cache(4);
        let recid = c.insert(vec![1, 2, 3]).unwrap();
        let v = c.fetch(recid).unwrap().unwrap();
        assert_eq!(*v, vec![1, 2, 3]);
        assert_eq!(c.primary_len(), 1);
    }

    #[test]
    fn update_marks_dirty_and_commit_clears_it() {
        let mut c = cache(4);
        let recid = c.insert(vec![0]).unwrap();
        c.update(recid, vec![9, 9]).unwrap();
        c.commit().unwrap();
        let v = c.fetch(recid).unwrap().unwrap();
        assert_eq!(*v, vec![9, 9]);
    }

    #[test]
    fn eviction_writes_back_dirty_entries() {
        let mut c = cache(2);
        let r1 = c.insert(vec![1]).unwrap();
        c.update(r1, vec![1, 1]).unwrap();
        let r2 = c.insert(vec![2]).unwrap();
        let r3 = c.insert(vec![3]).unwrap();
        // r1 was the LRU entry and dirty; inserting r3 should have evicted it
        // and written it through to the lower store.
        assert_eq!(c.primary_len(), 2);
        let mut direct = Vec::new();
        c.lower.fetch(&mut direct, r1).unwrap();
        assert_eq!(direct, vec![1, 1]);
        let _ = r2;
    }

    #[test]
    fn rollback_clears_primary_cache() {
        let mut c = cache(4);
        let recid = c.insert(vec![5]).unwrap();
        c.update(recid, vec![6]).unwrap();
        c.rollback().unwrap();
        assert_eq!(c.primary_len(), 0);
    }

    #[test]
    fn reference_cache_serves_while_handle_is_held() {
        let mut c = RecordCache::with_reference_cache(
            PhysicalRowIdManager::new(MemPageStore::new()),
            BytesCodec,
            1,
        );
        let recid = c.insert(vec![7, 7]).unwrap();
        // insert() with a reference cache enabled stores only a weak handle
        // and returns no strong one, so fetch goes through the lower store
        // once to materialize a handle the test can pin.
        let handle = c.fetch(recid).unwrap().unwrap();
        let second = c.fetch(recid).unwrap().unwrap();
        assert_eq!(*second, vec![7, 7]);
        drop(handle);
        drop(second);
        if let Some(rc) = &c.refcache {
            rc.sweep_for_test();
            assert!(rc.get(recid).is_none());
        }
    }
}
