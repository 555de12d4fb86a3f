//! The facade a [`crate::cache::RecordCache`] sits in front of: the minimal
//! operation set a lower-level record store must expose.

use crate::error::RecordError;
use crate::RecordId;

/// A record store: something that can insert, fetch, update, delete, commit,
/// and roll back byte records addressed by [`RecordId`].
pub trait RecordStore {
    fn insert(&mut self, bytes: &[u8], start: usize, length: usize) -> Result<RecordId, RecordError>;

    fn fetch(&mut self, sink: &mut Vec<u8>, recid: RecordId) -> Result<(), RecordError>;

    fn update(
        &mut self,
        recid: RecordId,
        bytes: &[u8],
        start: usize,
        length: usize,
    ) -> Result<RecordId, RecordError>;

    fn delete(&mut self, recid: RecordId) -> Result<(), RecordError>;

    fn commit(&mut self) -> Result<(), RecordError>;

    fn rollback(&mut self) -> Result<(), RecordError>;

    /// Whether the cache should flush dirty entries before its next mutation.
    /// The physical store never requires this; it exists so other `RecordStore`
    /// implementations (e.g. one sitting on a size-bounded log) can ask for it.
    fn needs_auto_commit(&self) -> bool {
        false
    }
}

impl<S: crate::backing::PageStore + crate::backing::PageManager> RecordStore
    for crate::prm::PhysicalRowIdManager<S>
{
    fn insert(&mut self, bytes: &[u8], start: usize, length: usize) -> Result<RecordId, RecordError> {
        self.insert(bytes, start, length)
    }

    fn fetch(&mut self, sink: &mut Vec<u8>, recid: RecordId) -> Result<(), RecordError> {
        self.fetch(sink, recid)
    }

    fn update(
        &mut self,
        recid: RecordId,
        bytes: &[u8],
        start: usize,
        length: usize,
    ) -> Result<RecordId, RecordError> {
        self.update(recid, bytes, start, length)
    }

    fn delete(&mut self, recid: RecordId) -> Result<(), RecordError> {
        self.delete(recid)
    }

    fn commit(&mut self) -> Result<(), RecordError> {
        self.commit().map(|_head| ())
    }

    fn rollback(&mut self) -> Result<(), RecordError> {
        self.rollback();
        Ok(())
    }
}
