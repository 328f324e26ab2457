use std::sync::Arc;

use tracing::warn;

use super::{Cord, CordKind, FieldValue, Log};
use crate::document::{Object, WriteMode};
use crate::lock::LockingStore;
use crate::path::StoragePath;
use crate::storage::StorageResult;

/// Buffered cord: changes stay in memory until `commit` or `close`.
pub struct VolatileCord {
    log: Log,
}

impl VolatileCord {
    /// # Errors
    ///
    /// Returns `StorageError` if `path` is a folder or the empty log cannot
    /// be written.
    pub fn open(store: Arc<LockingStore>, path: StoragePath) -> StorageResult<Self> {
        Ok(Self {
            log: Log::open(store, path, WriteMode::Buffered)?,
        })
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.log.is_dirty()
    }
}

impl Cord for VolatileCord {
    fn path(&self) -> &StoragePath {
        self.log.path()
    }

    fn kind(&self) -> CordKind {
        CordKind::Volatile
    }

    fn append(&self, object: Object) -> StorageResult<()> {
        self.log.insert(object, None)
    }

    fn prepend(&self, object: Object) -> StorageResult<()> {
        self.log.insert(object, Some(0))
    }

    fn insert(&self, object: Object, pos: usize) -> StorageResult<()> {
        self.log.insert(object, Some(pos))
    }

    fn get(&self, pos: usize) -> StorageResult<Option<Object>> {
        self.log.get(pos)
    }

    fn get_last(&self) -> StorageResult<Option<Object>> {
        self.log.get_last()
    }

    fn remove(&self, pos: usize) -> StorageResult<Option<Object>> {
        self.log.remove(pos)
    }

    fn remove_last(&self) -> StorageResult<Option<Object>> {
        self.log.remove_last()
    }

    fn get_all_where(&self, key: &str, value: &FieldValue) -> StorageResult<Vec<Object>> {
        self.log.get_all_where(key, value)
    }

    fn remove_all_where(&self, key: &str, value: &FieldValue) -> StorageResult<Vec<Object>> {
        self.log.remove_all_where(key, value)
    }

    fn get_one_where(&self, key: &str, value: &FieldValue) -> StorageResult<Option<Object>> {
        self.log.get_one_where(key, value)
    }

    fn remove_one_where(&self, key: &str, value: &FieldValue) -> StorageResult<Option<Object>> {
        self.log.remove_one_where(key, value)
    }

    fn size(&self) -> StorageResult<usize> {
        self.log.size()
    }

    fn to_snapshot(&self) -> StorageResult<Vec<Object>> {
        self.log.to_snapshot()
    }

    fn commit(&self) -> StorageResult<()> {
        self.log.commit()
    }

    fn close(&self) -> StorageResult<()> {
        self.log.close()
    }
}

impl Drop for VolatileCord {
    fn drop(&mut self) {
        if self.log.is_dirty() {
            warn!(path = %self.log.path(), "volatile cord dropped with uncommitted changes");
        }
    }
}

impl std::fmt::Debug for VolatileCord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolatileCord").field("path", self.log.path()).finish()
    }
}
