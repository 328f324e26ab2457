use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use super::{Tray, TrayKind};
use crate::document::{Document, Object, WriteMode};
use crate::lock::LockingStore;
use crate::path::StoragePath;
use crate::storage::StorageResult;

/// Buffered tray: changes stay in memory until `commit` or `close`.
///
/// Dropping a tray with uncommitted changes loses them; a warning is logged.
pub struct VolatileTray {
    doc: Document<Object>,
}

impl VolatileTray {
    /// # Errors
    ///
    /// Returns `StorageError` if `path` is a folder or the empty document
    /// cannot be written.
    pub fn open(store: Arc<LockingStore>, path: StoragePath) -> StorageResult<Self> {
        Ok(Self {
            doc: Document::open(store, path, WriteMode::Buffered)?,
        })
    }

    /// True if there are changes not yet committed.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.doc.is_dirty()
    }
}

impl Tray for VolatileTray {
    fn path(&self) -> &StoragePath {
        self.doc.path()
    }

    fn kind(&self) -> TrayKind {
        TrayKind::Volatile
    }

    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        self.doc.read(|object| object.get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> StorageResult<Option<Value>> {
        self.doc.modify(|object| Ok((object.insert(key.to_string(), value), true)))
    }

    fn remove(&self, key: &str) -> StorageResult<Option<Value>> {
        self.doc.modify(|object| {
            let old = object.shift_remove(key);
            let changed = old.is_some();
            Ok((old, changed))
        })
    }

    fn keys(&self) -> StorageResult<BTreeSet<String>> {
        self.doc.read(|object| object.keys().cloned().collect())
    }

    fn count(&self) -> StorageResult<usize> {
        self.doc.read(Object::len)
    }

    fn to_snapshot(&self) -> StorageResult<Object> {
        self.doc.read(Object::clone)
    }

    fn commit(&self) -> StorageResult<()> {
        self.doc.commit()
    }

    fn close(&self) -> StorageResult<()> {
        self.doc.close()
    }
}

impl Drop for VolatileTray {
    fn drop(&mut self) {
        if self.doc.is_dirty() {
            warn!(path = %self.doc.path(), "volatile tray dropped with uncommitted changes");
        }
    }
}

impl std::fmt::Debug for VolatileTray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolatileTray").field("path", self.doc.path()).finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tray::tests::{locking, path, stored};

    #[test]
    fn changes_reach_backend_only_on_commit() {
        let store = locking();
        let tray = VolatileTray::open(Arc::clone(&store), path()).unwrap();
        tray.put("name", json!("Ada")).unwrap();

        assert!(tray.is_dirty());
        assert!(stored(&store, &path()).is_empty());

        tray.commit().unwrap();
        assert!(!tray.is_dirty());
        assert_eq!(stored(&store, &path())["name"], json!("Ada"));
    }

    #[test]
    fn close_flushes() {
        let store = locking();
        let tray = VolatileTray::open(Arc::clone(&store), path()).unwrap();
        tray.put("a", json!(1)).unwrap();
        tray.close().unwrap();

        assert_eq!(stored(&store, &path())["a"], json!(1));
    }

    #[test]
    fn drop_without_commit_loses_changes() {
        let store = locking();
        {
            let tray = VolatileTray::open(Arc::clone(&store), path()).unwrap();
            tray.put("a", json!(1)).unwrap();
        }
        let reopened = VolatileTray::open(Arc::clone(&store), path()).unwrap();
        assert_eq!(reopened.get("a").unwrap(), None);
    }

    #[test]
    fn remove_keeps_remaining_order() {
        let store = locking();
        let tray = VolatileTray::open(Arc::clone(&store), path()).unwrap();
        for key in ["a", "b", "c", "d"] {
            tray.put(key, json!(true)).unwrap();
        }
        tray.remove("b").unwrap();
        tray.commit().unwrap();

        let keys: Vec<String> = stored(&store, &path()).keys().cloned().collect();
        assert_eq!(keys, ["a", "c", "d"]);
    }

    #[test]
    fn clean_commit_does_not_write() {
        let store = locking();
        let tray = VolatileTray::open(Arc::clone(&store), path()).unwrap();
        tray.remove("missing").unwrap();

        assert!(!tray.is_dirty());
        tray.commit().unwrap();
    }
}
