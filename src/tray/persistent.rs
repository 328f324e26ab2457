use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use super::{Tray, TrayKind};
use crate::document::{Document, Object, WriteMode};
use crate::lock::LockingStore;
use crate::path::StoragePath;
use crate::storage::StorageResult;

/// Write-through tray: every change is stored before the call returns.
pub struct PersistentTray {
    doc: Document<Object>,
}

impl PersistentTray {
    /// # Errors
    ///
    /// Returns `StorageError` if `path` is a folder or the empty document
    /// cannot be written.
    pub fn open(store: Arc<LockingStore>, path: StoragePath) -> StorageResult<Self> {
        Ok(Self {
            doc: Document::open(store, path, WriteMode::Through)?,
        })
    }
}

impl Tray for PersistentTray {
    fn path(&self) -> &StoragePath {
        self.doc.path()
    }

    fn kind(&self) -> TrayKind {
        TrayKind::Persistent
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
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        self.doc.close()
    }
}

impl std::fmt::Debug for PersistentTray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentTray").field("path", self.doc.path()).finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::storage::ObjectStore;
    use crate::tray::tests::{locking, path, stored};

    #[test]
    fn put_is_visible_in_backend_immediately() {
        let store = locking();
        let tray = PersistentTray::open(Arc::clone(&store), path()).unwrap();
        tray.put("name", json!("Ada")).unwrap();

        assert_eq!(stored(&store, &path())["name"], json!("Ada"));
    }

    #[test]
    fn put_returns_previous_value() {
        let tray = PersistentTray::open(locking(), path()).unwrap();
        assert_eq!(tray.put("n", json!(1)).unwrap(), None);
        assert_eq!(tray.put("n", json!(2)).unwrap(), Some(json!(1)));
        assert_eq!(tray.get("n").unwrap(), Some(json!(2)));
    }

    #[test]
    fn removing_absent_key_does_not_write() {
        let store = locking();
        let tray = PersistentTray::open(Arc::clone(&store), path()).unwrap();
        let before = store.store().last_modified(&path()).unwrap();

        assert_eq!(tray.remove("missing").unwrap(), None);
        assert_eq!(store.store().last_modified(&path()).unwrap(), before);
    }

    #[test]
    fn keeps_insertion_order_on_disk() {
        let store = locking();
        let tray = PersistentTray::open(Arc::clone(&store), path()).unwrap();
        tray.put("zeta", json!(1)).unwrap();
        tray.put("alpha", json!(2)).unwrap();

        let text = String::from_utf8(store.store().read_all(&path()).unwrap()).unwrap();
        assert_eq!(text, "{\n\"zeta\":1,\n\"alpha\":2\n}");
    }

    #[test]
    fn remove_keeps_remaining_order() {
        let store = locking();
        let tray = PersistentTray::open(Arc::clone(&store), path()).unwrap();
        for (i, key) in ["a", "b", "c", "d"].into_iter().enumerate() {
            tray.put(key, json!(i)).unwrap();
        }
        tray.remove("a").unwrap();

        let keys: Vec<String> = tray.to_snapshot().unwrap().keys().cloned().collect();
        assert_eq!(keys, ["b", "c", "d"]);
        let text = String::from_utf8(store.store().read_all(&path()).unwrap()).unwrap();
        assert_eq!(text, "{\n\"b\":1,\n\"c\":2,\n\"d\":3\n}");
    }

    #[test]
    fn snapshot_is_detached() {
        let tray = PersistentTray::open(locking(), path()).unwrap();
        tray.put("plan", json!({"tier": "free"})).unwrap();

        let mut snapshot = tray.to_snapshot().unwrap();
        snapshot.insert("plan".into(), json!("changed"));

        assert_eq!(tray.get("plan").unwrap(), Some(json!({"tier": "free"})));
    }

    #[test]
    fn close_then_reload() {
        let store = locking();
        let tray = PersistentTray::open(Arc::clone(&store), path()).unwrap();
        tray.put("a", json!(1)).unwrap();
        tray.close().unwrap();

        assert_eq!(tray.keys().unwrap().into_iter().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(tray.count().unwrap(), 1);
        assert!(!tray.is_empty().unwrap());
    }

    #[test]
    fn malformed_backing_object_is_parse_error() {
        let store = locking();
        let tray = PersistentTray::open(Arc::clone(&store), path()).unwrap();
        store.store().write(&path(), b"{\"broken\":").unwrap();

        assert!(matches!(
            tray.get("broken"),
            Err(crate::storage::StorageError::ParseError(_))
        ));
    }
}
