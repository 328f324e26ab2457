use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use super::{Tray, TrayKind};
use crate::document::{Document, Object, WriteMode};
use crate::lock::LockingStore;
use crate::path::StoragePath;
use crate::storage::StorageResult;

/// Write-through tray for values that do not change once written.
///
/// Keys already held in memory are answered without asking the backend.
/// A removed key is remembered as a tombstone and stays absent for this
/// instance, even if another writer stores it again, until this instance
/// puts it back itself.
pub struct ImmutableTray {
    doc: Document<Object>,
    tombstones: Mutex<BTreeSet<String>>,
}

impl ImmutableTray {
    /// # Errors
    ///
    /// Returns `StorageError` if `path` is a folder or the empty document
    /// cannot be written.
    pub fn open(store: Arc<LockingStore>, path: StoragePath) -> StorageResult<Self> {
        Ok(Self {
            doc: Document::open(store, path, WriteMode::Through)?,
            tombstones: Mutex::new(BTreeSet::new()),
        })
    }

    // Always taken before the document monitor.
    fn tombstones(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.tombstones.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Tray for ImmutableTray {
    fn path(&self) -> &StoragePath {
        self.doc.path()
    }

    fn kind(&self) -> TrayKind {
        TrayKind::Immutable
    }

    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let tombstones = self.tombstones();
        if tombstones.contains(key) {
            return Ok(None);
        }
        let mut state = self.doc.lock();
        if let Some(value) = state.loaded().and_then(|object| object.get(key)) {
            return Ok(Some(value.clone()));
        }
        Ok(self.doc.fresh(&mut state)?.get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> StorageResult<Option<Value>> {
        let mut tombstones = self.tombstones();
        tombstones.remove(key);
        self.doc.modify(|object| Ok((object.insert(key.to_string(), value), true)))
    }

    fn remove(&self, key: &str) -> StorageResult<Option<Value>> {
        let mut tombstones = self.tombstones();
        if !tombstones.insert(key.to_string()) {
            return Ok(None);
        }
        self.doc.modify(|object| {
            let old = object.shift_remove(key);
            let changed = old.is_some();
            Ok((old, changed))
        })
    }

    fn keys(&self) -> StorageResult<BTreeSet<String>> {
        let tombstones = self.tombstones();
        self.doc.read(|object| {
            object
                .keys()
                .filter(|key| !tombstones.contains(*key))
                .cloned()
                .collect()
        })
    }

    fn count(&self) -> StorageResult<usize> {
        Ok(self.keys()?.len())
    }

    fn to_snapshot(&self) -> StorageResult<Object> {
        let tombstones = self.tombstones();
        self.doc.read(|object| {
            object
                .iter()
                .filter(|(key, _)| !tombstones.contains(*key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        })
    }

    fn commit(&self) -> StorageResult<()> {
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        self.doc.close()
    }
}

impl std::fmt::Debug for ImmutableTray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmutableTray")
            .field("path", self.doc.path())
            .field("tombstones", &self.tombstones().len())
            .finish()
    }
}
