//! Per-path sharing of trays and cords within one process.
//!
//! Two instances on the same path only exclude each other through the
//! sentinel protocol and do not see each other's buffered changes.
//! [`Documents`] hands out one instance per path for as long as anybody
//! holds it, so callers resolving the same path share one monitor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use crate::cord::{self, Cord, CordKind};
use crate::lock::LockingStore;
use crate::path::StoragePath;
use crate::storage::{StorageError, StorageResult};
use crate::tray::{self, Tray, TrayKind};

enum Entry {
    Tray(TrayKind, Weak<dyn Tray>),
    Cord(CordKind, Weak<dyn Cord>),
}

impl Entry {
    fn is_live(&self) -> bool {
        match self {
            Self::Tray(_, weak) => weak.strong_count() > 0,
            Self::Cord(_, weak) => weak.strong_count() > 0,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Tray(kind, _) => tray_label(*kind),
            Self::Cord(kind, _) => cord_label(*kind),
        }
    }
}

fn tray_label(kind: TrayKind) -> &'static str {
    match kind {
        TrayKind::Persistent => "persistent tray",
        TrayKind::Volatile => "volatile tray",
        TrayKind::Immutable => "immutable tray",
    }
}

fn cord_label(kind: CordKind) -> &'static str {
    match kind {
        CordKind::Persistent => "persistent cord",
        CordKind::Volatile => "volatile cord",
    }
}

// Entries are pruned before lookup, so a matching entry is live.
fn find_tray(
    entries: &HashMap<StoragePath, Entry>,
    path: &StoragePath,
    kind: TrayKind,
) -> StorageResult<Option<Arc<dyn Tray>>> {
    match entries.get(path) {
        Some(Entry::Tray(open, weak)) if *open == kind => Ok(weak.upgrade()),
        Some(entry) => Err(conflict(path, entry, tray_label(kind))),
        None => Ok(None),
    }
}

fn find_cord(
    entries: &HashMap<StoragePath, Entry>,
    path: &StoragePath,
    kind: CordKind,
) -> StorageResult<Option<Arc<dyn Cord>>> {
    match entries.get(path) {
        Some(Entry::Cord(open, weak)) if *open == kind => Ok(weak.upgrade()),
        Some(entry) => Err(conflict(path, entry, cord_label(kind))),
        None => Ok(None),
    }
}

fn conflict(path: &StoragePath, entry: &Entry, requested: &'static str) -> StorageError {
    StorageError::KindConflict {
        path: path.to_string(),
        open: entry.label(),
        requested,
    }
}

/// Registry of open trays and cords over one store.
pub struct Documents {
    store: Arc<LockingStore>,
    open: Mutex<HashMap<StoragePath, Entry>>,
}

impl Documents {
    pub fn new(store: Arc<LockingStore>) -> Self {
        Self {
            store,
            open: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<LockingStore> {
        &self.store
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<StoragePath, Entry>> {
        let mut entries = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, entry| entry.is_live());
        entries
    }

    /// The tray at `path`, shared with every other live caller of this registry.
    ///
    /// The registry is not locked while the tray is opened, so a slow or
    /// contended path does not hold up callers resolving other paths. If two
    /// callers race to open the same path, the first to register wins and
    /// the other instance is dropped.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::KindConflict` if `path` is open as something
    /// else, or the error of opening the tray.
    pub fn tray(&self, path: &StoragePath, kind: TrayKind) -> StorageResult<Arc<dyn Tray>> {
        let found = find_tray(&self.entries(), path, kind)?;
        if let Some(tray) = found {
            return Ok(tray);
        }
        let opened = tray::open_tray(Arc::clone(&self.store), path.clone(), kind)?;

        let mut entries = self.entries();
        if let Some(tray) = find_tray(&entries, path, kind)? {
            return Ok(tray);
        }
        debug!(path = %path, kind = %kind, "tray opened");
        entries.insert(path.clone(), Entry::Tray(kind, Arc::downgrade(&opened)));
        Ok(opened)
    }

    /// The cord at `path`, shared with every other live caller of this registry.
    ///
    /// Opened outside the registry lock, like [`tray`](Self::tray).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::KindConflict` if `path` is open as something
    /// else, or the error of opening the cord.
    pub fn cord(&self, path: &StoragePath, kind: CordKind) -> StorageResult<Arc<dyn Cord>> {
        let found = find_cord(&self.entries(), path, kind)?;
        if let Some(cord) = found {
            return Ok(cord);
        }
        let opened = cord::open_cord(Arc::clone(&self.store), path.clone(), kind)?;

        let mut entries = self.entries();
        if let Some(cord) = find_cord(&entries, path, kind)? {
            return Ok(cord);
        }
        debug!(path = %path, kind = %kind, "cord opened");
        entries.insert(path.clone(), Entry::Cord(kind, Arc::downgrade(&opened)));
        Ok(opened)
    }

    /// Number of paths with a live instance.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.entries().len()
    }
}

impl std::fmt::Debug for Documents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Documents")
            .field("open", &self.open_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::thread;
    use std::time::{Duration, SystemTime};

    use serde_json::json;

    use super::*;
    use crate::lock::LockIdentity;
    use crate::storage::memory::MemoryStore;
    use crate::storage::{ObjectMeta, ObjectStore};
    use crate::tray::tests::locking;

    /// Memory store that stalls the first lock acquisition on one path
    /// until released.
    struct StallingStore {
        inner: MemoryStore,
        stalled: StoragePath,
        stalling: AtomicBool,
        entered: Sender<()>,
        release: Mutex<Receiver<()>>,
    }

    impl ObjectStore for StallingStore {
        fn make_container(&self, container: &str) -> StorageResult<()> {
            self.inner.make_container(container)
        }
        fn container_exists(&self, container: &str) -> StorageResult<bool> {
            self.inner.container_exists(container)
        }
        fn list_containers(&self) -> StorageResult<Vec<String>> {
            self.inner.list_containers()
        }
        fn container_created(&self, container: &str) -> StorageResult<SystemTime> {
            self.inner.container_created(container)
        }
        fn remove_container(&self, container: &str) -> StorageResult<()> {
            self.inner.remove_container(container)
        }
        fn write(&self, path: &StoragePath, data: &[u8]) -> StorageResult<()> {
            self.inner.write(path, data)
        }
        fn write_from(&self, path: &StoragePath, reader: &mut dyn Read, len: Option<u64>) -> StorageResult<u64> {
            self.inner.write_from(path, reader, len)
        }
        fn create_new(&self, path: &StoragePath, data: &[u8]) -> StorageResult<bool> {
            if *path == self.stalled && self.stalling.swap(false, Ordering::SeqCst) {
                let _ = self.entered.send(());
                let _ = self.release.lock().unwrap().recv();
            }
            self.inner.create_new(path, data)
        }
        fn read(&self, path: &StoragePath) -> StorageResult<Box<dyn Read + Send>> {
            self.inner.read(path)
        }
        fn read_from(&self, path: &StoragePath, offset: u64) -> StorageResult<Box<dyn Read + Send>> {
            self.inner.read_from(path, offset)
        }
        fn read_range(&self, path: &StoragePath, offset: u64, len: u64) -> StorageResult<Box<dyn Read + Send>> {
            self.inner.read_range(path, offset, len)
        }
        fn exists(&self, path: &StoragePath) -> StorageResult<bool> {
            self.inner.exists(path)
        }
        fn remove(&self, path: &StoragePath) -> StorageResult<()> {
            self.inner.remove(path)
        }
        fn list(&self, prefix: &StoragePath) -> StorageResult<Vec<ObjectMeta>> {
            self.inner.list(prefix)
        }
        fn last_modified(&self, path: &StoragePath) -> StorageResult<SystemTime> {
            self.inner.last_modified(path)
        }
        fn size(&self, path: &StoragePath) -> StorageResult<u64> {
            self.inner.size(path)
        }
        fn stat(&self, path: &StoragePath) -> StorageResult<ObjectMeta> {
            self.inner.stat(path)
        }
    }

    fn path(p: &str) -> StoragePath {
        StoragePath::new("data", p)
    }

    #[test]
    fn same_path_shares_instance() {
        let docs = Documents::new(locking());
        let a = docs.tray(&path("/t.json"), TrayKind::Volatile).unwrap();
        let b = docs.tray(&path("/t.json"), TrayKind::Volatile).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        a.put("k", json!(1)).unwrap();
        assert_eq!(b.get("k").unwrap(), Some(json!(1)));
    }

    #[test]
    fn different_kind_conflicts() {
        let docs = Documents::new(locking());
        let _tray = docs.tray(&path("/t.json"), TrayKind::Persistent).unwrap();

        let err = docs.tray(&path("/t.json"), TrayKind::Immutable).err().unwrap();
        assert!(matches!(
            err,
            StorageError::KindConflict { open: "persistent tray", requested: "immutable tray", .. }
        ));
        let err = docs.cord(&path("/t.json"), CordKind::Persistent).err().unwrap();
        assert!(matches!(err, StorageError::KindConflict { .. }));
    }

    #[test]
    fn dropped_instances_are_forgotten() {
        let docs = Documents::new(locking());
        let tray = docs.tray(&path("/t.json"), TrayKind::Persistent).unwrap();
        assert_eq!(docs.open_count(), 1);
        drop(tray);

        assert_eq!(docs.open_count(), 0);
        let cord = docs.cord(&path("/t.json"), CordKind::Volatile).unwrap();
        assert_eq!(cord.kind(), CordKind::Volatile);
    }

    #[test]
    fn cords_are_shared_too() {
        let docs = Documents::new(locking());
        let a = docs.cord(&path("/log.json"), CordKind::Persistent).unwrap();
        let b = docs.cord(&path("/log.json"), CordKind::Persistent).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn slow_open_does_not_block_other_paths() {
        let slow = path("/slow.json");
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let inner = MemoryStore::new();
        inner.make_container("data").unwrap();
        let store = StallingStore {
            inner,
            stalled: LockingStore::lock_path(&slow).unwrap(),
            stalling: AtomicBool::new(true),
            entered: entered_tx,
            release: Mutex::new(release_rx),
        };
        let docs = Arc::new(Documents::new(Arc::new(
            LockingStore::new(Arc::new(store))
                .with_identity(LockIdentity::new("test-host", "10.0.0.1"))
                .with_poll_interval(Duration::from_millis(5)),
        )));

        let slow_open = {
            let docs = Arc::clone(&docs);
            let slow = slow.clone();
            thread::spawn(move || docs.tray(&slow, TrayKind::Persistent).map(|tray| tray.kind()))
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let fast_open = {
            let docs = Arc::clone(&docs);
            thread::spawn(move || {
                let result = docs.tray(&path("/fast.json"), TrayKind::Persistent).map(|tray| tray.kind());
                let _ = done_tx.send(result.is_ok());
            })
        };
        let fast_finished = done_rx.recv_timeout(Duration::from_secs(5));
        release_tx.send(()).unwrap();

        assert_eq!(fast_finished, Ok(true));
        fast_open.join().unwrap();
        assert_eq!(slow_open.join().unwrap().unwrap(), TrayKind::Persistent);
    }
}
