//! Backing objects of trays and cords.
//!
//! A document is loaded lazily and kept in memory. Before each access the
//! backend is asked for the object's size and modification time; when they
//! differ from what was seen right after the last load or commit, the
//! document is read again. Loads and commits go through the forced lock
//! protocol, so a crashed holder delays a document by at most the lock wait.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::format;
use crate::lock::LockingStore;
use crate::path::StoragePath;
use crate::storage::{ObjectMeta, StorageError, StorageResult};

/// How long document loads and commits wait for the lock before breaking it.
pub const DOCUMENT_LOCK_WAIT: Duration = Duration::from_secs(10);

/// A JSON object as stored in trays and as the elements of cords.
pub type Object = Map<String, Value>;

/// What the backend reported about an object after we last synchronised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stamp {
    modified: SystemTime,
    size: u64,
}

impl From<&ObjectMeta> for Stamp {
    fn from(meta: &ObjectMeta) -> Self {
        Self {
            modified: meta.last_modified,
            size: meta.size,
        }
    }
}

/// In-memory form of a backing object.
pub(crate) trait Content: Default + Send + 'static {
    fn decode(path: &StoragePath, bytes: &[u8]) -> StorageResult<Self>;
    fn encode(&self) -> StorageResult<Vec<u8>>;
}

impl Content for Object {
    fn decode(path: &StoragePath, bytes: &[u8]) -> StorageResult<Self> {
        format::read_object(path, bytes)
    }

    fn encode(&self) -> StorageResult<Vec<u8>> {
        format::write_object(self)
    }
}

impl Content for Vec<Object> {
    fn decode(path: &StoragePath, bytes: &[u8]) -> StorageResult<Self> {
        format::read_array(path, bytes)?
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(object) => Ok(object),
                _ => Err(StorageError::ParseError(format!(
                    "{path}: element {i} is not an object"
                ))),
            })
            .collect()
    }

    fn encode(&self) -> StorageResult<Vec<u8>> {
        format::write_array(self)
    }
}

/// When changes reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    /// Every change is written before the operation returns.
    Through,
    /// Changes are kept in memory until `commit` or `close`.
    Buffered,
}

pub(crate) struct State<C> {
    content: Option<C>,
    stamp: Option<Stamp>,
    dirty: bool,
}

impl<C> State<C> {
    /// The in-memory content, if loaded, without asking the backend.
    pub(crate) fn loaded(&self) -> Option<&C> {
        self.content.as_ref()
    }

    fn forget(&mut self) {
        self.content = None;
        self.stamp = None;
        self.dirty = false;
    }
}

/// One backing object plus its in-memory copy behind the instance monitor.
pub(crate) struct Document<C> {
    store: Arc<LockingStore>,
    path: StoragePath,
    mode: WriteMode,
    wait: Duration,
    state: Mutex<State<C>>,
}

impl<C: Content> Document<C> {
    /// Open the document at `path`, writing an empty one if it is absent.
    pub(crate) fn open(store: Arc<LockingStore>, path: StoragePath, mode: WriteMode) -> StorageResult<Self> {
        LockingStore::lock_path(&path)?;
        let doc = Self {
            store,
            path,
            mode,
            wait: DOCUMENT_LOCK_WAIT,
            state: Mutex::new(State {
                content: None,
                stamp: None,
                dirty: false,
            }),
        };
        doc.create_if_absent()?;
        Ok(doc)
    }

    fn create_if_absent(&self) -> StorageResult<()> {
        if self.store.exists(&self.path)? {
            return Ok(());
        }
        let empty = C::default().encode()?;
        self.store.forced(&self.path, self.wait, |store| {
            if !store.exists(&self.path)? {
                debug!(path = %self.path, "creating empty document");
                store.write(&self.path, &empty)?;
            }
            Ok(())
        })
    }

    pub(crate) fn path(&self) -> &StoragePath {
        &self.path
    }

    /// Take the instance monitor.
    ///
    /// A monitor poisoned by a panicking holder is recovered by dropping the
    /// in-memory copy, unflushed changes included.
    pub(crate) fn lock(&self) -> MutexGuard<'_, State<C>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(path = %self.path, "document monitor was poisoned, discarding in-memory copy");
                let mut guard = poisoned.into_inner();
                guard.forget();
                self.state.clear_poison();
                guard
            }
        }
    }

    /// The current content, reloaded first if the backend changed.
    ///
    /// Unflushed buffered changes take precedence over the backend until
    /// they are committed.
    pub(crate) fn fresh<'a>(&self, state: &'a mut State<C>) -> StorageResult<&'a mut C> {
        let reload = match &state.content {
            None => true,
            Some(_) if state.dirty => false,
            Some(_) => self.current_stamp()? != state.stamp,
        };
        if reload {
            self.load(state)?;
        }
        Ok(state.content.get_or_insert_with(C::default))
    }

    fn current_stamp(&self) -> StorageResult<Option<Stamp>> {
        match self.store.store().stat(&self.path) {
            Ok(meta) => Ok(Some(Stamp::from(&meta))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn load(&self, state: &mut State<C>) -> StorageResult<()> {
        let (bytes, stamp) = self.store.forced(&self.path, self.wait, |store| {
            match store.read_all(&self.path) {
                Ok(bytes) => Ok((bytes, Some(Stamp::from(&store.stat(&self.path)?)))),
                Err(e) if e.is_not_found() => Ok((Vec::new(), None)),
                Err(e) => Err(e),
            }
        })?;
        let content = C::decode(&self.path, &bytes)?;
        debug!(path = %self.path, bytes = bytes.len(), "document loaded");
        state.content = Some(content);
        state.stamp = stamp;
        state.dirty = false;
        Ok(())
    }

    fn write_back(&self, state: &mut State<C>) -> StorageResult<()> {
        let Some(content) = &state.content else {
            return Ok(());
        };
        let bytes = content.encode()?;
        let meta = self.store.forced(&self.path, self.wait, |store| {
            store.write(&self.path, &bytes)?;
            store.stat(&self.path)
        })?;
        debug!(path = %self.path, bytes = bytes.len(), "document written");
        state.stamp = Some(Stamp::from(&meta));
        state.dirty = false;
        Ok(())
    }

    /// Record that the content changed.
    ///
    /// Write-through documents are written now; a failed write drops the
    /// in-memory copy so the next access sees what the backend holds.
    pub(crate) fn changed(&self, state: &mut State<C>) -> StorageResult<()> {
        match self.mode {
            WriteMode::Through => self.write_back(state).inspect_err(|_| state.forget()),
            WriteMode::Buffered => {
                state.dirty = true;
                Ok(())
            }
        }
    }

    /// Run `f` on the current content.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&C) -> T) -> StorageResult<T> {
        let mut state = self.lock();
        Ok(f(self.fresh(&mut state)?))
    }

    /// Run `f` on the current content; the flag it returns says whether it
    /// changed anything that must be written.
    pub(crate) fn modify<T>(&self, f: impl FnOnce(&mut C) -> StorageResult<(T, bool)>) -> StorageResult<T> {
        let mut state = self.lock();
        let (value, changed) = f(self.fresh(&mut state)?)?;
        if changed {
            self.changed(&mut state)?;
        }
        Ok(value)
    }

    /// Write buffered changes, if any.
    pub(crate) fn commit(&self) -> StorageResult<()> {
        let mut state = self.lock();
        if state.dirty {
            self.write_back(&mut state)?;
        }
        Ok(())
    }

    /// Commit, then drop the in-memory copy.
    pub(crate) fn close(&self) -> StorageResult<()> {
        let mut state = self.lock();
        if state.dirty {
            self.write_back(&mut state)?;
        }
        state.forget();
        debug!(path = %self.path, "document closed");
        Ok(())
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.lock().dirty
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::lock::LockIdentity;
    use crate::storage::ObjectStore;
    use crate::storage::memory::MemoryStore;

    fn locking() -> Arc<LockingStore> {
        let store = MemoryStore::new();
        store.make_container("data").unwrap();
        Arc::new(
            LockingStore::new(Arc::new(store))
                .with_identity(LockIdentity::new("test-host", "10.0.0.1"))
                .with_poll_interval(Duration::from_millis(5)),
        )
    }

    fn path() -> StoragePath {
        StoragePath::new("data", "/doc.json")
    }

    #[test]
    fn open_writes_empty_document() {
        let store = locking();
        let _doc: Document<Object> = Document::open(Arc::clone(&store), path(), WriteMode::Through).unwrap();
        assert_eq!(store.store().read_all(&path()).unwrap(), b"{\n}");

        let _log: Document<Vec<Object>> =
            Document::open(Arc::clone(&store), StoragePath::new("data", "/log.json"), WriteMode::Through)
                .unwrap();
        assert_eq!(
            store.store().read_all(&StoragePath::new("data", "/log.json")).unwrap(),
            b"[\n]"
        );
    }

    #[test]
    fn open_keeps_existing_content() {
        let store = locking();
        store.store().write(&path(), br#"{"a":1}"#).unwrap();
        let doc: Document<Object> = Document::open(store, path(), WriteMode::Through).unwrap();
        assert_eq!(doc.read(|o| o.get("a").cloned()).unwrap(), Some(json!(1)));
    }

    #[test]
    fn folders_cannot_back_documents() {
        let result: StorageResult<Document<Object>> =
            Document::open(locking(), StoragePath::new("data", "/folder"), WriteMode::Through);
        assert!(matches!(result, Err(StorageError::Path(_))));
    }

    #[test]
    fn external_change_triggers_reload() {
        let store = locking();
        let doc: Document<Object> = Document::open(Arc::clone(&store), path(), WriteMode::Through).unwrap();
        assert_eq!(doc.read(Map::len).unwrap(), 0);

        store.store().write(&path(), br#"{"k":"v"}"#).unwrap();
        assert_eq!(doc.read(|o| o.get("k").cloned()).unwrap(), Some(json!("v")));
    }

    #[test]
    fn buffered_changes_win_until_commit() {
        let store = locking();
        let doc: Document<Object> = Document::open(Arc::clone(&store), path(), WriteMode::Buffered).unwrap();
        doc.modify(|o| Ok((o.insert("mine".into(), json!(1)), true))).unwrap();
        assert!(doc.is_dirty());

        store.store().write(&path(), br#"{"theirs":2}"#).unwrap();
        assert!(doc.read(|o| o.contains_key("mine")).unwrap());

        doc.commit().unwrap();
        assert!(!doc.is_dirty());
        let stored = format::read_object(&path(), &store.store().read_all(&path()).unwrap()).unwrap();
        assert!(stored.contains_key("mine"));
        assert!(!stored.contains_key("theirs"));
    }

    #[test]
    fn unchanged_modify_does_not_write() {
        let store = locking();
        let doc: Document<Object> = Document::open(Arc::clone(&store), path(), WriteMode::Through).unwrap();
        let before = store.store().last_modified(&path()).unwrap();
        doc.modify(|_| Ok(((), false))).unwrap();
        assert_eq!(store.store().last_modified(&path()).unwrap(), before);
    }

    #[test]
    fn non_object_elements_are_rejected() {
        let store = locking();
        store.store().write(&path(), b"[{\"a\":1}, 2]").unwrap();
        let doc: Document<Vec<Object>> = Document::open(store, path(), WriteMode::Through).unwrap();
        assert!(matches!(doc.read(Vec::len), Err(StorageError::ParseError(_))));
    }

    #[test]
    fn recovers_from_poisoned_monitor() {
        let store = locking();
        let doc: Document<Object> = Document::open(Arc::clone(&store), path(), WriteMode::Buffered).unwrap();
        doc.modify(|o| Ok((o.insert("lost".into(), json!(true)), true))).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = doc.lock();
            panic!("holder crashed");
        }));
        assert!(result.is_err());

        assert!(!doc.is_dirty());
        assert!(!doc.read(|o| o.contains_key("lost")).unwrap());
    }
}
