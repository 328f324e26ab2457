//! In-memory object store.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use crate::path::StoragePath;
use crate::storage::{ObjectMeta, ObjectStore, StorageError, StorageResult};

struct StoredObject {
    data: Arc<Vec<u8>>,
    modified: SystemTime,
}

struct Container {
    created: SystemTime,
    objects: BTreeMap<String, StoredObject>,
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, Container>,
    clock: Option<SystemTime>,
}

impl State {
    /// Next modification time; strictly greater than every earlier one.
    fn tick(&mut self) -> SystemTime {
        let now = SystemTime::now();
        let next = match self.clock {
            Some(last) if now <= last => last + Duration::from_nanos(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }

    fn container(&self, name: &str) -> StorageResult<&Container> {
        self.containers
            .get(name)
            .ok_or_else(|| StorageError::NotFound(format!("container {name}")))
    }

    fn object(&self, path: &StoragePath) -> StorageResult<&StoredObject> {
        self.container(path.container())?
            .objects
            .get(path.path())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn put(&mut self, path: &StoragePath, data: Vec<u8>) -> StorageResult<()> {
        let modified = self.tick();
        let container = self
            .containers
            .get_mut(path.container())
            .ok_or_else(|| StorageError::NotFound(format!("container {}", path.container())))?;
        container.objects.insert(
            path.path().to_string(),
            StoredObject {
                data: Arc::new(data),
                modified,
            },
        );
        Ok(())
    }
}

/// Map-backed object store.
///
/// Holds everything behind one `RwLock`. Every write advances a clock that
/// never repeats a timestamp, so modification times always order writes.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn slice(
        &self,
        path: &StoragePath,
        offset: u64,
        len: Option<u64>,
    ) -> StorageResult<Box<dyn Read + Send>> {
        let data = Arc::clone(&self.state().object(path)?.data);
        let size = data.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(size);
        let end = match len {
            Some(n) => start.saturating_add(usize::try_from(n).unwrap_or(usize::MAX)).min(size),
            None => size,
        };
        Ok(Box::new(Cursor::new(data[start..end].to_vec())))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("MemoryStore")
            .field("containers", &state.containers.len())
            .finish()
    }
}

impl ObjectStore for MemoryStore {
    fn make_container(&self, container: &str) -> StorageResult<()> {
        let mut state = self.state_mut();
        if !state.containers.contains_key(container) {
            let created = state.tick();
            state.containers.insert(
                container.to_string(),
                Container {
                    created,
                    objects: BTreeMap::new(),
                },
            );
        }
        Ok(())
    }

    fn container_exists(&self, container: &str) -> StorageResult<bool> {
        Ok(self.state().containers.contains_key(container))
    }

    fn list_containers(&self) -> StorageResult<Vec<String>> {
        Ok(self.state().containers.keys().cloned().collect())
    }

    fn container_created(&self, container: &str) -> StorageResult<SystemTime> {
        Ok(self.state().container(container)?.created)
    }

    fn remove_container(&self, container: &str) -> StorageResult<()> {
        let mut state = self.state_mut();
        if !state.container(container)?.objects.is_empty() {
            return Err(StorageError::WriteError(format!(
                "container {container} is not empty"
            )));
        }
        state.containers.remove(container);
        Ok(())
    }

    fn write(&self, path: &StoragePath, data: &[u8]) -> StorageResult<()> {
        self.state_mut().put(path, data.to_vec())
    }

    fn write_from(
        &self,
        path: &StoragePath,
        reader: &mut dyn Read,
        len: Option<u64>,
    ) -> StorageResult<u64> {
        let mut data = Vec::new();
        let copied = match len {
            Some(n) => reader.take(n).read_to_end(&mut data),
            None => reader.read_to_end(&mut data),
        };
        copied.map_err(|e| StorageError::write(path, e))?;
        let n = data.len() as u64;
        self.state_mut().put(path, data)?;
        Ok(n)
    }

    fn read(&self, path: &StoragePath) -> StorageResult<Box<dyn Read + Send>> {
        self.slice(path, 0, None)
    }

    fn read_from(&self, path: &StoragePath, offset: u64) -> StorageResult<Box<dyn Read + Send>> {
        self.slice(path, offset, None)
    }

    fn read_range(
        &self,
        path: &StoragePath,
        offset: u64,
        len: u64,
    ) -> StorageResult<Box<dyn Read + Send>> {
        self.slice(path, offset, Some(len))
    }

    fn exists(&self, path: &StoragePath) -> StorageResult<bool> {
        Ok(self
            .state()
            .containers
            .get(path.container())
            .is_some_and(|c| c.objects.contains_key(path.path())))
    }

    fn remove(&self, path: &StoragePath) -> StorageResult<()> {
        let mut state = self.state_mut();
        let container = state
            .containers
            .get_mut(path.container())
            .ok_or_else(|| StorageError::NotFound(format!("container {}", path.container())))?;
        container
            .objects
            .remove(path.path())
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn list(&self, prefix: &StoragePath) -> StorageResult<Vec<ObjectMeta>> {
        let state = self.state();
        let container = state.container(prefix.container())?;
        Ok(container
            .objects
            .iter()
            .map(|(key, object)| (StoragePath::new(prefix.container(), key), object))
            .filter(|(path, _)| prefix.contains(path))
            .map(|(path, object)| ObjectMeta {
                path,
                size: object.data.len() as u64,
                last_modified: object.modified,
            })
            .collect())
    }

    fn last_modified(&self, path: &StoragePath) -> StorageResult<SystemTime> {
        Ok(self.state().object(path)?.modified)
    }

    fn size(&self, path: &StoragePath) -> StorageResult<u64> {
        Ok(self.state().object(path)?.data.len() as u64)
    }

    fn stat(&self, path: &StoragePath) -> StorageResult<ObjectMeta> {
        let state = self.state();
        let object = state.object(path)?;
        Ok(ObjectMeta {
            path: path.clone(),
            size: object.data.len() as u64,
            last_modified: object.modified,
        })
    }
}
