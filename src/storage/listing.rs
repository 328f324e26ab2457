//! Bounded, time-limited cache of object listings.
//!
//! The remote store answers `size`, `last_modified` and `disk_usage` from
//! listings instead of issuing one request per object. Entries are keyed by
//! the listed prefix, expire after a fixed staleness window, and are dropped
//! whenever this client writes below their prefix.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::path::StoragePath;
use crate::storage::{ObjectMeta, StorageResult};

/// Default staleness window.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Default number of cached prefixes.
pub const DEFAULT_CAPACITY: usize = 256;

struct Entry {
    fetched: Instant,
    objects: Arc<Vec<ObjectMeta>>,
}

pub struct ListingCache {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<HashMap<StoragePath, Entry>>,
}

impl ListingCache {
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<StoragePath, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached listing of `prefix`, if present and fresh.
    pub fn get(&self, prefix: &StoragePath) -> Option<Arc<Vec<ObjectMeta>>> {
        let mut entries = self.entries();
        match entries.get(prefix) {
            Some(entry) if entry.fetched.elapsed() < self.ttl => Some(Arc::clone(&entry.objects)),
            Some(_) => {
                entries.remove(prefix);
                debug!(prefix = %prefix, "listing cache entry expired");
                None
            }
            None => None,
        }
    }

    /// Store a fresh listing of `prefix`, evicting the oldest entry when full.
    pub fn insert(&self, prefix: &StoragePath, objects: Vec<ObjectMeta>) -> Arc<Vec<ObjectMeta>> {
        let objects = Arc::new(objects);
        let mut entries = self.entries();
        entries.retain(|_, entry| entry.fetched.elapsed() < self.ttl);
        if entries.len() >= self.capacity && !entries.contains_key(prefix) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.fetched)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                debug!(prefix = %oldest, "listing cache evicted entry");
            }
        }
        entries.insert(
            prefix.clone(),
            Entry {
                fetched: Instant::now(),
                objects: Arc::clone(&objects),
            },
        );
        objects
    }

    /// Cached listing of `prefix`, fetching and caching it on a miss.
    ///
    /// # Errors
    ///
    /// Returns the error of `fetch`.
    pub fn get_or_fetch(
        &self,
        prefix: &StoragePath,
        fetch: impl FnOnce() -> StorageResult<Vec<ObjectMeta>>,
    ) -> StorageResult<Arc<Vec<ObjectMeta>>> {
        if let Some(objects) = self.get(prefix) {
            return Ok(objects);
        }
        let objects = fetch()?;
        Ok(self.insert(prefix, objects))
    }

    /// Drop every cached listing that would contain `path`.
    pub fn invalidate(&self, path: &StoragePath) {
        self.entries().retain(|prefix, _| !prefix.contains(path));
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl Default for ListingCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}
