//! Cross-process locking through sentinel objects.
//!
//! A lock on `path` is the object `<path>.lock`. Whoever manages to create
//! it holds the lock; its JSON body only records who that was, for
//! diagnostics. Acquisition goes through [`ObjectStore::create_new`], which
//! is atomic on the local and remote backends.

use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::path::{PathError, StoragePath};
use crate::storage::{ObjectStore, StorageError, StorageResult};

/// Suffix of sentinel objects.
pub const LOCK_SUFFIX: &str = ".lock";

/// Default interval between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Body of a sentinel object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSentinel {
    pub host: String,
    pub ip: String,
    /// Acquisition time, milliseconds since the epoch.
    pub time: i64,
}

impl LockSentinel {
    #[must_use]
    pub fn acquired_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.time)
    }
}

/// Who this process claims to be when it takes a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockIdentity {
    pub host: String,
    pub ip: String,
}

impl LockIdentity {
    pub fn new(host: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ip: ip.into(),
        }
    }

    /// Host name and outbound IP address of this machine.
    #[must_use]
    pub fn detect() -> Self {
        Self::new(detect_host(), detect_ip())
    }

    fn sentinel(&self) -> LockSentinel {
        LockSentinel {
            host: self.host.clone(),
            ip: self.ip.clone(),
            time: Utc::now().timestamp_millis(),
        }
    }
}

fn detect_host() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

/// Address of the interface that would route to the internet. Connecting a
/// UDP socket sends no packet.
fn detect_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map_or_else(|_| "127.0.0.1".to_string(), |addr| addr.ip().to_string())
}

/// Object store access guarded by sentinel locks.
pub struct LockingStore {
    store: Arc<dyn ObjectStore>,
    identity: LockIdentity,
    poll: Duration,
}

impl std::fmt::Debug for LockingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockingStore")
            .field("identity", &self.identity)
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}

impl LockingStore {
    /// Wrap `store` using the detected identity and the default poll interval.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            identity: LockIdentity::detect(),
            poll: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_identity(mut self, identity: LockIdentity) -> Self {
        self.identity = identity;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// The wrapped store, for unlocked access.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    #[must_use]
    pub fn identity(&self) -> &LockIdentity {
        &self.identity
    }

    /// Sentinel path guarding `path`.
    ///
    /// # Errors
    ///
    /// Returns `PathError::IsAFolder` for folder paths; only objects can be locked.
    pub fn lock_path(path: &StoragePath) -> StorageResult<StoragePath> {
        if path.is_folder() {
            return Err(PathError::IsAFolder(path.to_string()).into());
        }
        Ok(path.with_suffix(LOCK_SUFFIX))
    }

    fn acquire(&self, path: &StoragePath, lock: &StoragePath, wait: Duration) -> StorageResult<()> {
        let body = serde_json::to_vec(&self.identity.sentinel())
            .map_err(|e| StorageError::SerializeError(e.to_string()))?;
        let started = Instant::now();
        loop {
            if self.store.create_new(lock, &body)? {
                debug!(path = %path, "lock acquired");
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= wait {
                return Err(StorageError::LockTimeout {
                    path: path.to_string(),
                    waited,
                });
            }
            thread::sleep(self.poll.min(wait - waited));
        }
    }

    fn release(&self, lock: &StoragePath) -> StorageResult<()> {
        match self.store.remove(lock) {
            Err(e) if e.is_not_found() => {
                debug!(lock = %lock, "lock was already gone on release");
                Ok(())
            }
            other => other,
        }
    }

    /// Run `op` against the raw store while holding the lock on `path`.
    ///
    /// The lock is released whether or not `op` succeeds. A failed release
    /// is only reported if `op` succeeded; otherwise it is logged and the
    /// error of `op` is returned.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::LockTimeout` if the lock is not acquired within
    /// `wait`, or the error of `op` or of the release.
    pub fn locked<T>(
        &self,
        path: &StoragePath,
        wait: Duration,
        op: impl FnOnce(&dyn ObjectStore) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let lock = Self::lock_path(path)?;
        self.acquire(path, &lock, wait)?;
        let result = op(self.store.as_ref());
        match (result, self.release(&lock)) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(e), Err(release_err)) => {
                warn!(path = %path, error = %release_err, "failed to release lock after error");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    /// Like [`locked`](Self::locked), but a lock that cannot be acquired in
    /// time is broken and the operation retried once without waiting.
    ///
    /// # Errors
    ///
    /// Returns the error of `op`, of the release or of breaking the lock.
    pub fn forced<T>(
        &self,
        path: &StoragePath,
        wait: Duration,
        op: impl Fn(&dyn ObjectStore) -> StorageResult<T>,
    ) -> StorageResult<T> {
        match self.locked(path, wait, &op) {
            Err(e) if e.is_lock_timeout() => {
                self.break_stuck_lock(path)?;
                self.locked(path, Duration::ZERO, &op)
            }
            other => other,
        }
    }

    fn break_stuck_lock(&self, path: &StoragePath) -> StorageResult<()> {
        let holder = self.lock_holder(path)?;
        match &holder {
            Some(h) => warn!(
                path = %path,
                host = %h.host,
                ip = %h.ip,
                since = ?h.acquired_at(),
                "breaking lock"
            ),
            None => warn!(path = %path, "breaking lock"),
        }
        self.break_lock(path)
    }

    /// Write `data` to `path` under its lock.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::LockTimeout` if the lock is not acquired within
    /// `wait`, or the error of the write.
    pub fn write(&self, path: &StoragePath, data: &[u8], wait: Duration) -> StorageResult<()> {
        self.locked(path, wait, |store| store.write(path, data))
    }

    /// Write `data` to `path`, breaking the lock if it is not acquired within `wait`.
    ///
    /// # Errors
    ///
    /// Returns the error of the write or of breaking the lock.
    pub fn write_forced(&self, path: &StoragePath, data: &[u8], wait: Duration) -> StorageResult<()> {
        self.forced(path, wait, |store| store.write(path, data))
    }

    /// Write `data` gzip-compressed to `path`, breaking the lock if it is
    /// not acquired within `wait`.
    ///
    /// # Errors
    ///
    /// Returns the error of compressing, of the write or of breaking the lock.
    pub fn write_gzip_forced(&self, path: &StoragePath, data: &[u8], wait: Duration) -> StorageResult<()> {
        let compressed = crate::storage::gzip(path, data)?;
        self.forced(path, wait, |store| store.write(path, &compressed))
    }

    /// Read `path` under its lock.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::LockTimeout` if the lock is not acquired within
    /// `wait`, or the error of the read.
    pub fn read(&self, path: &StoragePath, wait: Duration) -> StorageResult<Vec<u8>> {
        self.locked(path, wait, |store| store.read_all(path))
    }

    /// Read `path`, breaking the lock if it is not acquired within `wait`.
    ///
    /// If the retry fails too, the lock is broken once more so a failing
    /// reader does not leave it behind.
    ///
    /// # Errors
    ///
    /// Returns the error of the read or of breaking the lock.
    pub fn read_forced(&self, path: &StoragePath, wait: Duration) -> StorageResult<Vec<u8>> {
        let read = |store: &dyn ObjectStore| store.read_all(path);
        match self.locked(path, wait, read) {
            Err(e) if e.is_lock_timeout() => {
                self.break_stuck_lock(path)?;
                self.locked(path, Duration::ZERO, read).inspect_err(|_| {
                    if let Err(break_err) = self.break_lock(path) {
                        warn!(path = %path, error = %break_err, "failed to break lock after retry");
                    }
                })
            }
            other => other,
        }
    }

    /// Append `data` to the object at `path` under one lock. A missing
    /// object is created.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::LockTimeout` if the lock is not acquired within
    /// `wait`, or the error of the read or write.
    pub fn append(&self, path: &StoragePath, data: &[u8], wait: Duration) -> StorageResult<()> {
        self.locked(path, wait, |store| append_to(store, path, data))
    }

    /// Append, breaking the lock if it is not acquired within `wait`.
    ///
    /// # Errors
    ///
    /// Returns the error of the append or of breaking the lock.
    pub fn append_forced(&self, path: &StoragePath, data: &[u8], wait: Duration) -> StorageResult<()> {
        self.forced(path, wait, |store| append_to(store, path, data))
    }

    /// Remove `path` under its lock.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::LockTimeout` if the lock is not acquired within
    /// `wait`, or the error of the removal.
    pub fn remove(&self, path: &StoragePath, wait: Duration) -> StorageResult<()> {
        self.locked(path, wait, |store| store.remove(path))
    }

    /// Remove `path`, breaking the lock if it is not acquired within `wait`.
    ///
    /// # Errors
    ///
    /// Returns the error of the removal or of breaking the lock.
    pub fn remove_forced(&self, path: &StoragePath, wait: Duration) -> StorageResult<()> {
        self.forced(path, wait, |store| store.remove(path))
    }

    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be queried.
    pub fn exists(&self, path: &StoragePath) -> StorageResult<bool> {
        self.store.exists(path)
    }

    /// # Errors
    ///
    /// Returns `StorageError` for folder paths or if the backend cannot be queried.
    pub fn is_locked(&self, path: &StoragePath) -> StorageResult<bool> {
        self.store.exists(&Self::lock_path(path)?)
    }

    /// Remove the sentinel of `path`, whoever holds it. Succeeds if there is none.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the sentinel cannot be removed.
    pub fn break_lock(&self, path: &StoragePath) -> StorageResult<()> {
        self.release(&Self::lock_path(path)?)
    }

    /// The recorded holder of the lock on `path`.
    ///
    /// Returns `None` if the path is not locked or the sentinel body cannot
    /// be read as a holder record.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` for folder paths or if the backend fails.
    pub fn lock_holder(&self, path: &StoragePath) -> StorageResult<Option<LockSentinel>> {
        let lock = Self::lock_path(path)?;
        let body = match self.store.read_all(&lock) {
            Ok(body) => body,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice(&body) {
            Ok(sentinel) => Ok(Some(sentinel)),
            Err(e) => {
                debug!(lock = %lock, error = %e, "unreadable lock sentinel");
                Ok(None)
            }
        }
    }

    /// # Errors
    ///
    /// See [`lock_holder`](Self::lock_holder).
    pub fn locked_by_host(&self, path: &StoragePath) -> StorageResult<Option<String>> {
        Ok(self.lock_holder(path)?.map(|h| h.host))
    }

    /// # Errors
    ///
    /// See [`lock_holder`](Self::lock_holder).
    pub fn locked_by_ip(&self, path: &StoragePath) -> StorageResult<Option<String>> {
        Ok(self.lock_holder(path)?.map(|h| h.ip))
    }

    /// # Errors
    ///
    /// See [`lock_holder`](Self::lock_holder).
    pub fn locked_by_time(&self, path: &StoragePath) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(self.lock_holder(path)?.and_then(|h| h.acquired_at()))
    }
}

fn append_to(store: &dyn ObjectStore, path: &StoragePath, data: &[u8]) -> StorageResult<()> {
    let mut content = match store.read_all(path) {
        Ok(content) => content,
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => return Err(e),
    };
    content.extend_from_slice(data);
    store.write(path, &content)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use tempfile::TempDir;

    use super::*;
    use crate::storage::local::LocalFileStore;
    use crate::storage::memory::MemoryStore;

    fn identity() -> LockIdentity {
        LockIdentity::new("test-host", "10.0.0.1")
    }

    fn memory_store() -> LockingStore {
        let store = MemoryStore::new();
        store.make_container("data").unwrap();
        LockingStore::new(Arc::new(store))
            .with_identity(identity())
            .with_poll_interval(Duration::from_millis(5))
    }

    fn path(p: &str) -> StoragePath {
        StoragePath::new("data", p)
    }

    #[test]
    fn write_and_read_release_the_lock() {
        let locking = memory_store();
        locking.write(&path("/t.json"), b"{}", Duration::ZERO).unwrap();

        assert_eq!(locking.read(&path("/t.json"), Duration::ZERO).unwrap(), b"{}");
        assert!(!locking.is_locked(&path("/t.json")).unwrap());
    }

    #[test]
    fn failed_operation_still_releases() {
        let locking = memory_store();

        let err = locking.read(&path("/missing.json"), Duration::ZERO).unwrap_err();

        assert!(err.is_not_found());
        assert!(!locking.is_locked(&path("/missing.json")).unwrap());
    }

    #[test]
    fn held_lock_with_zero_wait_times_out() {
        let locking = memory_store();
        let lock = LockingStore::lock_path(&path("/t.json")).unwrap();
        locking.store().write(&lock, b"{}").unwrap();

        let err = locking.write(&path("/t.json"), b"1", Duration::ZERO).unwrap_err();

        assert!(err.is_lock_timeout());
        assert!(!locking.exists(&path("/t.json")).unwrap());
    }

    #[test]
    fn wait_polls_until_timeout() {
        let locking = memory_store();
        let lock = LockingStore::lock_path(&path("/t.json")).unwrap();
        locking.store().write(&lock, b"{}").unwrap();

        let started = Instant::now();
        let err = locking
            .read(&path("/t.json"), Duration::from_millis(50))
            .unwrap_err();

        assert!(err.is_lock_timeout());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn forced_write_breaks_stuck_lock() {
        let locking = memory_store();
        let lock = LockingStore::lock_path(&path("/t.json")).unwrap();
        let stale = r#"{"host":"crashed","ip":"10.0.0.9","time":0}"#;
        locking.store().write(&lock, stale.as_bytes()).unwrap();

        locking
            .write_forced(&path("/t.json"), b"[]", Duration::from_millis(10))
            .unwrap();

        assert_eq!(locking.store().read_all(&path("/t.json")).unwrap(), b"[]");
        assert!(!locking.is_locked(&path("/t.json")).unwrap());
    }

    #[test]
    fn gzip_write_breaks_stuck_lock() {
        let locking = memory_store();
        let lock = LockingStore::lock_path(&path("/t.json.gz")).unwrap();
        locking.store().write(&lock, b"{}").unwrap();

        locking
            .write_gzip_forced(&path("/t.json.gz"), b"{\"a\":1}", Duration::from_millis(10))
            .unwrap();

        let mut restored = Vec::new();
        locking
            .store()
            .read_gzip(&path("/t.json.gz"))
            .unwrap()
            .read_to_end(&mut restored)
            .unwrap();
        assert_eq!(restored, b"{\"a\":1}");
        assert!(!locking.is_locked(&path("/t.json.gz")).unwrap());
    }

    #[test]
    fn forced_ops_pass_other_errors_through() {
        let locking = memory_store();
        let err = locking
            .read_forced(&path("/missing.json"), Duration::ZERO)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn holder_diagnostics() {
        let locking = memory_store();
        let lock = LockingStore::lock_path(&path("/t.json")).unwrap();
        let held = r#"{"host":"worker-7","ip":"10.1.2.3","time":1700000000000}"#;
        locking.store().write(&lock, held.as_bytes()).unwrap();

        assert!(locking.is_locked(&path("/t.json")).unwrap());
        assert_eq!(
            locking.locked_by_host(&path("/t.json")).unwrap().as_deref(),
            Some("worker-7")
        );
        assert_eq!(
            locking.locked_by_ip(&path("/t.json")).unwrap().as_deref(),
            Some("10.1.2.3")
        );
        assert_eq!(
            locking
                .locked_by_time(&path("/t.json"))
                .unwrap()
                .map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );

        locking.break_lock(&path("/t.json")).unwrap();
        assert!(locking.lock_holder(&path("/t.json")).unwrap().is_none());
    }

    #[test]
    fn sentinel_records_identity() {
        let locking = memory_store();
        let lock = LockingStore::lock_path(&path("/t.json")).unwrap();
        let seen = locking
            .locked(&path("/t.json"), Duration::ZERO, |store| {
                let body = store.read_all(&lock)?;
                serde_json::from_slice::<LockSentinel>(&body)
                    .map_err(|e| StorageError::ParseError(e.to_string()))
            })
            .unwrap();

        assert_eq!(seen.host, "test-host");
        assert_eq!(seen.ip, "10.0.0.1");
        assert!(seen.time > 0);
    }

    #[test]
    fn folder_paths_cannot_be_locked() {
        let locking = memory_store();
        let err = locking.write(&path("/acct"), b"{}", Duration::ZERO).unwrap_err();
        assert!(matches!(err, StorageError::Path(PathError::IsAFolder(_))));
    }

    #[test]
    fn append_creates_and_extends() {
        let locking = memory_store();
        locking.append(&path("/log.txt"), b"a", Duration::ZERO).unwrap();
        locking.append(&path("/log.txt"), b"b", Duration::ZERO).unwrap();
        assert_eq!(locking.store().read_all(&path("/log.txt")).unwrap(), b"ab");
    }

    #[test]
    fn detected_identity_is_not_empty() {
        let id = LockIdentity::detect();
        assert!(!id.host.is_empty());
        assert!(!id.ip.is_empty());
    }

    #[test]
    fn contended_appends_never_interleave() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalFileStore::new(temp_dir.path()).unwrap();
        store.make_container("data").unwrap();
        let locking = Arc::new(
            LockingStore::new(Arc::new(store))
                .with_identity(identity())
                .with_poll_interval(Duration::from_millis(1)),
        );

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let locking = Arc::clone(&locking);
                thread::spawn(move || {
                    for _ in 0..10 {
                        let line = format!("{t}{t}{t}{t}\n");
                        locking
                            .append(&path("/log.txt"), line.as_bytes(), Duration::from_secs(30))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let content = String::from_utf8(locking.store().read_all(&path("/log.txt")).unwrap()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 40);
        for line in lines {
            let first = line.chars().next().unwrap();
            assert!(line.len() == 4 && line.chars().all(|c| c == first), "torn line {line:?}");
        }
    }
}
