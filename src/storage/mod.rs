//! Object store trait and implementations.
//!
//! This module provides an abstraction over container/object storage so the
//! document layers can run against the local filesystem, an S3-compatible
//! remote store, or memory. Composite operations (copy, rename, merge,
//! directory views, streaming writes) are defined once on the trait in terms
//! of the primitive operations, so every backend gets them.

pub mod listing;
pub mod local;
pub mod memory;
pub mod pipe;
pub mod remote;
mod sigv4;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::debug;

use crate::path::{PathError, StoragePath};
use pipe::StreamWriter;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Failed to read: {0}")]
    ReadError(String),

    #[error("Failed to write: {0}")]
    WriteError(String),

    #[error("Failed to parse document: {0}")]
    ParseError(String),

    #[error("Failed to serialize: {0}")]
    SerializeError(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout after {waited:?} waiting for lock on {path}")]
    LockTimeout { path: String, waited: Duration },

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("Position {pos} out of bounds for length {len}")]
    OutOfBounds { pos: usize, len: usize },

    #[error("{path} is already open as {open}, requested {requested}")]
    KindConflict {
        path: String,
        open: &'static str,
        requested: &'static str,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl StorageError {
    /// True if the error is a lock-wait timeout rather than a backend failure.
    #[must_use]
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub(crate) fn read(path: &StoragePath, e: impl std::fmt::Display) -> Self {
        Self::ReadError(format!("{path}: {e}"))
    }

    pub(crate) fn write(path: &StoragePath, e: impl std::fmt::Display) -> Self {
        Self::WriteError(format!("{path}: {e}"))
    }
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Listing entry for one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub path: StoragePath,
    pub size: u64,
    pub last_modified: SystemTime,
}

/// One entry of a single-level directory view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    /// Object size; zero for directories.
    pub size: u64,
    /// Modification time; `None` for directories.
    pub last_modified: Option<SystemTime>,
}

/// Trait for object store backends (local filesystem, S3, memory).
pub trait ObjectStore: Send + Sync + 'static {
    /// Create a container. Succeeds if it already exists.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the container cannot be created.
    fn make_container(&self, container: &str) -> StorageResult<()>;

    /// Check whether a container exists.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be queried.
    fn container_exists(&self, container: &str) -> StorageResult<bool>;

    /// List all container names.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be queried.
    fn list_containers(&self) -> StorageResult<Vec<String>>;

    /// Creation time of a container.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the container does not exist.
    fn container_created(&self, container: &str) -> StorageResult<SystemTime>;

    /// Remove a container. The container must be empty.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the container is not empty or cannot be removed.
    fn remove_container(&self, container: &str) -> StorageResult<()>;

    /// Write an object, replacing any previous content.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the object cannot be written.
    fn write(&self, path: &StoragePath, data: &[u8]) -> StorageResult<()>;

    /// Write an object from a reader.
    ///
    /// With a declared length, at most `len` bytes are stored; with `None`
    /// the reader is consumed to its end. Returns the number of bytes stored.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if reading the source or writing the object fails.
    fn write_from(
        &self,
        path: &StoragePath,
        reader: &mut dyn Read,
        len: Option<u64>,
    ) -> StorageResult<u64>;

    /// Write an object only if it does not exist yet.
    ///
    /// Returns `false` if the object already existed. The default checks and
    /// then writes, which is not atomic; backends with a conditional create
    /// override it.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be queried or written.
    fn create_new(&self, path: &StoragePath, data: &[u8]) -> StorageResult<bool> {
        if self.exists(path)? {
            return Ok(false);
        }
        self.write(path, data)?;
        Ok(true)
    }

    /// Open an object for reading.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the object does not exist.
    fn read(&self, path: &StoragePath) -> StorageResult<Box<dyn Read + Send>>;

    /// Open an object for reading, starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the object does not exist.
    fn read_from(&self, path: &StoragePath, offset: u64) -> StorageResult<Box<dyn Read + Send>>;

    /// Open `len` bytes of an object starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the object does not exist.
    fn read_range(
        &self,
        path: &StoragePath,
        offset: u64,
        len: u64,
    ) -> StorageResult<Box<dyn Read + Send>>;

    /// Read a whole object into memory.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the object cannot be read.
    fn read_all(&self, path: &StoragePath) -> StorageResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.read(path)?
            .read_to_end(&mut buf)
            .map_err(|e| StorageError::read(path, e))?;
        Ok(buf)
    }

    /// Check whether an object exists.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be queried.
    fn exists(&self, path: &StoragePath) -> StorageResult<bool>;

    /// Remove an object.
    ///
    /// Removing a missing object is `StorageError::NotFound` on backends
    /// that can tell; the remote store cannot and succeeds.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the object cannot be removed.
    fn remove(&self, path: &StoragePath) -> StorageResult<()>;

    /// List all objects below `prefix`, recursively.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be listed.
    fn list(&self, prefix: &StoragePath) -> StorageResult<Vec<ObjectMeta>>;

    /// Last modification time of an object.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the object does not exist.
    fn last_modified(&self, path: &StoragePath) -> StorageResult<SystemTime>;

    /// Size of an object in bytes.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the object does not exist.
    fn size(&self, path: &StoragePath) -> StorageResult<u64>;

    /// Size and modification time of one object.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the object does not exist.
    fn stat(&self, path: &StoragePath) -> StorageResult<ObjectMeta> {
        Ok(ObjectMeta {
            path: path.clone(),
            size: self.size(path)?,
            last_modified: self.last_modified(path)?,
        })
    }

    /// Total size of all objects below `prefix`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be listed.
    fn disk_usage(&self, prefix: &StoragePath) -> StorageResult<u64> {
        Ok(self.list(prefix)?.iter().map(|m| m.size).sum())
    }

    /// Copy an object. Backends with a native copy override this.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the source cannot be read or the target written.
    fn copy(&self, from: &StoragePath, to: &StoragePath) -> StorageResult<()> {
        let data = self.read_all(from)?;
        self.write(to, &data)
    }

    /// Move an object: copy, then remove the source.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if either step fails.
    fn rename(&self, from: &StoragePath, to: &StoragePath) -> StorageResult<()> {
        self.copy(from, to)?;
        self.remove(from)
    }

    /// Write `data` gzip-compressed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if compression or the write fails.
    fn write_gzip(&self, path: &StoragePath, data: &[u8]) -> StorageResult<()> {
        self.write(path, &gzip(path, data)?)
    }

    /// Open a gzip-compressed object, decompressing as it is read.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the object does not exist. Corrupt
    /// data surfaces as an I/O error from the returned reader.
    fn read_gzip(&self, path: &StoragePath) -> StorageResult<Box<dyn Read + Send>> {
        Ok(Box::new(GzDecoder::new(self.read(path)?)))
    }

    /// Concatenate two objects into a third, client-side.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if a source cannot be read or the target written.
    fn merge(&self, first: &StoragePath, second: &StoragePath, to: &StoragePath) -> StorageResult<()> {
        self.merge_from(to, &[first.clone(), second.clone()])
    }

    /// Concatenate any number of objects into `to`, client-side.
    ///
    /// The sources are streamed through a bounded pipe into `write_from`
    /// running on a second thread, so no source is held in memory whole.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if a source cannot be read or the target written.
    fn merge_from(&self, to: &StoragePath, from: &[StoragePath]) -> StorageResult<()> {
        let mut total = Some(0u64);
        for source in from {
            let size = self.size(source)?;
            total = total.map(|t| t + size);
        }

        let (mut writer, mut reader) = pipe::pipe();
        thread::scope(|scope| {
            let drain = scope.spawn(move || {
                let stored = self.write_from(to, &mut reader, total);
                if stored.is_ok() {
                    reader.drain();
                }
                stored
            });

            let mut fed = Ok(());
            for source in from {
                let pumped = self.read(source).and_then(|mut input| {
                    writer
                        .pump(&mut input)
                        .map_err(|e| StorageError::read(source, e))
                });
                match pumped {
                    Ok(true) => {}
                    // the drain side failed; its error is reported below
                    Ok(false) => break,
                    Err(e) => {
                        fed = Err(e);
                        break;
                    }
                }
            }
            if fed.is_ok() {
                writer.close();
            } else {
                drop(writer);
            }

            let stored = drain
                .join()
                .map_err(|_| StorageError::write(to, "merge writer panicked"))?;
            fed?;
            let n = stored?;
            debug!(target_path = %to, sources = from.len(), bytes = n, "merged objects");
            Ok(())
        })
    }

    /// One-level view of a folder, grouped from the recursive listing.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be listed.
    fn dir_list(&self, folder: &StoragePath) -> StorageResult<Vec<DirEntry>> {
        let base = folder.path();
        let mut entries: BTreeMap<String, DirEntry> = BTreeMap::new();
        for meta in self.list(folder)? {
            let Some(rest) = meta.path.path().strip_prefix(base) else {
                continue;
            };
            let rest = rest.trim_start_matches('/');
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                Some((dir, _)) => {
                    entries.entry(dir.to_string()).or_insert_with(|| DirEntry {
                        name: dir.to_string(),
                        is_dir: true,
                        size: 0,
                        last_modified: None,
                    });
                }
                None => {
                    entries.insert(
                        rest.to_string(),
                        DirEntry {
                            name: rest.to_string(),
                            is_dir: false,
                            size: meta.size,
                            last_modified: Some(meta.last_modified),
                        },
                    );
                }
            }
        }
        Ok(entries.into_values().collect())
    }

    /// Open a streaming writer for `path`.
    ///
    /// Bytes written to the returned [`StreamWriter`] travel through a
    /// bounded pipe to a background thread running `write_from`. With a
    /// declared length, bytes beyond it are discarded. Call
    /// [`StreamWriter::finish`] to wait for the object to be stored.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the background thread cannot be started.
    fn write_stream(self: Arc<Self>, path: &StoragePath, len: Option<u64>) -> StorageResult<StreamWriter> {
        let (writer, mut reader) = pipe::pipe();
        let target = path.clone();
        let handle = thread::Builder::new()
            .name(format!("writer {path}"))
            .spawn(move || {
                let stored = self.write_from(&target, &mut reader, len);
                let discarded = reader.drain();
                if discarded > 0 {
                    debug!(path = %target, discarded, "stream exceeded declared length");
                }
                stored
            })
            .map_err(|e| StorageError::write(path, e))?;
        Ok(StreamWriter::new(writer, handle, path.clone()))
    }
}

/// Compress `data` for storage at `path`.
pub(crate) fn gzip(path: &StoragePath, data: &[u8]) -> StorageResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|()| encoder.finish())
        .map_err(|e| StorageError::write(path, e))
}
