//! Trays: one JSON object per path, used as a key-value document.
//!
//! Three variants share the [`Tray`] interface:
//!
//! - [`PersistentTray`] writes every change through before returning.
//! - [`VolatileTray`] buffers changes until [`Tray::commit`] or [`Tray::close`].
//! - [`ImmutableTray`] writes through and remembers removed keys, so they
//!   stay removed for this instance even if another writer adds them back.

mod immutable;
mod persistent;
mod volatile;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

pub use immutable::ImmutableTray;
pub use persistent::PersistentTray;
pub use volatile::VolatileTray;

use crate::document::Object;
use crate::lock::LockingStore;
use crate::path::StoragePath;
use crate::storage::{StorageError, StorageResult};

/// Which [`Tray`] implementation backs a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrayKind {
    Persistent,
    Volatile,
    Immutable,
}

impl TrayKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Persistent => "persistent",
            Self::Volatile => "volatile",
            Self::Immutable => "immutable",
        }
    }
}

impl fmt::Display for TrayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TrayKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "persistent" => Ok(Self::Persistent),
            "volatile" => Ok(Self::Volatile),
            "immutable" => Ok(Self::Immutable),
            other => Err(StorageError::InvalidArgument(format!("unknown tray kind: {other}"))),
        }
    }
}

/// A JSON object document.
///
/// Every operation takes the instance monitor, reloads the backing object
/// if another writer changed it, and applies the change.
pub trait Tray: Send + Sync {
    fn path(&self) -> &StoragePath;

    fn kind(&self) -> TrayKind;

    /// The value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backing object cannot be loaded or parsed.
    fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    /// The value under `key` if it is an object.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    fn get_object(&self, key: &str) -> StorageResult<Option<Object>> {
        Ok(match self.get(key)? {
            Some(Value::Object(object)) => Some(object),
            _ => None,
        })
    }

    /// The value under `key` if it is an array.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    fn get_array(&self, key: &str) -> StorageResult<Option<Vec<Value>>> {
        Ok(match self.get(key)? {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        })
    }

    /// Store `value` under `key`, returning the previous value.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the document cannot be loaded or, for
    /// write-through trays, written.
    fn put(&self, key: &str, value: Value) -> StorageResult<Option<Value>>;

    /// Remove `key`, returning its value. Removing an absent key writes nothing.
    ///
    /// # Errors
    ///
    /// See [`put`](Self::put).
    fn remove(&self, key: &str) -> StorageResult<Option<Value>>;

    /// # Errors
    ///
    /// Returns `StorageError` if the backing object cannot be loaded or parsed.
    fn keys(&self) -> StorageResult<BTreeSet<String>>;

    /// # Errors
    ///
    /// Returns `StorageError` if the backing object cannot be loaded or parsed.
    fn count(&self) -> StorageResult<usize>;

    /// # Errors
    ///
    /// Returns `StorageError` if the backing object cannot be loaded or parsed.
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.count()? == 0)
    }

    /// A deep copy of the whole document.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backing object cannot be loaded or parsed.
    fn to_snapshot(&self) -> StorageResult<Object>;

    /// Write buffered changes. A no-op for write-through trays.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the write fails; the changes stay buffered.
    fn commit(&self) -> StorageResult<()>;

    /// Commit, then drop the in-memory copy. The next access reloads.
    ///
    /// # Errors
    ///
    /// See [`commit`](Self::commit).
    fn close(&self) -> StorageResult<()>;
}

/// Open an unshared tray of `kind` at `path`, creating an empty document
/// if none exists.
///
/// # Errors
///
/// Returns `StorageError` if `path` is a folder or the empty document
/// cannot be written.
pub fn open_tray(store: Arc<LockingStore>, path: StoragePath, kind: TrayKind) -> StorageResult<Arc<dyn Tray>> {
    let tray: Arc<dyn Tray> = match kind {
        TrayKind::Persistent => Arc::new(PersistentTray::open(store, path)?),
        TrayKind::Volatile => Arc::new(VolatileTray::open(store, path)?),
        TrayKind::Immutable => Arc::new(ImmutableTray::open(store, path)?),
    };
    Ok(tray)
}
