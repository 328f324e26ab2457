//! Cords: ordered logs of JSON objects, one JSON array per path.
//!
//! Elements are addressed by position or found by comparing one field with
//! a string or integer. Matching is a linear scan; cords are meant to be
//! bounded (rotated daily, trimmed by their owners).

mod persistent;
mod volatile;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

pub use persistent::PersistentCord;
pub use volatile::VolatileCord;

use crate::document::{Document, Object, WriteMode};
use crate::lock::LockingStore;
use crate::path::StoragePath;
use crate::storage::{StorageError, StorageResult};

/// Which [`Cord`] implementation backs a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CordKind {
    Persistent,
    Volatile,
}

impl CordKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Persistent => "persistent",
            Self::Volatile => "volatile",
        }
    }
}

impl fmt::Display for CordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CordKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "persistent" => Ok(Self::Persistent),
            "volatile" => Ok(Self::Volatile),
            other => Err(StorageError::InvalidArgument(format!("unknown cord kind: {other}"))),
        }
    }
}

/// Value a field is compared with.
///
/// A string only matches JSON strings and an integer only matches JSON
/// integers; `"42"` and `42` are different.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
}

impl FieldValue {
    #[must_use]
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Str(s), Value::String(v)) => s == v,
            (Self::Int(i), Value::Number(n)) => n.as_i64() == Some(*i),
            _ => false,
        }
    }

    fn matches_field(&self, object: &Object, key: &str) -> bool {
        object.get(key).is_some_and(|value| self.matches(value))
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Int(i) => write!(f, "{i}"),
        }
    }
}

/// An ordered log of JSON objects.
///
/// Positional reads and removals outside the log return `None`; removals
/// that find nothing write nothing.
pub trait Cord: Send + Sync {
    fn path(&self) -> &StoragePath;

    fn kind(&self) -> CordKind;

    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be loaded or written.
    fn append(&self, object: Object) -> StorageResult<()>;

    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be loaded or written.
    fn prepend(&self, object: Object) -> StorageResult<()>;

    /// Insert `object` before position `pos`; `pos == size` appends.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::OutOfBounds` if `pos > size`, or the error of
    /// loading or writing the log.
    fn insert(&self, object: Object, pos: usize) -> StorageResult<()>;

    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be loaded or parsed.
    fn get(&self, pos: usize) -> StorageResult<Option<Object>>;

    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be loaded or parsed.
    fn get_first(&self) -> StorageResult<Option<Object>> {
        self.get(0)
    }

    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be loaded or parsed.
    fn get_last(&self) -> StorageResult<Option<Object>>;

    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be loaded or written.
    fn remove(&self, pos: usize) -> StorageResult<Option<Object>>;

    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be loaded or written.
    fn remove_first(&self) -> StorageResult<Option<Object>> {
        self.remove(0)
    }

    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be loaded or written.
    fn remove_last(&self) -> StorageResult<Option<Object>>;

    /// Every element whose `key` field matches `value`, in log order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be loaded or parsed.
    fn get_all_where(&self, key: &str, value: &FieldValue) -> StorageResult<Vec<Object>>;

    /// Remove every element whose `key` field matches `value` and return
    /// them in log order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be loaded or written.
    fn remove_all_where(&self, key: &str, value: &FieldValue) -> StorageResult<Vec<Object>>;

    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be loaded or parsed.
    fn get_one_where(&self, key: &str, value: &FieldValue) -> StorageResult<Option<Object>>;

    /// Remove the first element whose `key` field matches `value`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be loaded or written.
    fn remove_one_where(&self, key: &str, value: &FieldValue) -> StorageResult<Option<Object>>;

    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be loaded or parsed.
    fn size(&self) -> StorageResult<usize>;

    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be loaded or parsed.
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.size()? == 0)
    }

    /// A deep copy of the whole log.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be loaded or parsed.
    fn to_snapshot(&self) -> StorageResult<Vec<Object>>;

    /// Write buffered changes. A no-op for write-through cords.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the write fails; the changes stay buffered.
    fn commit(&self) -> StorageResult<()>;

    /// Commit, then drop the in-memory copy.
    ///
    /// # Errors
    ///
    /// See [`commit`](Self::commit).
    fn close(&self) -> StorageResult<()>;
}

/// Open an unshared cord of `kind` at `path`, creating an empty log if
/// none exists.
///
/// # Errors
///
/// Returns `StorageError` if `path` is a folder or the empty log cannot be
/// written.
pub fn open_cord(store: Arc<LockingStore>, path: StoragePath, kind: CordKind) -> StorageResult<Arc<dyn Cord>> {
    let cord: Arc<dyn Cord> = match kind {
        CordKind::Persistent => Arc::new(PersistentCord::open(store, path)?),
        CordKind::Volatile => Arc::new(VolatileCord::open(store, path)?),
    };
    Ok(cord)
}

/// Log operations shared by both variants; they differ only in when
/// changes are written.
struct Log {
    doc: Document<Vec<Object>>,
}

impl Log {
    fn open(store: Arc<LockingStore>, path: StoragePath, mode: WriteMode) -> StorageResult<Self> {
        Ok(Self {
            doc: Document::open(store, path, mode)?,
        })
    }

    fn path(&self) -> &StoragePath {
        self.doc.path()
    }

    fn insert(&self, object: Object, pos: Option<usize>) -> StorageResult<()> {
        self.doc.modify(|items| {
            let len = items.len();
            let pos = pos.unwrap_or(len);
            if pos > len {
                return Err(StorageError::OutOfBounds { pos, len });
            }
            items.insert(pos, object);
            Ok(((), true))
        })
    }

    fn get(&self, pos: usize) -> StorageResult<Option<Object>> {
        self.doc.read(|items| items.get(pos).cloned())
    }

    fn get_last(&self) -> StorageResult<Option<Object>> {
        self.doc.read(|items| items.last().cloned())
    }

    fn remove(&self, pos: usize) -> StorageResult<Option<Object>> {
        self.doc.modify(|items| {
            if pos < items.len() {
                Ok((Some(items.remove(pos)), true))
            } else {
                Ok((None, false))
            }
        })
    }

    fn remove_last(&self) -> StorageResult<Option<Object>> {
        self.doc.modify(|items| {
            let last = items.pop();
            let changed = last.is_some();
            Ok((last, changed))
        })
    }

    fn get_all_where(&self, key: &str, value: &FieldValue) -> StorageResult<Vec<Object>> {
        self.doc.read(|items| {
            items
                .iter()
                .filter(|item| value.matches_field(item, key))
                .cloned()
                .collect()
        })
    }

    fn remove_all_where(&self, key: &str, value: &FieldValue) -> StorageResult<Vec<Object>> {
        self.doc.modify(|items| {
            let (removed, kept): (Vec<Object>, Vec<Object>) = std::mem::take(items)
                .into_iter()
                .partition(|item| value.matches_field(item, key));
            *items = kept;
            let changed = !removed.is_empty();
            Ok((removed, changed))
        })
    }

    fn get_one_where(&self, key: &str, value: &FieldValue) -> StorageResult<Option<Object>> {
        self.doc
            .read(|items| items.iter().find(|item| value.matches_field(item, key)).cloned())
    }

    fn remove_one_where(&self, key: &str, value: &FieldValue) -> StorageResult<Option<Object>> {
        self.doc.modify(|items| {
            match items.iter().position(|item| value.matches_field(item, key)) {
                Some(pos) => Ok((Some(items.remove(pos)), true)),
                None => Ok((None, false)),
            }
        })
    }

    fn size(&self) -> StorageResult<usize> {
        self.doc.read(Vec::len)
    }

    fn to_snapshot(&self) -> StorageResult<Vec<Object>> {
        self.doc.read(Vec::clone)
    }

    fn commit(&self) -> StorageResult<()> {
        self.doc.commit()
    }

    fn close(&self) -> StorageResult<()> {
        self.doc.close()
    }

    fn is_dirty(&self) -> bool {
        self.doc.is_dirty()
    }
}
