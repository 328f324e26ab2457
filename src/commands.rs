//! Command implementations behind the CLI.
//!
//! Each command works against the store described by the loaded
//! [`Config`] and returns data; printing is left to the binary.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::cli::Target;
use crate::config::Config;
use crate::cord::{Cord, CordKind, FieldValue, open_cord};
use crate::document::Object;
use crate::lock::{LockSentinel, LockingStore};
use crate::path::StoragePath;
use crate::storage::{ObjectMeta, ObjectStore};
use crate::tray::{Tray, TrayKind, open_tray};

/// Maximum length of a container name.
const MAX_CONTAINER_LENGTH: usize = 63;

/// A configured store, ready for commands.
pub struct Session {
    store: Arc<LockingStore>,
    wait: Duration,
}

impl Session {
    /// Open the store named by the loaded config.
    ///
    /// # Errors
    ///
    /// Returns an error if config loading fails or the store cannot be opened.
    pub fn load() -> anyhow::Result<Self> {
        Self::from_config(&Config::load()?)
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be opened.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            store: config.open_locking_store()?,
            wait: config.lock.wait(),
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<LockingStore> {
        &self.store
    }

    fn existing(&self, target: &Target) -> anyhow::Result<StoragePath> {
        let path = target.storage_path();
        if !self.store.exists(&path)? {
            anyhow::bail!("No object at {path}");
        }
        Ok(path)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("store", &self.store)
            .field("wait", &self.wait)
            .finish()
    }
}

/// Validate a container name.
///
/// Only allows alphanumeric characters, hyphens, underscores, and dots, so
/// the name works both as a directory and as a bucket.
fn validate_container(name: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        anyhow::bail!("Container name cannot be empty");
    }

    if name.len() > MAX_CONTAINER_LENGTH {
        anyhow::bail!(
            "Container name too long: {} chars (max {MAX_CONTAINER_LENGTH})",
            name.len()
        );
    }

    // Must start with alphanumeric
    if !name.chars().next().is_some_and(char::is_alphanumeric) {
        anyhow::bail!("Container name must start with a letter or number");
    }

    for c in name.chars() {
        if !c.is_alphanumeric() && c != '-' && c != '_' && c != '.' {
            anyhow::bail!(
                "Container name contains invalid character: '{c}' \
                (only letters, numbers, hyphens, underscores, and dots allowed)"
            );
        }
    }

    Ok(())
}

/// Parse a command-line value as JSON, falling back to a plain string.
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// A container and when it was created.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
}

/// List all containers.
///
/// A container whose creation time cannot be read is listed without one.
///
/// # Errors
///
/// Returns an error if the backend cannot list containers.
pub fn containers(session: &Session) -> anyhow::Result<Vec<ContainerInfo>> {
    let store = session.store.store();
    Ok(store
        .list_containers()?
        .into_iter()
        .map(|name| {
            let created = store.container_created(&name).ok().map(DateTime::<Utc>::from);
            ContainerInfo { name, created }
        })
        .collect())
}

/// # Errors
///
/// Returns an error if the name is invalid or the backend fails.
pub fn make_container(session: &Session, name: &str) -> anyhow::Result<()> {
    validate_container(name)?;
    Ok(session.store.store().make_container(name)?)
}

/// # Errors
///
/// Returns an error if the container is missing, not empty, or the backend fails.
pub fn remove_container(session: &Session, name: &str) -> anyhow::Result<()> {
    Ok(session.store.store().remove_container(name)?)
}

/// Objects below `prefix`, lock sentinels included.
///
/// # Errors
///
/// Returns an error if the container does not exist or the backend fails.
pub fn list(session: &Session, container: &str, prefix: &str) -> anyhow::Result<Vec<ObjectMeta>> {
    Ok(session.store.store().list(&StoragePath::new(container, prefix))?)
}

/// Contents of an object, read under its lock.
///
/// # Errors
///
/// Returns an error if the object is missing or its lock is not acquired in time.
pub fn cat(session: &Session, target: &Target) -> anyhow::Result<Vec<u8>> {
    Ok(session.store.read(&target.storage_path(), session.wait)?)
}

/// Remove an object under its lock, breaking the lock first if `force` is set
/// and it is not acquired in time.
///
/// # Errors
///
/// Returns an error if the object is missing or the lock is not acquired.
pub fn remove(session: &Session, target: &Target, force: bool) -> anyhow::Result<()> {
    let path = target.storage_path();
    if force {
        session.store.remove_forced(&path, session.wait)?;
    } else {
        session.store.remove(&path, session.wait)?;
    }
    Ok(())
}

/// # Errors
///
/// Returns an error if the container does not exist or the backend fails.
pub fn disk_usage(session: &Session, container: &str, prefix: &str) -> anyhow::Result<u64> {
    Ok(session.store.store().disk_usage(&StoragePath::new(container, prefix))?)
}

/// One value of a tray, or the whole tray when `key` is `None`.
///
/// # Errors
///
/// Returns an error if the tray does not exist or cannot be parsed.
pub fn tray_get(session: &Session, target: &Target, key: Option<&str>) -> anyhow::Result<Option<Value>> {
    let path = session.existing(target)?;
    let tray = open_tray(Arc::clone(&session.store), path, TrayKind::Persistent)?;
    Ok(match key {
        Some(key) => tray.get(key)?,
        None => Some(Value::Object(tray.to_snapshot()?)),
    })
}

/// Store a value, returning the one it replaced. A missing tray is created.
///
/// # Errors
///
/// Returns an error if the tray cannot be loaded or written.
pub fn tray_put(
    session: &Session,
    target: &Target,
    key: &str,
    raw_value: &str,
    kind: TrayKind,
) -> anyhow::Result<Option<Value>> {
    let tray = open_tray(Arc::clone(&session.store), target.storage_path(), kind)?;
    let previous = tray.put(key, parse_value(raw_value))?;
    tray.close()?;
    Ok(previous)
}

/// Remove a key, returning its value.
///
/// # Errors
///
/// Returns an error if the tray does not exist or cannot be written.
pub fn tray_remove(
    session: &Session,
    target: &Target,
    key: &str,
    kind: TrayKind,
) -> anyhow::Result<Option<Value>> {
    let path = session.existing(target)?;
    let tray = open_tray(Arc::clone(&session.store), path, kind)?;
    let removed = tray.remove(key)?;
    tray.close()?;
    Ok(removed)
}

/// # Errors
///
/// Returns an error if the tray does not exist or cannot be parsed.
pub fn tray_keys(session: &Session, target: &Target) -> anyhow::Result<BTreeSet<String>> {
    let path = session.existing(target)?;
    Ok(open_tray(Arc::clone(&session.store), path, TrayKind::Persistent)?.keys()?)
}

/// Append a JSON object to a cord, returning the new size. A missing cord is
/// created.
///
/// # Errors
///
/// Returns an error if `raw_object` is not a JSON object or the cord cannot
/// be written.
pub fn cord_append(session: &Session, target: &Target, raw_object: &str, kind: CordKind) -> anyhow::Result<usize> {
    let object: Object = match serde_json::from_str(raw_object)? {
        Value::Object(object) => object,
        _ => anyhow::bail!("Cord elements must be JSON objects"),
    };
    let cord = open_cord(Arc::clone(&session.store), target.storage_path(), kind)?;
    cord.append(object)?;
    let size = cord.size()?;
    cord.close()?;
    Ok(size)
}

/// # Errors
///
/// Returns an error if the cord does not exist or cannot be parsed.
pub fn cord_show(session: &Session, target: &Target) -> anyhow::Result<Vec<Object>> {
    let path = session.existing(target)?;
    Ok(open_cord(Arc::clone(&session.store), path, CordKind::Persistent)?.to_snapshot()?)
}

/// Remove every element whose `key` field equals `value`, returning them.
///
/// # Errors
///
/// Returns an error if the cord does not exist, `value` is not an integer
/// when `as_int` is set, or the cord cannot be written.
pub fn cord_remove_where(
    session: &Session,
    target: &Target,
    key: &str,
    value: &str,
    as_int: bool,
) -> anyhow::Result<Vec<Object>> {
    let value = if as_int {
        FieldValue::Int(value.parse()?)
    } else {
        FieldValue::from(value)
    };
    let path = session.existing(target)?;
    Ok(open_cord(Arc::clone(&session.store), path, CordKind::Persistent)?.remove_all_where(key, &value)?)
}

/// Lock state of an object.
#[derive(Debug, Clone)]
pub enum LockStatus {
    Free,
    /// Locked; the holder is `None` if the sentinel could not be read.
    Held(Option<LockSentinel>),
}

/// # Errors
///
/// Returns an error if the path is a folder or the backend fails.
pub fn lock_status(session: &Session, target: &Target) -> anyhow::Result<LockStatus> {
    let path = target.storage_path();
    if !session.store.is_locked(&path)? {
        return Ok(LockStatus::Free);
    }
    Ok(LockStatus::Held(session.store.lock_holder(&path)?))
}

/// Break the lock on an object. Returns whether there was one.
///
/// # Errors
///
/// Returns an error if the path is a folder or the sentinel cannot be removed.
pub fn lock_break(session: &Session, target: &Target) -> anyhow::Result<bool> {
    let path = target.storage_path();
    let was_locked = session.store.is_locked(&path)?;
    session.store.break_lock(&path)?;
    Ok(was_locked)
}
