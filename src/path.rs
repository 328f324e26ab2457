//! Container-scoped object paths.
//!
//! A [`StoragePath`] names one object (or folder) inside one container. The
//! path part is always kept in canonical form: a leading `/`, no trailing
//! `/`, no empty, `.` or `..` segments. The container root is the empty path.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Extensions longer than this do not make a segment a file name.
const MAX_EXTENSION_LENGTH: usize = 8;

/// Contract violations when deriving one path from another.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("Path is not a folder: {0}")]
    NotAFolder(String),

    #[error("Path has no parent: {0}")]
    NoParent(String),

    #[error("Path is a folder, not an object: {0}")]
    IsAFolder(String),
}

/// Canonicalize a path string.
///
/// Never fails: a missing leading `/` is added, trailing and repeated `/`
/// are dropped, `.` segments are removed and `..` removes the segment before
/// it. A `..` at the root is ignored.
#[must_use]
pub fn canonicalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut out = String::with_capacity(path.len() + 1);
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    out
}

/// Returns true if the final segment of a canonical path names a folder.
fn is_folder_path(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or_default();
    match name.rfind('.') {
        None => true,
        Some(p) => name.len() - p - 1 > MAX_EXTENSION_LENGTH,
    }
}

/// An immutable `(container, path)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawPath", into = "RawPath")]
pub struct StoragePath {
    container: String,
    path: String,
}

#[derive(Serialize, Deserialize)]
struct RawPath {
    container: String,
    path: String,
}

impl From<RawPath> for StoragePath {
    fn from(raw: RawPath) -> Self {
        Self::new(raw.container, &raw.path)
    }
}

impl From<StoragePath> for RawPath {
    fn from(path: StoragePath) -> Self {
        Self {
            container: path.container,
            path: path.path,
        }
    }
}

impl StoragePath {
    /// Create a path inside `container`. The path is canonicalized.
    ///
    /// Container names must not contain `/`.
    pub fn new(container: impl Into<String>, path: &str) -> Self {
        let container = container.into();
        debug_assert!(!container.contains('/'), "container name contains '/'");
        Self {
            container,
            path: canonicalize(path),
        }
    }

    /// The root folder of a container.
    pub fn root(container: impl Into<String>) -> Self {
        Self::new(container, "")
    }

    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }

    /// The canonical path, starting with `/` (empty for the root).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The path without its leading `/`, as used for object keys.
    #[must_use]
    pub fn key(&self) -> &str {
        self.path.strip_prefix('/').unwrap_or(&self.path)
    }

    /// The final segment (empty for the root).
    #[must_use]
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    /// The first segment (empty for the root).
    #[must_use]
    pub fn head(&self) -> &str {
        self.key().split('/').next().unwrap_or_default()
    }

    #[must_use]
    pub fn is_folder(&self) -> bool {
        is_folder_path(&self.path)
    }

    #[must_use]
    pub fn is_root_folder(&self) -> bool {
        self.path.is_empty()
    }

    /// True if the path is exactly one segment below the root.
    #[must_use]
    pub fn is_in_root_folder(&self) -> bool {
        !self.path.is_empty() && self.path.rfind('/') == Some(0)
    }

    /// Extend a folder path with `subpath`.
    ///
    /// # Errors
    ///
    /// Returns `PathError::NotAFolder` if this path is not a folder.
    pub fn append(&self, subpath: &str) -> Result<Self, PathError> {
        if !self.is_folder() {
            return Err(PathError::NotAFolder(self.to_string()));
        }
        Ok(Self {
            container: self.container.clone(),
            path: canonicalize(&format!("{}/{subpath}", self.path)),
        })
    }

    /// Remove the final segment.
    ///
    /// # Errors
    ///
    /// Returns `PathError::NoParent` for the root and `PathError::NotAFolder`
    /// if the remaining path would not be a folder.
    pub fn truncate(&self) -> Result<Self, PathError> {
        let parent = self
            .parent()
            .ok_or_else(|| PathError::NoParent(self.to_string()))?;
        if !parent.is_folder() {
            return Err(PathError::NotAFolder(parent.to_string()));
        }
        Ok(parent)
    }

    /// The enclosing path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let p = self.path.rfind('/')?;
        Some(Self {
            container: self.container.clone(),
            path: self.path[..p].to_string(),
        })
    }

    /// True if `other` is this path or lies below it in the same container.
    #[must_use]
    pub fn contains(&self, other: &StoragePath) -> bool {
        self.container == other.container
            && other
                .path
                .strip_prefix(&self.path)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    /// A sibling path with `suffix` appended to the final segment.
    #[must_use]
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self::new(self.container.clone(), &format!("{}{suffix}", self.path))
    }

    fn rendered(&self) -> impl Iterator<Item = u8> + '_ {
        self.container.bytes().chain(self.path.bytes())
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.container, self.path)
    }
}

impl PartialEq for StoragePath {
    fn eq(&self, other: &Self) -> bool {
        self.rendered().eq(other.rendered())
    }
}

impl Eq for StoragePath {}

impl Hash for StoragePath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.rendered() {
            state.write_u8(b);
        }
    }
}

impl PartialOrd for StoragePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StoragePath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rendered().cmp(other.rendered())
    }
}
