//! Local filesystem storage backend.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;

use crate::path::StoragePath;
use crate::storage::{ObjectMeta, ObjectStore, StorageError, StorageResult};

/// Object store over a base directory.
///
/// Containers are the subdirectories of the base directory; objects are
/// files below them. Writes go to a hidden temp file in the target
/// directory and are renamed into place, so readers never see a partial
/// object. Hidden entries are left out of every listing.
pub struct LocalFileStore {
    base: PathBuf,
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Map an I/O error, keeping "not found" distinct.
fn io_error(
    path: &StoragePath,
    e: &io::Error,
    wrap: fn(&StoragePath, &io::Error) -> StorageError,
) -> StorageError {
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound(path.to_string())
    } else {
        wrap(path, e)
    }
}

fn read_error(path: &StoragePath, e: &io::Error) -> StorageError {
    StorageError::read(path, e)
}

fn write_error(path: &StoragePath, e: &io::Error) -> StorageError {
    StorageError::write(path, e)
}

impl LocalFileStore {
    /// Create a store rooted at `base`, which must be an existing directory.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Unavailable` if `base` is not a directory.
    pub fn new(base: impl Into<PathBuf>) -> StorageResult<Self> {
        let base = base.into();
        if !base.is_dir() {
            return Err(StorageError::Unavailable(format!(
                "{} is not a directory",
                base.display()
            )));
        }
        Ok(Self { base })
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn container_dir(&self, container: &str) -> PathBuf {
        self.base.join(container)
    }

    fn file(&self, path: &StoragePath) -> PathBuf {
        let mut file = self.container_dir(path.container());
        for segment in path.key().split('/').filter(|s| !s.is_empty()) {
            file.push(segment);
        }
        file
    }

    /// Resolve `path` to its file and make sure the containing directory
    /// exists. The container itself must exist.
    fn prepare(&self, path: &StoragePath) -> StorageResult<(PathBuf, PathBuf)> {
        if !self.container_dir(path.container()).is_dir() {
            return Err(StorageError::NotFound(format!("container {}", path.container())));
        }
        let file = self.file(path);
        let dir = file
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| StorageError::write(path, "no parent directory"))?;
        fs::create_dir_all(&dir).map_err(|e| write_error(path, &e))?;
        Ok((file, dir))
    }

    fn open(&self, path: &StoragePath) -> StorageResult<File> {
        let file = self.file(path);
        if file.is_dir() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        File::open(&file).map_err(|e| io_error(path, &e, read_error))
    }

    fn metadata(&self, path: &StoragePath) -> StorageResult<fs::Metadata> {
        let meta = fs::metadata(self.file(path)).map_err(|e| io_error(path, &e, read_error))?;
        if meta.is_file() {
            Ok(meta)
        } else {
            Err(StorageError::NotFound(path.to_string()))
        }
    }

    fn persist(path: &StoragePath, temp: NamedTempFile, file: &Path) -> StorageResult<()> {
        temp.persist(file).map_err(|e| write_error(path, &e.error))?;
        Ok(())
    }
}

impl ObjectStore for LocalFileStore {
    fn make_container(&self, container: &str) -> StorageResult<()> {
        let dir = self.container_dir(container);
        fs::create_dir_all(&dir).map_err(|e| {
            StorageError::WriteError(format!("create container {}: {e}", dir.display()))
        })
    }

    fn container_exists(&self, container: &str) -> StorageResult<bool> {
        Ok(self.container_dir(container).is_dir())
    }

    fn list_containers(&self) -> StorageResult<Vec<String>> {
        let entries = fs::read_dir(&self.base)
            .map_err(|e| StorageError::ReadError(format!("{}: {e}", self.base.display())))?;

        let mut containers = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| StorageError::ReadError(format!("{}: {e}", self.base.display())))?;
            if is_hidden(&entry.file_name()) || !entry.path().is_dir() {
                continue;
            }
            containers.push(entry.file_name().to_string_lossy().into_owned());
        }
        containers.sort();
        Ok(containers)
    }

    fn container_created(&self, container: &str) -> StorageResult<SystemTime> {
        let dir = self.container_dir(container);
        let meta = fs::metadata(&dir).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StorageError::NotFound(format!("container {container}"))
            } else {
                StorageError::ReadError(format!("{}: {e}", dir.display()))
            }
        })?;
        meta.created()
            .or_else(|_| meta.modified())
            .map_err(|e| StorageError::ReadError(format!("{}: {e}", dir.display())))
    }

    fn remove_container(&self, container: &str) -> StorageResult<()> {
        let dir = self.container_dir(container);
        fs::remove_dir(&dir).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StorageError::NotFound(format!("container {container}"))
            } else {
                StorageError::WriteError(format!("remove container {}: {e}", dir.display()))
            }
        })
    }

    fn write(&self, path: &StoragePath, data: &[u8]) -> StorageResult<()> {
        let (file, dir) = self.prepare(path)?;
        let mut temp = NamedTempFile::new_in(&dir).map_err(|e| write_error(path, &e))?;
        temp.write_all(data).map_err(|e| write_error(path, &e))?;
        Self::persist(path, temp, &file)
    }

    fn write_from(
        &self,
        path: &StoragePath,
        reader: &mut dyn Read,
        len: Option<u64>,
    ) -> StorageResult<u64> {
        let (file, dir) = self.prepare(path)?;
        let mut temp = NamedTempFile::new_in(&dir).map_err(|e| write_error(path, &e))?;
        let copied = match len {
            Some(n) => io::copy(&mut reader.take(n), &mut temp),
            None => io::copy(reader, &mut temp),
        };
        let n = copied.map_err(|e| write_error(path, &e))?;
        Self::persist(path, temp, &file)?;
        Ok(n)
    }

    fn create_new(&self, path: &StoragePath, data: &[u8]) -> StorageResult<bool> {
        let (file, _) = self.prepare(path)?;
        let mut out = match OpenOptions::new().write(true).create_new(true).open(&file) {
            Ok(out) => out,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(write_error(path, &e)),
        };
        out.write_all(data).map_err(|e| write_error(path, &e))?;
        Ok(true)
    }

    fn read(&self, path: &StoragePath) -> StorageResult<Box<dyn Read + Send>> {
        Ok(Box::new(self.open(path)?))
    }

    fn read_from(&self, path: &StoragePath, offset: u64) -> StorageResult<Box<dyn Read + Send>> {
        let mut file = self.open(path)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| read_error(path, &e))?;
        Ok(Box::new(file))
    }

    fn read_range(
        &self,
        path: &StoragePath,
        offset: u64,
        len: u64,
    ) -> StorageResult<Box<dyn Read + Send>> {
        let mut file = self.open(path)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| read_error(path, &e))?;
        Ok(Box::new(file.take(len)))
    }

    fn exists(&self, path: &StoragePath) -> StorageResult<bool> {
        Ok(self.file(path).is_file())
    }

    fn remove(&self, path: &StoragePath) -> StorageResult<()> {
        let file = self.file(path);
        if file.is_dir() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        fs::remove_file(&file).map_err(|e| io_error(path, &e, write_error))
    }

    fn list(&self, prefix: &StoragePath) -> StorageResult<Vec<ObjectMeta>> {
        let container_dir = self.container_dir(prefix.container());
        if !container_dir.is_dir() {
            return Err(StorageError::NotFound(format!("container {}", prefix.container())));
        }
        let root = self.file(prefix);
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut objects = Vec::new();
        let walker = WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));
        for entry in walker {
            let entry = entry.map_err(|e| StorageError::read(prefix, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&container_dir) else {
                continue;
            };
            let key: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            let meta = entry.metadata().map_err(|e| StorageError::read(prefix, e))?;
            objects.push(ObjectMeta {
                path: StoragePath::new(prefix.container(), &key.join("/")),
                size: meta.len(),
                last_modified: meta
                    .modified()
                    .map_err(|e| StorageError::read(prefix, e))?,
            });
        }
        debug!(prefix = %prefix, count = objects.len(), "listed local objects");
        Ok(objects)
    }

    fn last_modified(&self, path: &StoragePath) -> StorageResult<SystemTime> {
        self.metadata(path)?
            .modified()
            .map_err(|e| read_error(path, &e))
    }

    fn size(&self, path: &StoragePath) -> StorageResult<u64> {
        Ok(self.metadata(path)?.len())
    }

    fn stat(&self, path: &StoragePath) -> StorageResult<ObjectMeta> {
        let meta = self.metadata(path)?;
        Ok(ObjectMeta {
            path: path.clone(),
            size: meta.len(),
            last_modified: meta.modified().map_err(|e| read_error(path, &e))?,
        })
    }
}
