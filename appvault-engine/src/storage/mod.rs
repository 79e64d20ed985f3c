//! Backup storage abstraction.
//!
//! A [`StorageFile`] is a cheap handle (backend + path) on a file or
//! directory of the backup tree. Two backends exist: [`LocalTree`] for a
//! directory this process can reach directly (with a cached listing) and
//! [`RootStorage`] for locations only the privileged shell can reach.

pub mod local;
pub mod root;

pub use local::LocalTree;
pub use root::RootStorage;

use crate::pipeline::Sink;
use crate::utils::errors::Result;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait StorageBackend: Send + Sync {
    fn exists(&self, path: &Path) -> Result<bool>;
    fn is_dir(&self, path: &Path) -> Result<bool>;
    /// Child names of a directory.
    fn list(&self, dir: &Path) -> Result<Vec<String>>;
    /// Create a directory and its missing parents.
    fn create_dir(&self, path: &Path) -> Result<()>;
    fn open_input(&self, path: &Path) -> Result<Box<dyn Read + Send>>;
    /// The file is complete once the returned sink is finished.
    fn open_output(&self, path: &Path) -> Result<Box<dyn Sink>>;
    /// Remove a file or a whole directory tree.
    fn delete(&self, path: &Path) -> Result<()>;
    /// Size of a file, or of all files below a directory.
    fn size(&self, path: &Path) -> Result<u64>;
    /// Drop cached knowledge about `path` and everything below it.
    fn invalidate_cache(&self, _path: &Path) {}
}

#[derive(Clone)]
pub struct StorageFile {
    backend: Arc<dyn StorageBackend>,
    path: PathBuf,
}

impl fmt::Debug for StorageFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StorageFile").field(&self.path).finish()
    }
}

impl StorageFile {
    pub fn new(backend: Arc<dyn StorageBackend>, path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Handle on a child; does not touch the backend.
    pub fn child(&self, name: &str) -> StorageFile {
        StorageFile::new(self.backend.clone(), self.path.join(name))
    }

    pub fn exists(&self) -> Result<bool> {
        self.backend.exists(&self.path)
    }

    pub fn is_dir(&self) -> Result<bool> {
        self.backend.is_dir(&self.path)
    }

    /// Create this directory (and parents) if missing.
    pub fn ensure_dir(&self) -> Result<()> {
        self.backend.create_dir(&self.path)
    }

    pub fn create_directory(&self, name: &str) -> Result<StorageFile> {
        let dir = self.child(name);
        dir.ensure_dir()?;
        Ok(dir)
    }

    /// Handle for a new file in this directory; content is written through
    /// [`StorageFile::open_output`].
    pub fn create_file(&self, name: &str) -> Result<StorageFile> {
        self.ensure_dir()?;
        Ok(self.child(name))
    }

    /// Look a child up by exact name in the (possibly cached) listing.
    pub fn find_file(&self, name: &str) -> Result<Option<StorageFile>> {
        if !self.exists()? {
            return Ok(None);
        }
        Ok(self
            .backend
            .list(&self.path)?
            .iter()
            .any(|n| n == name)
            .then(|| self.child(name)))
    }

    pub fn list_files(&self) -> Result<Vec<StorageFile>> {
        let mut names = self.backend.list(&self.path)?;
        names.sort();
        Ok(names.iter().map(|n| self.child(n)).collect())
    }

    pub fn open_input(&self) -> Result<Box<dyn Read + Send>> {
        self.backend.open_input(&self.path)
    }

    pub fn open_output(&self) -> Result<Box<dyn Sink>> {
        self.backend.open_output(&self.path)
    }

    pub fn delete(&self) -> Result<()> {
        self.backend.delete(&self.path)
    }

    pub fn size(&self) -> Result<u64> {
        self.backend.size(&self.path)
    }

    pub fn invalidate_cache(&self) {
        self.backend.invalidate_cache(&self.path)
    }
}
