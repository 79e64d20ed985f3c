//! Directory tree reachable by this process, with a cached listing.
//!
//! Listing a document-provider style tree is the expensive operation, so
//! directory listings are kept until a mutation or an explicit
//! [`StorageBackend::invalidate_cache`] drops them.

use super::StorageBackend;
use crate::fs::walker;
use crate::pipeline::Sink;
use crate::utils::errors::Result;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::trace;

#[derive(Default)]
pub struct LocalTree {
    listings: RwLock<HashMap<PathBuf, Vec<String>>>,
}

impl LocalTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn forget(&self, path: &Path) {
        if let Ok(mut listings) = self.listings.write() {
            listings.retain(|cached, _| !cached.starts_with(path));
            if let Some(parent) = path.parent() {
                listings.remove(parent);
            }
        }
    }
}

impl StorageBackend for LocalTree {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(path.symlink_metadata().is_ok())
    }

    fn is_dir(&self, path: &Path) -> Result<bool> {
        Ok(path.is_dir())
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        if let Ok(listings) = self.listings.read() {
            if let Some(names) = listings.get(dir) {
                return Ok(names.clone());
            }
        }

        trace!("Listing {}", dir.display());
        let options = walker::WalkOptions {
            max_depth: Some(1),
            include_dirs: true,
            ..Default::default()
        };
        let names: Vec<String> = walker::walk_directory(dir, &options)?
            .into_iter()
            .map(|info| info.relative_path.to_string_lossy().into_owned())
            .collect();
        if let Ok(mut listings) = self.listings.write() {
            listings.insert(dir.to_path_buf(), names.clone());
        }
        Ok(names)
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        if !path.is_dir() {
            fs::create_dir_all(path)?;
            self.forget(path);
        }
        Ok(())
    }

    fn open_input(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(io::BufReader::new(fs::File::open(path)?)))
    }

    fn open_output(&self, path: &Path) -> Result<Box<dyn Sink>> {
        let file = fs::File::create(path)?;
        self.forget(path);
        Ok(Box::new(file))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
        self.forget(path);
        Ok(())
    }

    fn size(&self, path: &Path) -> Result<u64> {
        Ok(walker::calculate_total_size(path)?)
    }

    fn invalidate_cache(&self, path: &Path) {
        self.forget(path);
    }
}

#[cfg(test)]
mod tests {
    use super::super::StorageFile;
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_listing_is_cached_until_invalidated() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = StorageFile::new(Arc::new(LocalTree::new()), temp_dir.path());

        fs::write(temp_dir.path().join("a"), b"1")?;
        assert!(root.find_file("a").unwrap().is_some());

        // created behind the cache's back
        fs::write(temp_dir.path().join("b"), b"2")?;
        assert!(root.find_file("b").unwrap().is_none());

        root.invalidate_cache();
        assert!(root.find_file("b").unwrap().is_some());
        Ok(())
    }

    #[test]
    fn test_output_is_visible_and_sized() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = StorageFile::new(Arc::new(LocalTree::new()), temp_dir.path());
        assert!(root.list_files().unwrap().is_empty());

        let instance = root.create_directory("org.example").unwrap();
        let file = instance.create_file("data.tar").unwrap();
        let mut sink = file.open_output().unwrap();
        sink.write_all(b"0123456789")?;
        sink.finish()?;

        assert_eq!(root.list_files().unwrap().len(), 1);
        assert!(instance.find_file("data.tar").unwrap().is_some());
        assert_eq!(root.size().unwrap(), 10);

        let mut content = String::new();
        file.open_input().unwrap().read_to_string(&mut content)?;
        assert_eq!(content, "0123456789");

        // directories are listed next to files
        instance.create_directory("nested").unwrap();
        let mut names = instance.list_files().unwrap().iter().map(|f| f.name()).collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, ["data.tar", "nested"]);

        instance.delete().unwrap();
        assert!(!instance.exists().unwrap());
        assert!(root.list_files().unwrap().is_empty());
        Ok(())
    }
}
