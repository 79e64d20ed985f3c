//! Traversal of locally reachable backup trees.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Entry names skipped together with everything below them
    pub exclude_names: Vec<String>,

    /// Report directories as well as files
    pub include_dirs: bool,
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    pub size: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        // symlinks are not followed; their own size is reported
        let metadata = entry.path().symlink_metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Self {
            path,
            relative_path,
            size: if metadata.is_file() { metadata.len() } else { 0 },
            is_dir: metadata.is_dir(),
            is_symlink: metadata.file_type().is_symlink(),
        })
    }
}

/// Walk a directory tree and collect its entries (the root itself excluded).
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    let mut walker = WalkDir::new(root).min_depth(1).follow_links(false);
    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let mut it = walker.into_iter();
    while let Some(entry) = it.next() {
        let entry = entry?;

        if should_exclude(&entry, &options.exclude_names) {
            if entry.file_type().is_dir() {
                it.skip_current_dir();
            }
            continue;
        }

        if entry.file_type().is_dir() && !options.include_dirs {
            continue;
        }

        files.push(FileInfo::from_entry(&entry, root)?);
    }

    Ok(files)
}

/// Total size of all regular files below `root`; a plain file reports its own size.
pub fn calculate_total_size(root: &Path) -> std::io::Result<u64> {
    let metadata = root.symlink_metadata()?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }
    Ok(walk_directory(root, &WalkOptions::default())?
        .iter()
        .map(|f| f.size)
        .sum())
}

fn should_exclude(entry: &DirEntry, names: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|n| *n == file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("files"))?;
        fs::write(temp_dir.path().join("data.tar.zst"), b"content1")?;
        fs::write(temp_dir.path().join("files/settings.xml"), b"content2")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 2);

        let options = WalkOptions {
            include_dirs: true,
            ..Default::default()
        };
        assert_eq!(walk_directory(temp_dir.path(), &options)?.len(), 3);
        Ok(())
    }

    #[test]
    fn test_calculate_total_size() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("base.apk"), b"12345")?; // 5 bytes
        fs::create_dir(temp_dir.path().join("sub"))?;
        fs::write(temp_dir.path().join("sub/data.tar"), b"1234567")?; // 7 bytes

        assert_eq!(calculate_total_size(temp_dir.path())?, 12);
        assert_eq!(calculate_total_size(&temp_dir.path().join("base.apk"))?, 5);
        Ok(())
    }

    #[test]
    fn test_exclude_names_prunes_subtree() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("keep.txt"), b"keep")?;
        fs::create_dir(temp_dir.path().join("cache"))?;
        fs::write(temp_dir.path().join("cache/blob"), b"exclude")?;

        let options = WalkOptions {
            exclude_names: vec!["cache".to_string()],
            ..Default::default()
        };
        let files = walk_directory(temp_dir.path(), &options)?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, PathBuf::from("keep.txt"));
        Ok(())
    }
}
