//! Tar archive strategies.
//!
//! A strategy turns a directory reachable through the shell into a tar
//! stream and back. [`TarLibrary`] builds and reads the archive in-process
//! and moves file content through the shell one file at a time;
//! [`TarCommand`] lets the device's `tar` do the whole job and only pipes the
//! stream.

pub mod command;
pub mod library;

pub use command::TarCommand;
pub use library::TarLibrary;

use crate::config::{BackupConfig, RestoreConfig};
use crate::shell::{quote, FileEntry, Shell};
use crate::utils::errors::Result;
use std::io::{Read, Write};

/// Which entries of a data directory take part in an archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    /// Top-level names skipped
    pub excluded_basenames: Vec<String>,
    /// Names skipped at any depth
    pub excluded_names: Vec<String>,
    pub cache_dirs: Vec<String>,
    pub include_cache: bool,
}

impl EntryFilter {
    pub fn for_backup(config: &BackupConfig) -> Self {
        Self {
            excluded_basenames: config.excluded_basenames.clone(),
            excluded_names: config.excluded_names.clone(),
            cache_dirs: config.cache_dirs.clone(),
            include_cache: config.backup_cache,
        }
    }

    pub fn for_restore(config: &RestoreConfig, cache_dirs: &[String]) -> Self {
        Self {
            excluded_basenames: config.excluded_basenames.clone(),
            excluded_names: Vec::new(),
            cache_dirs: cache_dirs.to_vec(),
            include_cache: config.restore_cache,
        }
    }

    /// `relative` is `/`-separated and relative to the archived directory.
    pub fn accepts(&self, relative: &str) -> bool {
        let mut parts = relative.split('/').filter(|p| !p.is_empty() && *p != ".");
        let Some(top) = parts.next() else {
            return true;
        };
        if self.excluded_basenames.iter().any(|n| n == top) {
            return false;
        }
        if !self.include_cache && self.cache_dirs.iter().any(|n| n == top) {
            return false;
        }
        let excluded = |p: &str| self.excluded_names.iter().any(|n| n == p);
        !(excluded(top) || parts.any(excluded))
    }

    /// The same rules as `--exclude` options for an external tar run from
    /// inside the directory.
    pub fn tar_options(&self) -> String {
        let mut options = String::new();
        let mut anchored: Vec<&String> = self.excluded_basenames.iter().collect();
        if !self.include_cache {
            anchored.extend(self.cache_dirs.iter());
        }
        for name in anchored {
            options.push_str(&format!(" --exclude={}", quote(&format!("./{}", name))));
        }
        for name in &self.excluded_names {
            options.push_str(&format!(" --exclude={}", quote(name)));
        }
        options
    }
}

/// Creates and extracts tar streams for a directory behind the shell.
pub trait TarStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Archive `entries` (already filtered, relative to `source_dir`) into `out`.
    fn create(
        &self,
        shell: &dyn Shell,
        source_dir: &str,
        entries: &[FileEntry],
        filter: &EntryFilter,
        out: &mut dyn Write,
    ) -> Result<()>;

    /// Unpack `input` below `target_dir`, which must exist. `legacy` archives
    /// may carry absolute member names.
    fn extract(
        &self,
        shell: &dyn Shell,
        input: &mut dyn Read,
        target_dir: &str,
        filter: &EntryFilter,
        legacy: bool,
    ) -> Result<()>;
}

/// Strategy for one invocation. Legacy archives always go through the library.
pub fn select(tar_cmd: bool, legacy: bool) -> Box<dyn TarStrategy> {
    if tar_cmd && !legacy {
        Box::new(TarCommand)
    } else {
        Box::new(TarLibrary)
    }
}
