//! Backup and restore actions.
//!
//! An action processes one package for one profile on the calling thread.
//! Everything it needs (configuration, shell, package source, backup root)
//! travels in an [`ActionContext`]; actions never fail outward, they turn
//! every error into a failed [`ActionResult`](crate::model::ActionResult).

pub mod backup;
pub mod base;
pub mod restore;
pub mod special;

pub use backup::BackupAction;
pub use restore::RestoreAction;
pub use special::{SpecialImporter, UnsupportedImporter};

use crate::config::{Config, StorageBackendKind};
use crate::packages::{PackageSource, ShellPackageSource};
use crate::shell::{RootShell, Shell};
use crate::storage::{LocalTree, RootStorage, StorageBackend, StorageFile};
use crate::utils::errors::{EngineError, Result};
use base::PackageMatcher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct ActionContext {
    pub config: Arc<Config>,
    pub shell: Arc<dyn Shell>,
    pub packages: Arc<dyn PackageSource>,
    /// Root of the backup tree
    pub storage: StorageFile,
    pub importer: Arc<dyn SpecialImporter>,
    pub matcher: PackageMatcher,
    pub cancel: CancellationToken,
}

impl ActionContext {
    pub fn new(
        config: Config,
        shell: Arc<dyn Shell>,
        packages: Arc<dyn PackageSource>,
        storage: StorageFile,
    ) -> Result<Self> {
        let matcher = PackageMatcher::new(&config.packages, &config.storage.own_package)?;
        Ok(Self {
            config: Arc::new(config),
            shell,
            packages,
            storage,
            importer: Arc::new(UnsupportedImporter),
            matcher,
            cancel: CancellationToken::new(),
        })
    }

    /// Production wiring: privileged shell, configured storage backend and
    /// the package manager.
    pub fn from_config(config: Config) -> Result<Self> {
        let shell: Arc<dyn Shell> = Arc::new(RootShell::new(&config.shell));
        let backend: Arc<dyn StorageBackend> = match config.storage.backend {
            StorageBackendKind::Local => Arc::new(LocalTree::new()),
            StorageBackendKind::Root => Arc::new(RootStorage::new(shell.clone())),
        };
        let storage = StorageFile::new(backend, &config.storage.backup_dir);
        let packages = Arc::new(ShellPackageSource::new(
            shell.clone(),
            &exchange_dir(&config),
        ));
        Self::new(config, shell, packages, storage)
    }

    pub fn with_importer(mut self, importer: Arc<dyn SpecialImporter>) -> Self {
        self.importer = importer;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> String {
        self.config.storage.cache_dir.to_string_lossy().into_owned()
    }
}

/// Where JSON dumps of special packages are handed over to the importer.
pub fn exchange_dir(config: &Config) -> String {
    config
        .storage
        .cache_dir
        .join("special")
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::model::Package;
    use crate::shell::fake::FakeShell;
    use std::path::Path;
    use std::sync::Mutex;

    /// Package source answering from fixed data.
    #[derive(Default)]
    pub struct FakePackages {
        pub uid: Option<u32>,
        pub installed: Mutex<Option<Package>>,
    }

    impl FakePackages {
        pub fn with_uid(uid: u32) -> Arc<Self> {
            Arc::new(Self {
                uid: Some(uid),
                ..Default::default()
            })
        }

        pub fn installed(package: Package) -> Arc<Self> {
            Arc::new(Self {
                uid: Some(10123),
                installed: Mutex::new(Some(package)),
            })
        }
    }

    impl PackageSource for FakePackages {
        fn lookup(&self, package_name: &str, _profile_id: u32) -> Result<Package> {
            self.installed
                .lock()
                .unwrap()
                .clone()
                .filter(|p| p.package_name == package_name)
                .ok_or_else(|| EngineError::PackageNotFound(package_name.to_string()))
        }

        fn application_uid(&self, package_name: &str, _profile_id: u32) -> Result<u32> {
            self.uid
                .ok_or_else(|| EngineError::PackageNotFound(package_name.to_string()))
        }
    }

    pub fn config_in(root: &Path) -> Config {
        let mut config = Config::default();
        config.storage.backup_dir = root.join("backups");
        config.storage.cache_dir = root.join("cache");
        config.storage.backend = StorageBackendKind::Local;
        config.shell.utilbox = String::new();
        config
    }

    pub fn context_with(
        config: Config,
        shell: Arc<FakeShell>,
        packages: Arc<FakePackages>,
    ) -> ActionContext {
        let shell: Arc<dyn Shell> = shell;
        let storage = StorageFile::new(Arc::new(LocalTree::new()), &config.storage.backup_dir);
        ActionContext::new(config, shell, packages, storage).unwrap()
    }

    pub fn context(shell: Arc<FakeShell>, packages: Arc<FakePackages>) -> ActionContext {
        context_with(config_in(&std::env::temp_dir()), shell, packages)
    }
}
