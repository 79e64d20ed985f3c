//! Backup instance records.
//!
//! Each instance lives in `<root>/<package>/<date>-user_<profile>/` next to
//! its archives, described by a JSON `backup.properties` file.

use super::{Category, Package};
use crate::pipeline::{CipherType, CompressionType};
use crate::storage::StorageFile;
use crate::utils::errors::{EngineError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::warn;

pub const PROPERTIES_FILE: &str = "backup.properties";

/// Format version written by this engine.
pub const BACKUP_VERSION_CODE: u32 = 8100;

/// Instances below this version use the legacy archive layout.
pub const LEGACY_VERSION_LIMIT: u32 = 8000;

pub const DATE_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub backup_version_code: u32,
    pub package_name: String,
    #[serde(default)]
    pub package_label: String,
    #[serde(default)]
    pub version_name: String,
    #[serde(default)]
    pub version_code: i64,
    #[serde(default)]
    pub profile_id: u32,
    /// Base APK path at backup time
    #[serde(default)]
    pub source_dir: String,
    #[serde(default)]
    pub split_source_dirs: Vec<String>,
    pub backup_date: NaiveDateTime,
    #[serde(default)]
    pub has_apk: bool,
    #[serde(default)]
    pub has_app_data: bool,
    #[serde(default)]
    pub has_device_protected_data: bool,
    #[serde(default)]
    pub has_external_data: bool,
    #[serde(default)]
    pub has_obb_data: bool,
    #[serde(default)]
    pub has_media_data: bool,
    #[serde(default)]
    pub compression_type: Option<CompressionType>,
    #[serde(default)]
    pub cipher_type: Option<CipherType>,
    /// Base64 IV shared by all archives of the instance
    #[serde(default)]
    pub iv: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Absolute paths archived for a special package
    #[serde(default)]
    pub special_files: Vec<String>,
    #[serde(skip)]
    pub dir: Option<StorageFile>,
}

impl Backup {
    pub fn has(&self, category: Category) -> bool {
        match category {
            Category::Apk => self.has_apk,
            Category::Data => self.has_app_data,
            Category::DeviceProtected => self.has_device_protected_data,
            Category::External => self.has_external_data,
            Category::Obb => self.has_obb_data,
            Category::Media => self.has_media_data,
        }
    }

    fn flag_mut(&mut self, category: Category) -> &mut bool {
        match category {
            Category::Apk => &mut self.has_apk,
            Category::Data => &mut self.has_app_data,
            Category::DeviceProtected => &mut self.has_device_protected_data,
            Category::External => &mut self.has_external_data,
            Category::Obb => &mut self.has_obb_data,
            Category::Media => &mut self.has_media_data,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher_type.is_some()
    }

    pub fn is_compressed(&self) -> bool {
        self.compression_type.is_some_and(|c| c.is_compressed())
    }

    pub fn is_legacy(&self) -> bool {
        self.backup_version_code < LEGACY_VERSION_LIMIT
    }

    pub fn iv_bytes(&self) -> Result<Vec<u8>> {
        let unreadable = || EngineError::CryptoSetup("IV vector could not be read".to_string());
        let encoded = self.iv.as_deref().ok_or_else(unreadable)?;
        STANDARD.decode(encoded).map_err(|_| unreadable())
    }

    /// File name the base APK was stored under.
    pub fn base_apk_name(&self) -> String {
        self.source_dir
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or("base.apk")
            .to_string()
    }

    pub fn instance_dir_name(&self) -> String {
        instance_dir_name(&self.backup_date, self.profile_id)
    }

    /// Write `backup.properties` into `dir` and remember `dir`.
    pub fn save(&mut self, dir: &StorageFile) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let file = dir.create_file(PROPERTIES_FILE)?;
        let mut sink = file.open_output()?;
        sink.write_all(&json)?;
        sink.finish()?;
        dir.invalidate_cache();
        self.dir = Some(dir.clone());
        Ok(())
    }

    pub fn load(dir: &StorageFile) -> Result<Backup> {
        let mut json = Vec::new();
        dir.child(PROPERTIES_FILE)
            .open_input()?
            .read_to_end(&mut json)?;
        let mut backup: Backup = serde_json::from_slice(&json)?;
        backup.dir = Some(dir.clone());
        Ok(backup)
    }
}

pub fn instance_dir_name(date: &NaiveDateTime, profile_id: u32) -> String {
    format!("{}-user_{}", date.format(DATE_FORMAT), profile_id)
}

/// All readable instances of a package, newest first.
pub fn find_backups(root: &StorageFile, package_name: &str) -> Result<Vec<Backup>> {
    let package_dir = match root.find_file(package_name)? {
        Some(dir) => dir,
        None => return Ok(Vec::new()),
    };

    let mut backups = Vec::new();
    for instance in package_dir.list_files()? {
        if instance.find_file(PROPERTIES_FILE)?.is_none() {
            continue;
        }
        match Backup::load(&instance) {
            Ok(backup) => backups.push(backup),
            Err(e) => warn!("Skipping unreadable backup {}: {}", instance.path().display(), e),
        }
    }
    backups.sort_by(|a, b| b.backup_date.cmp(&a.backup_date));
    Ok(backups)
}

/// Accumulates an instance record while its archives are written.
pub struct BackupBuilder {
    backup: Backup,
}

impl BackupBuilder {
    pub fn new(package: &Package, backup_date: NaiveDateTime) -> Self {
        Self {
            backup: Backup {
                backup_version_code: BACKUP_VERSION_CODE,
                package_name: package.package_name.clone(),
                package_label: package.label.clone(),
                version_name: package.version_name.clone(),
                version_code: package.version_code,
                profile_id: package.profile_id,
                source_dir: package.apk_path.clone(),
                split_source_dirs: package.split_apk_paths.clone(),
                backup_date,
                has_apk: false,
                has_app_data: false,
                has_device_protected_data: false,
                has_external_data: false,
                has_obb_data: false,
                has_media_data: false,
                compression_type: None,
                cipher_type: None,
                iv: None,
                size: 0,
                permissions: package.permissions.clone(),
                special_files: Vec::new(),
                dir: None,
            },
        }
    }

    pub fn set_flag(&mut self, category: Category, present: bool) -> &mut Self {
        *self.backup.flag_mut(category) = present;
        self
    }

    pub fn compression(&mut self, compression: Option<CompressionType>) -> &mut Self {
        self.backup.compression_type = compression;
        self
    }

    pub fn cipher(&mut self, cipher: Option<CipherType>, iv: Option<&[u8]>) -> &mut Self {
        self.backup.cipher_type = cipher;
        self.backup.iv = iv.map(|iv| STANDARD.encode(iv));
        self
    }

    pub fn special_files(&mut self, files: Vec<String>) -> &mut Self {
        self.backup.special_files = files;
        self
    }

    pub fn size(&mut self, size: u64) -> &mut Self {
        self.backup.size = size;
        self
    }

    pub fn build(self) -> Backup {
        self.backup
    }
}

/// Outcome of one backup or restore invocation.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub package_name: String,
    pub backup: Option<Backup>,
    pub message: String,
    pub succeeded: bool,
}

impl ActionResult {
    pub fn success(package_name: &str, backup: Option<Backup>) -> Self {
        Self {
            package_name: package_name.to_string(),
            backup,
            message: String::new(),
            succeeded: true,
        }
    }

    pub fn failure(package_name: &str, message: impl Into<String>) -> Self {
        Self {
            package_name: package_name.to_string(),
            backup: None,
            message: message.into(),
            succeeded: false,
        }
    }
}
