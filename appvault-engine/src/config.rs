//! Configuration management for the archive engine.
//!
//! Loads configuration from a TOML file. Every field has a default so a
//! partial file (or none at all) is valid.

use crate::pipeline::CompressionType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub shell: ShellConfig,
    pub storage: StorageConfig,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
    pub encryption: EncryptionConfig,
    pub packages: PackagesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Binary used to elevate commands when not already root
    #[serde(default = "default_su_command")]
    pub su_command: String,

    /// Run commands through `su` at all
    #[serde(default = "default_true")]
    pub elevate: bool,

    /// Multi-call binary prefixed to file utilities (empty = plain PATH lookup)
    #[serde(default = "default_utilbox")]
    pub utilbox: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    /// Plain directory tree reachable by this process
    Local,
    /// Directory only reachable through the privileged shell
    Root,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the backup tree (`<root>/<package>/<instance>/`)
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    #[serde(default = "default_backend")]
    pub backend: StorageBackendKind,

    /// Scratch space for temp extraction, staging and special files
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Our own package name, substituted for `<ownPackage>` in patterns
    #[serde(default = "default_own_package")]
    pub own_package: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Stream data through the external `tar` instead of the tar library
    #[serde(default = "default_true")]
    pub tar_cmd: bool,

    #[serde(default = "default_true")]
    pub pause_apps: bool,

    /// Additionally suspend the app through the package manager
    #[serde(default)]
    pub suspend_apps: bool,

    #[serde(default)]
    pub backup_cache: bool,

    #[serde(default = "default_compression")]
    pub compression: CompressionType,

    /// Compression level (1-22 for zstd, clamped to 0-9 for gzip)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Top-level entries never archived
    #[serde(default = "default_excluded_basenames")]
    pub excluded_basenames: Vec<String>,

    /// Entries never archived at any depth
    #[serde(default = "default_excluded_names")]
    pub excluded_names: Vec<String>,

    #[serde(default = "default_cache_dirs")]
    pub cache_dirs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    #[serde(default = "default_true")]
    pub tar_cmd: bool,

    /// Extract straight into the target instead of through a temp dir
    #[serde(default)]
    pub avoid_temporary_copy: bool,

    #[serde(default = "default_true")]
    pub pause_apps: bool,

    /// Force-stop the app instead of only stopping its processes
    #[serde(default)]
    pub kill_apps: bool,

    #[serde(default)]
    pub restore_cache: bool,

    /// Re-grant recorded runtime permissions
    #[serde(default = "default_true")]
    pub restore_permissions: bool,

    /// Install with `-g` (grant everything)
    #[serde(default)]
    pub all_permissions: bool,

    #[serde(default)]
    pub allow_downgrade: bool,

    /// Use `pm install-create/-write/-commit` sessions
    #[serde(default = "default_true")]
    pub session_installer: bool,

    #[serde(default = "default_installer_package")]
    pub installer_package: String,

    #[serde(default)]
    pub bypass_low_target_sdk_block: bool,

    /// Turn off APK verification over ADB while installing
    #[serde(default)]
    pub disable_verification: bool,

    #[serde(default)]
    pub delay_before_refresh_secs: u64,

    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,

    #[serde(default = "default_excluded_basenames")]
    pub excluded_basenames: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    #[default]
    None,
    Password,
    PublicKey,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub mode: EncryptionMode,

    #[serde(default)]
    pub password: String,

    /// Argon2 salt (at least 8 bytes)
    #[serde(default)]
    pub salt: String,

    /// Recipient X25519 public key, hex
    #[serde(default)]
    pub public_key: String,

    /// X25519 secret key, hex; only needed for restores
    #[serde(default)]
    pub secret_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagesConfig {
    /// Packages never processed (regex)
    #[serde(default)]
    pub ignored: Option<String>,

    /// Packages never paused or killed (regex)
    #[serde(default = "default_do_not_stop")]
    pub do_not_stop: Option<String>,
}

// Default values
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_su_command() -> String {
    "su".to_string()
}

fn default_utilbox() -> String {
    "toybox".to_string()
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/sdcard/AppVault")
}

fn default_backend() -> StorageBackendKind {
    StorageBackendKind::Root
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/data/local/tmp/appvault")
}

fn default_own_package() -> String {
    "io.appvault".to_string()
}

fn default_compression() -> CompressionType {
    CompressionType::Zstd
}

fn default_compression_level() -> i32 {
    3
}

fn default_excluded_basenames() -> Vec<String> {
    vec!["lib".to_string()]
}

fn default_excluded_names() -> Vec<String> {
    vec!["com.google.android.gms.appid.xml".to_string()]
}

fn default_cache_dirs() -> Vec<String> {
    vec!["cache".to_string(), "code_cache".to_string()]
}

fn default_installer_package() -> String {
    "com.android.vending".to_string()
}

fn default_refresh_timeout() -> u64 {
    30
}

fn default_do_not_stop() -> Option<String> {
    Some(r"^(<ownPackage>|com\.android\.systemui|com\.android\.shell)$".to_string())
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            su_command: default_su_command(),
            elevate: true,
            utilbox: default_utilbox(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            backend: default_backend(),
            cache_dir: default_cache_dir(),
            own_package: default_own_package(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            tar_cmd: true,
            pause_apps: true,
            suspend_apps: false,
            backup_cache: false,
            compression: default_compression(),
            compression_level: default_compression_level(),
            excluded_basenames: default_excluded_basenames(),
            excluded_names: default_excluded_names(),
            cache_dirs: default_cache_dirs(),
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            tar_cmd: true,
            avoid_temporary_copy: false,
            pause_apps: true,
            kill_apps: false,
            restore_cache: false,
            restore_permissions: true,
            all_permissions: false,
            allow_downgrade: false,
            session_installer: true,
            installer_package: default_installer_package(),
            bypass_low_target_sdk_block: false,
            disable_verification: false,
            delay_before_refresh_secs: 0,
            refresh_timeout_secs: default_refresh_timeout(),
            excluded_basenames: default_excluded_basenames(),
        }
    }
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            ignored: None,
            do_not_stop: default_do_not_stop(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Configuration for running everything as the current user against a
    /// local directory tree. Used by tests and by `--unprivileged` runs.
    pub fn unprivileged(backup_dir: &Path, cache_dir: &Path) -> Self {
        let mut config = Config::default();
        config.shell.elevate = false;
        config.shell.utilbox = String::new();
        config.storage.backend = StorageBackendKind::Local;
        config.storage.backup_dir = backup_dir.to_path_buf();
        config.storage.cache_dir = cache_dir.to_path_buf();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [backup]
            compression = "gz"
            backup_cache = true

            [encryption]
            mode = "password"
            password = "hunter22"
            salt = "0123456789abcdef"
            "#,
        )
        .unwrap();

        assert_eq!(config.backup.compression, CompressionType::Gzip);
        assert!(config.backup.backup_cache);
        assert_eq!(config.backup.cache_dirs, vec!["cache", "code_cache"]);
        assert_eq!(config.encryption.mode, EncryptionMode::Password);
        assert_eq!(config.restore.refresh_timeout_secs, 30);
        assert_eq!(config.shell.utilbox, "toybox");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_from_file() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("appvault.toml");
        std::fs::write(
            &path,
            "[storage]\nbackend = \"local\"\nbackup_dir = \"/tmp/vault\"\n",
        )?;

        let config = Config::from_file(&path)?;
        assert_eq!(config.storage.backend, StorageBackendKind::Local);
        assert_eq!(config.storage.backup_dir, PathBuf::from("/tmp/vault"));
        assert!(config.restore.session_installer);
        Ok(())
    }
}
