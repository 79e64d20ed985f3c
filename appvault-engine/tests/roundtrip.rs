//! Backup and restore of a real directory tree through `/bin/sh`, GNU
//! coreutils and tar.

use appvault_engine::actions::{ActionContext, BackupAction, RestoreAction};
use appvault_engine::config::{Config, EncryptionMode};
use appvault_engine::fs::walker::{walk_directory, WalkOptions};
use appvault_engine::model::{Category, Mode, Package};
use appvault_engine::packages::PackageSource;
use appvault_engine::shell::RootShell;
use appvault_engine::storage::{LocalTree, StorageFile};
use appvault_engine::{EngineError, Result};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const PACKAGE: &str = "org.example.notes";

/// The one package the test device has installed.
struct Installed(Package);

impl PackageSource for Installed {
    fn lookup(&self, package_name: &str, _profile_id: u32) -> Result<Package> {
        if package_name == self.0.package_name {
            Ok(self.0.clone())
        } else {
            Err(EngineError::PackageNotFound(package_name.to_string()))
        }
    }

    fn application_uid(&self, _package_name: &str, _profile_id: u32) -> Result<u32> {
        Ok(10_123)
    }
}

fn device_package(device: &Path) -> Package {
    let mut package = Package::app(PACKAGE, 0);
    package.apk_path = device
        .join("app")
        .join(format!("{}-1", PACKAGE))
        .join("base.apk")
        .to_string_lossy()
        .into_owned();
    package.data_path = device.join("data").join(PACKAGE).to_string_lossy().into_owned();
    package
}

fn populate(data: &Path) -> std::io::Result<()> {
    fs::create_dir_all(data.join("files"))?;
    fs::create_dir_all(data.join("shared_prefs"))?;
    fs::create_dir_all(data.join("databases"))?;
    fs::create_dir_all(data.join("cache"))?;
    fs::write(data.join("files/notes.txt"), "hello")?;
    fs::write(data.join("shared_prefs/prefs.xml"), "<map />")?;
    fs::write(data.join("cache/thumb.bin"), [0u8; 64])?;
    Ok(())
}

/// Relative paths with file content (empty for directories), sorted.
fn snapshot(root: &Path) -> Vec<(String, String)> {
    let options = WalkOptions {
        include_dirs: true,
        ..Default::default()
    };
    let mut entries: Vec<(String, String)> = walk_directory(root, &options)
        .unwrap()
        .into_iter()
        .map(|info| {
            let content = if info.is_dir {
                String::new()
            } else {
                fs::read_to_string(&info.path).unwrap()
            };
            (info.relative_path.to_string_lossy().into_owned(), content)
        })
        .collect();
    entries.sort();
    entries
}

fn context(temp_dir: &TempDir, package: &Package, tar_cmd: bool, encrypted: bool) -> ActionContext {
    let mut config = Config::unprivileged(&temp_dir.path().join("backups"), &temp_dir.path().join("cache"));
    config.backup.pause_apps = false;
    config.restore.pause_apps = false;
    config.backup.tar_cmd = tar_cmd;
    config.restore.tar_cmd = tar_cmd;
    config.restore.refresh_timeout_secs = 0;
    if encrypted {
        config.encryption.mode = EncryptionMode::Password;
        config.encryption.password = "correct horse".to_string();
        config.encryption.salt = "battery staple salt".to_string();
    }
    let storage = StorageFile::new(Arc::new(LocalTree::new()), &config.storage.backup_dir);
    ActionContext::new(
        config,
        Arc::new(RootShell::unelevated()),
        Arc::new(Installed(package.clone())),
        storage,
    )
    .unwrap()
}

fn round_trip(tar_cmd: bool, encrypted: bool) {
    let temp_dir = TempDir::new().unwrap();
    let device = temp_dir.path().join("device");
    let package = device_package(&device);
    let data = Path::new(&package.data_path).to_path_buf();
    populate(&data).unwrap();
    let apk = Path::new(&package.apk_path);
    fs::create_dir_all(apk.parent().unwrap()).unwrap();
    fs::write(apk, "PK\x03\x04 base").unwrap();
    let ctx = context(&temp_dir, &package, tar_cmd, encrypted);

    let backed_up = BackupAction::new(&ctx).run(&package, Mode::from_categories(&[Category::Apk, Category::Data]));
    assert!(backed_up.succeeded, "{}", backed_up.message);
    let backup = backed_up.backup.unwrap();
    assert!(backup.has_apk && backup.has_app_data);
    assert_eq!(backup.is_encrypted(), encrypted);
    let instance = backup.dir.as_ref().unwrap().path().to_path_buf();
    assert_eq!(fs::read(instance.join("base.apk")).unwrap(), b"PK\x03\x04 base");

    // the app keeps running and changes its data
    fs::remove_file(data.join("files/notes.txt")).unwrap();
    fs::write(data.join("files/stray.txt"), "new").unwrap();

    let restored = RestoreAction::new(&ctx).run(&package, &backup, Mode::DATA);
    assert!(restored.succeeded, "{}", restored.message);

    let expected: Vec<(String, String)> = vec![
        ("databases".into(), String::new()),
        ("files".into(), String::new()),
        ("files/notes.txt".into(), "hello".into()),
        ("shared_prefs".into(), String::new()),
        ("shared_prefs/prefs.xml".into(), "<map />".into()),
    ];
    assert_eq!(snapshot(&data), expected);

    // staging directories are gone
    let cache = temp_dir.path().join("cache");
    if cache.exists() {
        assert_eq!(fs::read_dir(&cache).unwrap().count(), 0);
    }
}

#[test]
fn test_round_trip_with_tar_library() {
    round_trip(false, false);
}

#[test]
fn test_round_trip_with_tar_command() {
    round_trip(true, false);
}

#[test]
fn test_encrypted_round_trip() {
    round_trip(false, true);
}
