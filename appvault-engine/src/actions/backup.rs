//! Backup of one package into a new instance directory.

use super::base::{backup_archive_filename, pause, resume, Operation};
use super::ActionContext;
use crate::archive::{self, EntryFilter, TarLibrary, TarStrategy};
use crate::model::backup::instance_dir_name;
use crate::model::{ActionResult, Backup, BackupBuilder, Category, Mode, Package, PackageKind};
use crate::pipeline::{self, generate_iv, CompressionType, Crypto, KeyMaterial};
use crate::shell::{quote, FileEntry, FileKind};
use crate::storage::StorageFile;
use crate::utils::errors::{EngineError, Result};
use chrono::{Local, NaiveDateTime, Timelike};
use std::cell::RefCell;
use std::io::Write;
use tracing::{debug, error, info, info_span, warn};

/// Produces the content of one category; `Ok(false)` means there was
/// nothing to back up and no archive was written.
type CategoryHandler = fn(&BackupRun<'_>, Category) -> Result<bool>;

fn handler_for(kind: PackageKind, category: Category) -> Option<CategoryHandler> {
    match (kind, category) {
        (PackageKind::App, Category::Apk) => Some(backup_apk),
        (PackageKind::App, _) => Some(backup_data),
        (PackageKind::Special(_), Category::Data) => Some(backup_special_files),
        (PackageKind::Special(_), _) => None,
    }
}

/// State shared by the category handlers of one invocation.
struct BackupRun<'a> {
    ctx: &'a ActionContext,
    package: &'a Package,
    dir: StorageFile,
    keys: Option<&'a KeyMaterial>,
    iv: &'a [u8],
    compression: CompressionType,
    strategy: Box<dyn TarStrategy>,
    filter: EntryFilter,
    /// Special files that made it into the archive
    archived_special: RefCell<Vec<String>>,
}

pub struct BackupAction<'a> {
    ctx: &'a ActionContext,
}

impl<'a> BackupAction<'a> {
    pub fn new(ctx: &'a ActionContext) -> Self {
        Self { ctx }
    }

    /// Back up the categories of `mode`. Never fails outward.
    pub fn run(&self, package: &Package, mode: Mode) -> ActionResult {
        let span = info_span!("backup", package = %package.package_name, user = package.profile_id);
        let _enter = span.enter();
        let name = &package.package_name;
        info!("Backing up {} (mode {:06b})", name, mode.0);

        let now = Local::now().naive_local();
        let date = now.with_nanosecond(0).unwrap_or(now);
        let dir = match self.create_instance_dir(package, &date) {
            Ok(dir) => dir,
            Err(e) => {
                error!("Backup of {} failed: {}", name, e);
                return ActionResult::failure(name, e.to_string());
            }
        };

        let paused = if self.ctx.config.backup.pause_apps {
            pause(self.ctx, package, Operation::Backup)
        } else {
            None
        };
        let result = self.backup_into(&dir, package, mode, date);
        if let Some(paused) = paused {
            resume(self.ctx, paused);
        }

        match result {
            Ok(backup) => {
                info!("Backup of {} finished ({} bytes)", name, backup.size);
                ActionResult::success(name, Some(backup))
            }
            Err(e) => {
                error!("Backup of {} failed: {}", name, e);
                if let Err(cleanup) = dir.delete() {
                    warn!("Could not remove {}: {}", dir.path().display(), cleanup);
                }
                ActionResult::failure(name, e.to_string())
            }
        }
    }

    fn create_instance_dir(&self, package: &Package, date: &NaiveDateTime) -> Result<StorageFile> {
        let inaccessible = |e: EngineError| {
            EngineError::StorageInaccessible(format!(
                "{}: {}",
                self.ctx.storage.path().display(),
                e
            ))
        };
        let package_dir = self
            .ctx
            .storage
            .create_directory(&package.package_name)
            .map_err(inaccessible)?;
        package_dir
            .create_directory(&instance_dir_name(date, package.profile_id))
            .map_err(inaccessible)
    }

    fn backup_into(
        &self,
        dir: &StorageFile,
        package: &Package,
        mode: Mode,
        date: NaiveDateTime,
    ) -> Result<Backup> {
        let config = &self.ctx.config.backup;
        let keys = KeyMaterial::for_backup(&self.ctx.config.encryption)?;
        let iv = if keys.is_some() { generate_iv() } else { Vec::new() };

        let run = BackupRun {
            ctx: self.ctx,
            package,
            dir: dir.clone(),
            keys: keys.as_ref(),
            iv: &iv,
            compression: config.compression,
            strategy: archive::select(config.tar_cmd, false),
            filter: EntryFilter::for_backup(config),
            archived_special: RefCell::new(Vec::new()),
        };
        debug!("Using {}", run.strategy.name());

        let mut builder = BackupBuilder::new(package, date);
        for category in Category::ALL {
            if !mode.contains(category) {
                continue;
            }
            self.ctx.check_cancelled()?;
            let Some(handler) = handler_for(package.kind, category) else {
                continue;
            };
            let present = handler(&run, category)?;
            builder.set_flag(category, present);
        }

        builder
            .special_files(run.archived_special.take())
            .compression(Some(config.compression))
            .cipher(
                keys.as_ref().map(KeyMaterial::cipher_type),
                keys.is_some().then_some(iv.as_slice()),
            );
        dir.invalidate_cache();
        builder.size(dir.size()?);

        let mut backup = builder.build();
        backup.save(dir)?;
        if backup.dir.is_none() {
            return Err(EngineError::backup_failed(
                "Backup properties have no storage location",
                None,
            ));
        }
        Ok(backup)
    }
}

/// Run the pipeline for one archive; a failed archive is deleted.
fn write_archive(
    run: &BackupRun<'_>,
    category: Category,
    write: impl FnOnce(&mut dyn Write) -> Result<()>,
) -> Result<()> {
    let name = backup_archive_filename(
        category,
        run.compression.is_compressed(),
        run.compression,
        run.keys.is_some(),
    );
    let file = run.dir.create_file(&name)?;

    let streamed: Result<()> = (|| {
        let crypto = run.keys.map(|keys| Crypto { keys, iv: run.iv });
        let mut sink = pipeline::open_write(
            file.open_output()?,
            run.compression,
            run.ctx.config.backup.compression_level,
            crypto,
        )?;
        write(&mut sink)?;
        sink.finish()?;
        Ok(())
    })();

    if let Err(e) = streamed {
        if let Err(cleanup) = file.delete() {
            debug!("Could not remove partial {}: {}", name, cleanup);
        }
        return Err(e);
    }
    debug!("Wrote {}", name);
    Ok(())
}

fn backup_apk(run: &BackupRun<'_>, _category: Category) -> Result<bool> {
    let package = run.package;
    let shell = run.ctx.shell.as_ref();
    if package.apk_path.trim().is_empty() {
        return Err(EngineError::backup_failed(
            format!("{} has no APK path", package.package_name),
            None,
        ));
    }

    let apks = std::iter::once(&package.apk_path).chain(package.split_apk_paths.iter());
    for apk in apks {
        if !shell.exists(apk)? {
            return Err(EngineError::backup_failed(
                format!("APK {} does not exist", apk),
                None,
            ));
        }
        let file_name = apk.rsplit('/').next().unwrap_or(apk);
        let target = run.dir.create_file(file_name)?;
        let mut sink = target.open_output()?;
        let command = format!("{} {}", shell.tool("cat"), quote(apk));
        let (code, err) = shell.run_piped_out(&command, &mut sink)?;
        if code != 0 {
            return Err(EngineError::ShellCommandFailed {
                command,
                code,
                message: err.trim().to_string(),
            });
        }
        sink.finish()?;

        target.invalidate_cache();
        if !target.exists()? {
            return Err(EngineError::backup_failed(
                format!("Copy of {} is missing", apk),
                None,
            ));
        }
        debug!("Copied {}", apk);
    }
    Ok(true)
}

fn backup_data(run: &BackupRun<'_>, category: Category) -> Result<bool> {
    let source = run.package.data_dir(category);
    if source.trim().is_empty() {
        return Ok(false);
    }

    let shell = run.ctx.shell.as_ref();
    let entries = match shell.list_directory_detailed(source, true) {
        Ok(entries) => entries,
        Err(e) if category.is_optional() && e.is_file_not_found() => {
            info!("No {} for {}", category, run.package.package_name);
            return Ok(false);
        }
        Err(e) => return Err(e),
    };
    let entries: Vec<FileEntry> = entries
        .into_iter()
        .filter(|e| run.filter.accepts(&e.relative_path))
        .collect();
    if entries.is_empty() {
        info!("Nothing to back up in {}", source);
        return Ok(false);
    }

    write_archive(run, category, |out| {
        run.strategy
            .create(shell, source, &entries, &run.filter, out)
    })?;
    Ok(true)
}

/// Special packages archive their files flat, by basename.
fn backup_special_files(run: &BackupRun<'_>, category: Category) -> Result<bool> {
    let shell = run.ctx.shell.as_ref();
    let mut entries = Vec::new();
    for path in &run.package.special_files {
        match shell.stat_entry(path) {
            Ok(entry) if entry.kind == FileKind::Regular => entries.push(entry),
            Ok(_) => warn!("Skipping {}: not a regular file", path),
            Err(e) => warn!("Skipping {}: {}", path, e),
        }
    }
    if entries.is_empty() {
        info!("None of the files of {} exist", run.package.package_name);
        return Ok(false);
    }

    write_archive(run, category, |out| {
        TarLibrary.create(shell, "/", &entries, &EntryFilter::default(), out)
    })?;
    *run.archived_special.borrow_mut() = entries.into_iter().map(|e| e.absolute_path).collect();
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{config_in, context_with, FakePackages};
    use crate::model::backup::PROPERTIES_FILE;
    use crate::packages::special;
    use crate::shell::fake::FakeShell;
    use crate::shell::ShellResult;
    use std::sync::Arc;
    use tempfile::TempDir;

    const DATA_LISTING: &[&str] = &[
        "directory|4096|10123|10123|771|1700000000|/data/user/0/org.example/files",
        "regular file|3|10123|10123|660|1700000001|/data/user/0/org.example/files/a",
        "directory|4096|10123|10123|771|1700000000|/data/user/0/org.example/cache",
    ];

    fn uncompressed(temp_dir: &TempDir) -> crate::config::Config {
        let mut config = config_in(temp_dir.path());
        config.backup.compression = CompressionType::None;
        config.backup.pause_apps = false;
        config
    }

    fn instance_files(result: &ActionResult) -> Vec<String> {
        let dir = result.backup.as_ref().unwrap().dir.as_ref().unwrap();
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_data_backup_through_tar_command() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let shell = Arc::new(FakeShell::new());
        shell.on("find '/data/user/0/org.example'", ShellResult::ok(DATA_LISTING));
        shell.stream("tar -cf -", b"tarball".to_vec());
        let ctx = context_with(uncompressed(&temp_dir), shell.clone(), FakePackages::with_uid(10123));

        let result = BackupAction::new(&ctx).run(&Package::app("org.example", 0), Mode::from_categories(&[Category::Data]));

        assert!(result.succeeded, "{}", result.message);
        let backup = result.backup.as_ref().unwrap();
        assert!(backup.has_app_data);
        assert!(!backup.is_encrypted());
        assert_eq!(instance_files(&result), vec!["backup.properties", "data.tar"]);
        let dir = backup.dir.as_ref().unwrap().path().to_path_buf();
        assert_eq!(std::fs::read(dir.join("data.tar"))?, b"tarball");
        assert!(backup.size >= 7);
        assert!(shell
            .commands()
            .contains(&"cd '/data/user/0/org.example' && tar -cf - --exclude='./lib' --exclude='./cache' --exclude='./code_cache' --exclude='com.google.android.gms.appid.xml' .".to_string()));
        Ok(())
    }

    #[test]
    fn test_empty_category_writes_no_archive() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let shell = Arc::new(FakeShell::new());
        // only the cache dir, which is excluded
        shell.on(
            "find '/data/user/0/org.example'",
            ShellResult::ok(&[DATA_LISTING[2]]),
        );
        shell.on(
            "find '/storage/emulated/0/Android/data/org.example'",
            ShellResult::failed(1, &["find: '/storage/emulated/0/Android/data/org.example': No such file or directory"]),
        );
        let ctx = context_with(uncompressed(&temp_dir), shell.clone(), FakePackages::with_uid(10123));

        let mode = Mode::from_categories(&[Category::Data, Category::External]);
        let result = BackupAction::new(&ctx).run(&Package::app("org.example", 0), mode);

        assert!(result.succeeded, "{}", result.message);
        let backup = result.backup.as_ref().unwrap();
        assert!(!backup.has_app_data);
        assert!(!backup.has_external_data);
        assert_eq!(instance_files(&result), vec![PROPERTIES_FILE]);
        assert!(!shell.commands().iter().any(|c| c.contains("tar -cf")));
        Ok(())
    }

    #[test]
    fn test_failed_archive_removes_instance() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let shell = Arc::new(FakeShell::new());
        shell.on("find '/data/user/0/org.example'", ShellResult::ok(DATA_LISTING));
        shell.on("tar -cf -", ShellResult::failed(2, &["tar: files/a: Read error"]));
        let config = uncompressed(&temp_dir);
        let backups = config.storage.backup_dir.clone();
        let ctx = context_with(config, shell, FakePackages::with_uid(10123));

        let result = BackupAction::new(&ctx).run(&Package::app("org.example", 0), Mode::DATA);

        assert!(!result.succeeded);
        assert_eq!(result.message, "tar: files/a: Read error");
        assert_eq!(std::fs::read_dir(backups.join("org.example"))?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_apk_and_encrypted_data_with_tar_library() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let mut config = config_in(temp_dir.path());
        config.backup.tar_cmd = false;
        config.backup.pause_apps = false;
        config.encryption.mode = crate::config::EncryptionMode::Password;
        config.encryption.password = "hunter22".to_string();
        config.encryption.salt = "0123456789abcdef".to_string();

        let shell = Arc::new(FakeShell::new());
        shell.stream("cat '/data/app/org.example-1/base.apk'", b"PK base".to_vec());
        shell.stream("cat '/data/app/org.example-1/split_de.apk'", b"PK split".to_vec());
        shell.stream("cat '/data/user/0/org.example/files/a'", b"abc".to_vec());
        shell.on("find '/data/user/0/org.example'", ShellResult::ok(DATA_LISTING));
        let ctx = context_with(config, shell, FakePackages::with_uid(10123));

        let mut package = Package::app("org.example", 0);
        package.apk_path = "/data/app/org.example-1/base.apk".to_string();
        package.split_apk_paths = vec!["/data/app/org.example-1/split_de.apk".to_string()];
        let mode = Mode::from_categories(&[Category::Apk, Category::Data]);
        let result = BackupAction::new(&ctx).run(&package, mode);

        assert!(result.succeeded, "{}", result.message);
        let backup = result.backup.as_ref().unwrap();
        assert!(backup.has_apk && backup.has_app_data);
        assert_eq!(backup.compression_type, Some(CompressionType::Zstd));
        assert_eq!(backup.iv_bytes().unwrap().len(), crate::pipeline::IV_LEN);
        assert_eq!(
            instance_files(&result),
            vec!["backup.properties", "base.apk", "data.tar.zst.enc", "split_de.apk"]
        );
        let dir = backup.dir.as_ref().unwrap().path().to_path_buf();
        assert_eq!(std::fs::read(dir.join("split_de.apk"))?, b"PK split");
        Ok(())
    }

    #[test]
    fn test_special_package_archives_existing_files() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let shell = Arc::new(FakeShell::new());
        shell.on(
            "WifiConfigStore.xml'",
            ShellResult::ok(&["regular file|9|1010|1010|600|1700000000|/data/misc/apexdata/com.android.wifi/WifiConfigStore.xml"]),
        );
        shell.on("WifiConfigStoreSoftAp.xml'", ShellResult::failed(1, &["stat: No such file or directory"]));
        let mut config = config_in(temp_dir.path());
        config.backup.compression = CompressionType::None;
        let ctx = context_with(config, shell.clone(), FakePackages::with_uid(10123));

        let wifi = special::lookup("special.wifi.access.points", 0, "/x").unwrap();
        let result = BackupAction::new(&ctx).run(&wifi, Mode::ALL);

        assert!(result.succeeded, "{}", result.message);
        let backup = result.backup.as_ref().unwrap();
        assert!(backup.has_app_data);
        assert_eq!(
            backup.special_files,
            vec!["/data/misc/apexdata/com.android.wifi/WifiConfigStore.xml"]
        );
        assert_eq!(instance_files(&result), vec!["backup.properties", "data.tar"]);
        // special packages are never paused
        assert!(!shell.commands().iter().any(|c| c.contains("pgrep")));
        Ok(())
    }
}
