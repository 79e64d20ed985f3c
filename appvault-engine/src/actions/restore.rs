//! Restore of one backup instance onto the device.
//!
//! The APK goes first (so the package manager assigns paths and ids), then
//! each requested data category is unpacked into the app's directories and
//! handed back to the app's uid, gid and SELinux label.

use super::base::{app_gid_to_cache_gid, backup_archive_filename, pause, resume, wipe_directory, Operation};
use super::{special, ActionContext};
use crate::archive::{EntryFilter, TarCommand, TarLibrary, TarStrategy};
use crate::model::backup::find_backups;
use crate::model::{ActionResult, Backup, Category, Mode, Package, PackageKind};
use crate::pipeline::{self, CompressionType, Crypto, KeyMaterial};
use crate::shell::{quote, quote_multiple, OwnerGroupContext, Shell};
use crate::storage::StorageFile;
use crate::utils::errors::{EngineError, Result};
use regex::Regex;
use std::io::Read;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

/// Preferred place for staging APKs, readable by the package manager.
const APK_STAGING_DIR: &str = "/data/local/tmp";

type RestoreHandler = fn(&RestoreRun<'_>, &Package, Category) -> Result<()>;

fn handler_for(kind: PackageKind, category: Category) -> Option<RestoreHandler> {
    match (kind, category) {
        (PackageKind::App, Category::Apk) => Some(restore_apk),
        (PackageKind::App, _) => Some(restore_data),
        (PackageKind::Special(_), Category::Data) => Some(special::restore_special_data),
        (PackageKind::Special(_), _) => None,
    }
}

/// State shared by the category handlers of one invocation.
pub(crate) struct RestoreRun<'a> {
    pub(crate) ctx: &'a ActionContext,
    pub(crate) backup: &'a Backup,
    /// Instance directory holding the archives
    pub(crate) dir: StorageFile,
}

pub struct RestoreAction<'a> {
    ctx: &'a ActionContext,
}

impl<'a> RestoreAction<'a> {
    pub fn new(ctx: &'a ActionContext) -> Self {
        Self { ctx }
    }

    /// Restore the categories of `mode` that `backup` holds. Never fails outward.
    pub fn run(&self, package: &Package, backup: &Backup, mode: Mode) -> ActionResult {
        let span = info_span!("restore", package = %package.package_name, user = package.profile_id);
        let _enter = span.enter();
        let name = &package.package_name;
        info!(
            "Restoring {} from {} (mode {:06b})",
            name,
            backup.instance_dir_name(),
            mode.0
        );

        let paused = if self.ctx.config.restore.pause_apps {
            pause(self.ctx, package, Operation::Restore)
        } else {
            None
        };
        let result = self.restore_package(package, backup, mode);
        if let Some(paused) = paused {
            resume(self.ctx, paused);
        }

        match result {
            Ok(()) => {
                info!("Restore of {} finished", name);
                ActionResult::success(name, Some(backup.clone()))
            }
            Err(e) => {
                error!("Restore of {} failed: {}", name, e);
                ActionResult::failure(name, e.to_string())
            }
        }
    }

    /// The instance directory, re-discovered when the record carries none.
    fn locate(&self, backup: &Backup) -> Result<StorageFile> {
        if let Some(dir) = &backup.dir {
            if dir.exists()? {
                return Ok(dir.clone());
            }
        }
        find_backups(&self.ctx.storage, &backup.package_name)?
            .into_iter()
            .find(|b| b.backup_date == backup.backup_date && b.profile_id == backup.profile_id)
            .and_then(|b| b.dir)
            .ok_or_else(|| EngineError::restore_failed("No backup file exists", None))
    }

    fn restore_package(&self, package: &Package, backup: &Backup, mode: Mode) -> Result<()> {
        let run = RestoreRun {
            ctx: self.ctx,
            backup,
            dir: self.locate(backup)?,
        };

        if mode.contains(Category::Apk) && backup.has_apk {
            if let Some(handler) = handler_for(package.kind, Category::Apk) {
                self.ctx.check_cancelled()?;
                handler(&run, package, Category::Apk)?;
            }
        }

        let wanted: Vec<Category> = Category::DATA
            .into_iter()
            .filter(|c| mode.contains(*c) && backup.has(*c))
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }

        let package = if package.is_special() {
            package.clone()
        } else {
            wait_for_package(self.ctx, package)?
        };
        for category in wanted {
            self.ctx.check_cancelled()?;
            let Some(handler) = handler_for(package.kind, category) else {
                continue;
            };
            handler(&run, &package, category)?;
        }
        Ok(())
    }
}

/// Poll the package manager until it reports real paths for `package`.
pub(crate) fn wait_for_package(ctx: &ActionContext, package: &Package) -> Result<Package> {
    let config = &ctx.config.restore;
    if config.delay_before_refresh_secs > 0 {
        thread::sleep(Duration::from_secs(config.delay_before_refresh_secs));
    }

    let mut waited = 0;
    loop {
        ctx.check_cancelled()?;
        match ctx.packages.refresh(package) {
            Ok(refreshed) if refreshed.has_plausible_paths() => return Ok(refreshed),
            Ok(_) => debug!("{} has no data paths yet", package.package_name),
            Err(e) => debug!("{} not visible yet: {}", package.package_name, e),
        }
        if waited >= config.refresh_timeout_secs {
            return Err(EngineError::PackageManagerDataIncomplete(
                config.refresh_timeout_secs,
            ));
        }
        thread::sleep(Duration::from_secs(1));
        waited += 1;
    }
}

/// An archive file together with how it was written.
#[derive(Debug)]
pub(crate) struct FoundArchive {
    pub(crate) file: StorageFile,
    pub(crate) compression: CompressionType,
    pub(crate) encrypted: bool,
}

/// Locate the archive of `category`, trying the recorded variant first and
/// then every other compression and encryption combination.
pub(crate) fn find_backup_archive(
    dir: &StorageFile,
    category: Category,
    backup: &Backup,
) -> Result<FoundArchive> {
    let recorded = if backup.is_compressed() {
        backup.compression_type.unwrap_or(CompressionType::None)
    } else {
        CompressionType::None
    };
    let compressions: Vec<CompressionType> = std::iter::once(recorded)
        .chain(CompressionType::ALL.into_iter().filter(|c| *c != recorded))
        .collect();

    let mut attempt = 0;
    for encrypted in [backup.is_encrypted(), !backup.is_encrypted()] {
        for &compression in &compressions {
            attempt += 1;
            let name =
                backup_archive_filename(category, compression.is_compressed(), compression, encrypted);
            match dir.find_file(&name) {
                Ok(Some(file)) => {
                    if attempt > 1 {
                        warn!(
                            "{} does not match the recorded archive variant, using it anyway",
                            name
                        );
                    }
                    return Ok(FoundArchive {
                        file,
                        compression,
                        encrypted,
                    });
                }
                Ok(None) => {}
                Err(e) => debug!("Could not look for {}: {}", name, e),
            }
        }
    }
    Err(EngineError::restore_failed(
        format!("no backup archive variant found for {}", category),
        None,
    ))
}

/// Plain tar stream of the archive of `category`.
pub(crate) fn open_archive(run: &RestoreRun<'_>, category: Category) -> Result<Box<dyn Read + Send>> {
    let found = find_backup_archive(&run.dir, category, run.backup)?;
    debug!("Reading {}", found.file.name());
    let raw = found.file.open_input()?;
    if !found.encrypted {
        return pipeline::open_read(raw, found.compression, None);
    }
    let keys = KeyMaterial::for_restore(&run.ctx.config.encryption, run.backup.cipher_type)?;
    let iv = run.backup.iv_bytes()?;
    pipeline::open_read(raw, found.compression, Some(Crypto { keys: &keys, iv: &iv }))
}

fn restore_data(run: &RestoreRun<'_>, package: &Package, category: Category) -> Result<()> {
    let ctx = run.ctx;
    let shell = ctx.shell.as_ref();
    let config = &ctx.config.restore;
    let target = package.data_dir(category).trim_end_matches('/').to_string();
    if !target.contains(&package.package_name) {
        return Err(EngineError::restore_failed(
            format!("path '{}' does not contain {}", target, package.package_name),
            None,
        ));
    }

    let owner = match category {
        Category::Data | Category::DeviceProtected => {
            if !shell.is_dir(&target)? {
                return Err(EngineError::restore_failed(
                    format!("directory '{}' does not exist", target),
                    None,
                ));
            }
            shell.owner_group_context(&target)?
        }
        _ => {
            let owner = owner_with_fallback(shell, package, &target)?;
            shell.run_checked(&format!("{} -p {}", shell.tool("mkdir"), quote(&target)))?;
            owner
        }
    };

    let cache_dirs = &ctx.config.backup.cache_dirs;
    let filter = EntryFilter::for_restore(config, cache_dirs);
    let legacy = run.backup.is_legacy();
    let mut input = open_archive(run, category)?;
    info!("Restoring {} into {}", category, target);

    if config.tar_cmd && !legacy {
        wipe_directory(shell, &target, &config.excluded_basenames)?;
        TarCommand.extract(shell, &mut input, &target, &filter, legacy)?;
    } else if config.avoid_temporary_copy {
        wipe_directory(shell, &target, &config.excluded_basenames)?;
        TarLibrary.extract(shell, &mut input, &target, &filter, legacy)?;
    } else {
        extract_through_staging(run, &mut input, &target, &filter, legacy)?;
    }

    restore_ownership(shell, &target, &owner, cache_dirs)
}

/// Owner of `target`; for a missing external directory the uid comes from
/// the app's data directory and gid and label from the parent directory.
fn owner_with_fallback(shell: &dyn Shell, package: &Package, target: &str) -> Result<OwnerGroupContext> {
    match shell.owner_group_context(target) {
        Ok(owner) => Ok(owner),
        Err(e) => {
            debug!("No owner for {}: {}", target, e);
            let app = shell.owner_group_context(&package.data_path)?;
            let parent = target
                .rsplit_once('/')
                .map(|(p, _)| p)
                .filter(|p| !p.is_empty())
                .unwrap_or("/");
            let parent = shell.owner_group_context(parent)?;
            Ok(OwnerGroupContext {
                uid: app.uid,
                gid: parent.gid,
                context: parent.context,
            })
        }
    }
}

/// Unpack into a scratch directory first and only replace the target's
/// content once the archive was read completely.
fn extract_through_staging(
    run: &RestoreRun<'_>,
    input: &mut dyn Read,
    target: &str,
    filter: &EntryFilter,
    legacy: bool,
) -> Result<()> {
    let shell = run.ctx.shell.as_ref();
    let staging = format!(
        "{}/restore_{}",
        run.ctx.cache_dir().trim_end_matches('/'),
        Uuid::new_v4().simple()
    );
    shell.run_checked(&format!("{} -p {}", shell.tool("mkdir"), quote(&staging)))?;

    let moved: Result<()> = (|| {
        TarLibrary.extract(shell, input, &staging, filter, legacy)?;
        wipe_directory(shell, target, &run.ctx.config.restore.excluded_basenames)?;
        let children: Vec<String> = shell
            .list_directory(&staging)?
            .into_iter()
            .map(|name| format!("{}/{}", staging, name))
            .collect();
        if children.is_empty() {
            return Ok(());
        }
        shell.run_checked(&format!(
            "{} -f {} {}",
            shell.tool("mv"),
            quote_multiple(&children),
            quote(&format!("{}/", target))
        ))?;
        Ok(())
    })();

    if let Err(e) = shell.run_checked(&format!("{} -rf {}", shell.tool("rm"), quote(&staging))) {
        warn!("Could not remove {}: {}", staging, e);
    }
    moved
}

/// Hand the restored tree back to the app. Every child is chowned, including
/// entries the wipe kept, since a foreign owner breaks SELinux access; cache
/// directories belong to the app's cache group. Each step must succeed.
fn restore_ownership(
    shell: &dyn Shell,
    target: &str,
    owner: &OwnerGroupContext,
    cache_dirs: &[String],
) -> Result<()> {
    let (cache, other): (Vec<String>, Vec<String>) = shell
        .list_directory(target)?
        .into_iter()
        .partition(|name| cache_dirs.contains(name));
    let children = |names: Vec<String>| {
        quote_multiple(names.iter().map(|name| format!("{}/{}", target, name)))
    };

    let chown = shell.tool("chown");
    let mut commands = vec![format!("{} {}:{} {}", chown, owner.uid, owner.gid, quote(target))];
    if !other.is_empty() {
        commands.push(format!(
            "{} -R {}:{} {}",
            chown,
            owner.uid,
            owner.gid,
            children(other)
        ));
    }
    if !cache.is_empty() {
        commands.push(format!(
            "{} -R {}:{} {}",
            chown,
            owner.uid,
            app_gid_to_cache_gid(owner.gid),
            children(cache)
        ));
    }
    if owner.has_context() {
        commands.push(format!(
            "{} -R -h -v {} {}",
            shell.tool("chcon"),
            quote(&owner.context),
            quote(target)
        ));
    }
    for command in &commands {
        shell.run_checked(command)?;
    }
    Ok(())
}

fn restore_apk(run: &RestoreRun<'_>, package: &Package, _category: Category) -> Result<()> {
    let ctx = run.ctx;
    let shell = ctx.shell.as_ref();
    let config = &ctx.config.restore;

    let base_name = run.backup.base_apk_name();
    let base = run.dir.find_file(&base_name)?.ok_or_else(|| {
        EngineError::restore_failed(format!("{} is missing in backup", base_name), None)
    })?;
    let mut apks = vec![base];
    for file in run.dir.list_files()? {
        let name = file.name();
        if name.ends_with(".apk") && name != base_name && matches!(file.is_dir(), Ok(false)) {
            apks.push(file);
        }
    }

    let staging_dir = if shell.is_dir(APK_STAGING_DIR)? {
        APK_STAGING_DIR.to_string()
    } else {
        let dir = format!("{}/apkTmp", ctx.cache_dir().trim_end_matches('/'));
        shell.run_checked(&format!("{} -p {}", shell.tool("mkdir"), quote(&dir)))?;
        dir
    };

    let mut staged: Vec<(String, u64)> = Vec::new();
    let installed = stage_and_install(run, package, &apks, &staging_dir, &mut staged);
    if !staged.is_empty() {
        let paths: Vec<&str> = staged.iter().map(|(p, _)| p.as_str()).collect();
        if let Err(e) = shell.run_checked(&format!("{} -f {}", shell.tool("rm"), quote_multiple(paths))) {
            warn!("Could not remove staged APKs: {}", e);
        }
    }
    installed?;

    if config.restore_permissions && !config.all_permissions {
        grant_permissions(shell, package, &run.backup.permissions);
    }
    Ok(())
}

fn stage_and_install(
    run: &RestoreRun<'_>,
    package: &Package,
    apks: &[StorageFile],
    staging_dir: &str,
    staged: &mut Vec<(String, u64)>,
) -> Result<()> {
    let ctx = run.ctx;
    let shell = ctx.shell.as_ref();
    let config = &ctx.config.restore;

    for apk in apks {
        let path = format!("{}/{}.{}", staging_dir, package.package_name, apk.name());
        let size = apk.size()?;
        staged.push((path.clone(), size));
        let command = format!("{} > {}", shell.tool("cat"), quote(&path));
        let (code, err) = shell.run_piped_in(&command, &mut apk.open_input()?)?;
        if code != 0 {
            return Err(EngineError::ShellCommandFailed {
                command,
                code,
                message: err.trim().to_string(),
            });
        }
    }

    if config.disable_verification {
        set_adb_verification(shell, false);
    }
    let installed = if config.session_installer {
        install_session(ctx, package, staged)
    } else {
        install_legacy(ctx, package, staged)
    };
    if config.disable_verification {
        set_adb_verification(shell, true);
    }
    installed
}

fn set_adb_verification(shell: &dyn Shell, enabled: bool) {
    let command = format!(
        "settings put global verifier_verify_adb_installs {}",
        u8::from(enabled)
    );
    if let Err(e) = shell.run_checked(&command) {
        warn!("Could not switch APK verification: {}", e);
    }
}

fn install_flags(ctx: &ActionContext) -> String {
    let config = &ctx.config.restore;
    let mut flags = String::new();
    if config.all_permissions {
        flags.push_str(" -g");
    }
    if config.allow_downgrade {
        flags.push_str(" -d");
    }
    if config.bypass_low_target_sdk_block {
        flags.push_str(" --bypass-low-target-sdk-block");
    }
    flags
}

fn install_session(ctx: &ActionContext, package: &Package, staged: &[(String, u64)]) -> Result<()> {
    let shell = ctx.shell.as_ref();
    let total: u64 = staged.iter().map(|(_, size)| size).sum();
    let create = format!(
        "pm install-create{} -i {} -t -r -S {} --user {}",
        install_flags(ctx),
        quote(&ctx.config.restore.installer_package),
        total,
        package.profile_id
    );
    let created = shell.run_checked(&create)?;

    let session_id = Regex::new(r"(\d+)").map_err(|e| EngineError::Parse(e.to_string()))?;
    let session = created
        .out
        .first()
        .and_then(|line| session_id.captures(line))
        .map(|c| c[1].to_string())
        .ok_or_else(|| {
            EngineError::UnexpectedCommandResult(format!(
                "no install session in: {}",
                created.out.join("\n")
            ))
        })?;
    debug!("Install session {} for {}", session, package.package_name);

    let mut commands: Vec<String> = staged
        .iter()
        .map(|(path, size)| {
            let split_name = path.rsplit('/').next().unwrap_or(path);
            format!(
                "{} {} | pm install-write -S {} {} {}",
                shell.tool("cat"),
                quote(path),
                size,
                session,
                quote(split_name)
            )
        })
        .collect();
    commands.push(format!("pm install-commit {}", session));
    for command in &commands {
        if let Err(e) = shell.run_checked(command) {
            let abandon = format!("pm install-abandon {}", session);
            if let Err(abandon_err) = shell.run_checked(&abandon) {
                warn!("Could not abandon install session {}: {}", session, abandon_err);
            }
            return Err(e);
        }
    }
    Ok(())
}

/// One `pm install` per APK; splits attach to the base with `-p`.
fn install_legacy(ctx: &ActionContext, package: &Package, staged: &[(String, u64)]) -> Result<()> {
    let shell = ctx.shell.as_ref();
    for (index, (path, size)) in staged.iter().enumerate() {
        let parent = if index == 0 {
            String::new()
        } else {
            format!(" -p {}", quote(&package.package_name))
        };
        let command = format!(
            "{} {} | pm install{}{} -i {} -t -r -S {} --user {}",
            shell.tool("cat"),
            quote(path),
            parent,
            install_flags(ctx),
            quote(&ctx.config.restore.installer_package),
            size,
            package.profile_id
        );
        let result = shell.run(&command)?;
        if result.is_success() {
            continue;
        }
        // split installs report permission grant problems that do not matter
        if index > 0 && result.error_message().contains("grant") {
            warn!("Split {} reported: {}", path, result.error_message());
            continue;
        }
        return Err(EngineError::shell_failed(&command, &result));
    }
    Ok(())
}

fn grant_permissions(shell: &dyn Shell, package: &Package, permissions: &[String]) {
    for permission in permissions {
        let command = format!(
            "pm grant --user {} {} {}",
            package.profile_id,
            quote(&package.package_name),
            quote(permission)
        );
        if let Err(e) = shell.run_checked(&command) {
            warn!("Could not grant {}: {}", permission, e);
        }
    }
}
