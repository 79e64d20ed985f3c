//! Restore of special packages.
//!
//! A special package is a set of unrelated system files archived flat by
//! basename. Restore unpacks them into a staging directory, checks the set
//! is complete and moves each file to its own destination. Wi-Fi networks
//! are additionally pushed into the running Wi-Fi service; JSON dumps are
//! handed to a [`SpecialImporter`].

use super::restore::{open_archive, RestoreRun};
use crate::archive::{EntryFilter, TarLibrary, TarStrategy};
use crate::model::{Category, Package, PackageKind, SpecialKind};
use crate::shell::{quote, quote_multiple, Shell};
use crate::utils::errors::{EngineError, Result};
use crate::wifi;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Re-imports structured dumps (SMS/MMS, call logs) into the system
/// providers.
pub trait SpecialImporter: Send + Sync {
    fn import(&self, kind: SpecialKind, path: &str) -> Result<()>;
}

/// Importer for builds without provider access.
pub struct UnsupportedImporter;

impl SpecialImporter for UnsupportedImporter {
    fn import(&self, kind: SpecialKind, path: &str) -> Result<()> {
        Err(EngineError::Config(format!(
            "no importer for {:?} ({})",
            kind, path
        )))
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub(crate) fn restore_special_data(
    run: &RestoreRun<'_>,
    package: &Package,
    category: Category,
) -> Result<()> {
    let PackageKind::Special(kind) = package.kind else {
        return Err(EngineError::restore_failed(
            format!("{} is not a special package", package.package_name),
            None,
        ));
    };
    let shell = run.ctx.shell.as_ref();
    let files = if run.backup.special_files.is_empty() {
        &package.special_files
    } else {
        &run.backup.special_files
    };

    let staging = format!(
        "{}/{}-{}",
        run.ctx.cache_dir().trim_end_matches('/'),
        package.package_name,
        Uuid::new_v4().simple()
    );
    shell.run_checked(&format!("{} -p {}", shell.tool("mkdir"), quote(&staging)))?;

    let restored: Result<()> = (|| {
        let mut input = open_archive(run, category)?;
        TarLibrary.extract(
            shell,
            &mut input,
            &staging,
            &EntryFilter::default(),
            run.backup.is_legacy(),
        )?;

        let mut found = shell.list_directory(&staging)?;
        found.sort();
        let mut needed: Vec<String> = files.iter().map(|f| basename(f).to_string()).collect();
        needed.sort();
        if found != needed {
            return Err(EngineError::restore_failed(
                format!(
                    "Backup is missing files. Found [{}]; needed: [{}]",
                    found.join(", "),
                    needed.join(", ")
                ),
                None,
            ));
        }

        for file in files {
            move_into_place(shell, &format!("{}/{}", staging, basename(file)), file)?;
        }
        info!("Restored {} files of {}", files.len(), package.package_name);

        match kind {
            SpecialKind::Wifi => inject_wifi_networks(shell, files),
            SpecialKind::SmsMmsJson | SpecialKind::CallLogsJson => {
                import_dumps(run, kind, files)?
            }
            SpecialKind::Bluetooth => {}
        }
        Ok(())
    })();

    if let Err(e) = shell.run_checked(&format!("{} -rf {}", shell.tool("rm"), quote(&staging))) {
        warn!("Could not remove {}: {}", staging, e);
    }
    restored
}

/// Move one staged file over `dest`, taking over the owner and label of the
/// file it replaces (or of its directory).
fn move_into_place(shell: &dyn Shell, staged: &str, dest: &str) -> Result<()> {
    let parent = dest
        .rsplit_once('/')
        .map(|(p, _)| p)
        .filter(|p| !p.is_empty())
        .unwrap_or("/");
    if !shell.is_dir(parent)? {
        shell.run_checked(&format!("{} -p {}", shell.tool("mkdir"), quote(parent)))?;
    }
    let owner = match shell.owner_group_context(dest) {
        Ok(owner) => owner,
        Err(_) => shell.owner_group_context(parent)?,
    };

    let mut command = format!(
        "{mv} -f {src} {dst} && {chmod} 600 {dst} && {chown} {}:{} {dst}",
        owner.uid,
        owner.gid,
        mv = shell.tool("mv"),
        chmod = shell.tool("chmod"),
        chown = shell.tool("chown"),
        src = quote(staged),
        dst = quote(dest),
    );
    if owner.has_context() {
        command.push_str(&format!(
            " && {} -h {} {}",
            shell.tool("chcon"),
            quote(&owner.context),
            quote(dest)
        ));
    }
    shell.run_checked(&command)?;
    Ok(())
}

/// Best effort: the restored file stays the source of truth.
fn inject_wifi_networks(shell: &dyn Shell, files: &[String]) {
    let Some(store) = files
        .iter()
        .find(|f| basename(f) == "WifiConfigStore.xml")
    else {
        return;
    };
    let xml = match shell.run(&format!("{} {}", shell.tool("cat"), quote(store))) {
        Ok(result) if result.is_success() && !result.out.is_empty() => result.out.join("\n"),
        Ok(result) => {
            warn!("Could not read {}: {}", store, result.error_message());
            return;
        }
        Err(e) => {
            warn!("Could not read {}: {}", store, e);
            return;
        }
    };
    let networks = match wifi::parse_networks(&xml) {
        Ok(networks) => networks,
        Err(e) => {
            warn!("Could not decode {}: {}", store, e);
            return;
        }
    };

    for command in wifi::restore_commands(&networks) {
        match shell.run(&command) {
            Ok(result) if result.is_success() => debug!("Added network: {}", command),
            Ok(result) => warn!("Adding network failed: {}", result.error_message()),
            Err(e) => warn!("Adding network failed: {}", e),
        }
    }
    info!("Re-added {} Wi-Fi networks", networks.len());
}

/// Hand the dumps to the importer, then drop them either way.
fn import_dumps(run: &RestoreRun<'_>, kind: SpecialKind, files: &[String]) -> Result<()> {
    let shell = run.ctx.shell.as_ref();
    let imported = files
        .iter()
        .try_for_each(|file| run.ctx.importer.import(kind, file));
    if let Err(e) = shell.run_checked(&format!("{} -f {}", shell.tool("rm"), quote_multiple(files))) {
        warn!("Could not remove imported dumps: {}", e);
    }
    imported
}
