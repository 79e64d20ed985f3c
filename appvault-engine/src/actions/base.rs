//! Pieces shared by backup and restore: archive naming, the pause/resume
//! bracket around an app's processes, package pattern matching and tar
//! diagnostics.

use super::ActionContext;
use crate::config::PackagesConfig;
use crate::model::{Category, Package};
use crate::packages::PER_USER_RANGE;
use crate::pipeline::CompressionType;
use crate::shell::{quote, quote_multiple, Shell};
use crate::utils::errors::{EngineError, Result};
use regex::Regex;
use std::fmt;
use tracing::{debug, info, warn};

/// First uid handed out to regular applications.
pub const FIRST_APPLICATION_UID: u32 = 10_000;
pub const LAST_APPLICATION_UID: u32 = 19_999;
const FIRST_APPLICATION_CACHE_GID: u32 = 20_000;

/// `<category>.tar[.gz|.zst][.enc]`
pub fn backup_archive_filename(
    category: Category,
    compressed: bool,
    compression: CompressionType,
    encrypted: bool,
) -> String {
    let compression_suffix = if compressed {
        match compression {
            CompressionType::None => "",
            CompressionType::Zstd => ".zst",
            CompressionType::Gzip | CompressionType::Unsupported => ".gz",
        }
    } else {
        ""
    };
    let cipher_suffix = if encrypted { ".enc" } else { "" };
    format!(
        "{}.tar{}{}",
        category.archive_name(),
        compression_suffix,
        cipher_suffix
    )
}

/// Matches package names against the configured ignore / do-not-stop patterns.
#[derive(Debug, Clone, Default)]
pub struct PackageMatcher {
    ignored: Option<Regex>,
    do_not_stop: Option<Regex>,
}

impl PackageMatcher {
    pub fn new(config: &PackagesConfig, own_package: &str) -> Result<Self> {
        Ok(Self {
            ignored: compile(config.ignored.as_deref(), own_package)?,
            do_not_stop: compile(config.do_not_stop.as_deref(), own_package)?,
        })
    }

    pub fn is_ignored(&self, package_name: &str) -> bool {
        self.ignored
            .as_ref()
            .is_some_and(|r| r.is_match(package_name))
    }

    pub fn is_do_not_stop(&self, package_name: &str) -> bool {
        self.do_not_stop
            .as_ref()
            .is_some_and(|r| r.is_match(package_name))
    }
}

fn compile(pattern: Option<&str>, own_package: &str) -> Result<Option<Regex>> {
    let Some(pattern) = pattern.filter(|p| !p.trim().is_empty()) else {
        return Ok(None);
    };
    let pattern = pattern.replace("<ownPackage>", &regex::escape(own_package));
    Regex::new(&pattern)
        .map(Some)
        .map_err(|e| EngineError::Config(format!("invalid package pattern {}: {}", pattern, e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Backup,
    Restore,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Backup => "backup",
            Operation::Restore => "restore",
        })
    }
}

/// What `pause` did, so `resume` can undo exactly that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PausedApp {
    pub operation: Operation,
    pub package_name: String,
    pub profile_id: u32,
    pub pids: Vec<u32>,
    pub suspended: bool,
}

impl PausedApp {
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.operation, self.package_name, self.profile_id)
    }
}

/// Stop the app's processes before touching its data. Never fails: problems
/// are logged and the operation continues unpaused.
pub fn pause(ctx: &ActionContext, package: &Package, operation: Operation) -> Option<PausedApp> {
    let name = &package.package_name;
    if ctx.matcher.is_do_not_stop(name) {
        info!("{} is excluded from stopping", name);
        return None;
    }
    if package.is_special() {
        return None;
    }

    let uid = match ctx.packages.application_uid(name, package.profile_id) {
        Ok(uid) => uid,
        Err(e) => {
            warn!("Not pausing {}: {}", name, e);
            return None;
        }
    };
    if uid % PER_USER_RANGE < FIRST_APPLICATION_UID {
        debug!("Not pausing {}: system uid {}", name, uid);
        return None;
    }

    let mut paused = PausedApp {
        operation,
        package_name: name.clone(),
        profile_id: package.profile_id,
        pids: Vec::new(),
        suspended: false,
    };
    let shell = ctx.shell.as_ref();

    match operation {
        Operation::Restore if ctx.config.restore.kill_apps => {
            let command = format!("am force-stop --user {} {}", package.profile_id, quote(name));
            if let Err(e) = shell.run_checked(&command) {
                warn!("Could not stop {}: {}", name, e);
            }
            info!("Killed {}", paused.key());
            return Some(paused);
        }
        Operation::Backup if ctx.config.backup.suspend_apps => {
            let command = format!("pm suspend --user {} {}", package.profile_id, quote(name));
            match shell.run_checked(&command) {
                Ok(_) => paused.suspended = true,
                Err(e) => warn!("Could not suspend {}: {}", name, e),
            }
        }
        _ => {}
    }

    let pids = match shell.run(&format!("{} -U {}", shell.tool("pgrep"), uid)) {
        Ok(result) => result
            .out
            .iter()
            .filter_map(|l| l.trim().parse::<u32>().ok())
            .collect::<Vec<_>>(),
        Err(e) => {
            warn!("Could not list processes of {}: {}", name, e);
            Vec::new()
        }
    };
    if !pids.is_empty() {
        let command = format!("{} -STOP {}", shell.tool("kill"), join_pids(&pids));
        match shell.run_checked(&command) {
            Ok(_) => paused.pids = pids,
            Err(e) => warn!("Could not stop processes of {}: {}", name, e),
        }
    }

    info!("Paused {} ({} processes)", paused.key(), paused.pids.len());
    Some(paused)
}

/// Undo a `pause`. Consumes the record whatever happens.
pub fn resume(ctx: &ActionContext, paused: PausedApp) {
    let shell = ctx.shell.as_ref();
    if !paused.pids.is_empty() {
        let command = format!("{} -CONT {}", shell.tool("kill"), join_pids(&paused.pids));
        if let Err(e) = shell.run_checked(&command) {
            warn!("Could not continue processes of {}: {}", paused.package_name, e);
        }
    }
    if paused.suspended {
        let command = format!(
            "pm unsuspend --user {} {}",
            paused.profile_id,
            quote(&paused.package_name)
        );
        if let Err(e) = shell.run_checked(&command) {
            warn!("Could not unsuspend {}: {}", paused.package_name, e);
        }
    }
    info!("Resumed {}", paused.key());
}

fn join_pids(pids: &[u32]) -> String {
    pids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cache directories belong to the app's cache group (`u<user>_a<app>_cache`).
pub fn app_gid_to_cache_gid(gid: u32) -> u32 {
    let user = gid / PER_USER_RANGE;
    let app = gid % PER_USER_RANGE;
    if (FIRST_APPLICATION_UID..=LAST_APPLICATION_UID).contains(&app) {
        user * PER_USER_RANGE + app - FIRST_APPLICATION_UID + FIRST_APPLICATION_CACHE_GID
    } else {
        gid
    }
}

/// tar stderr lines that indicate a real problem.
pub fn significant_tar_errors(err: &str) -> Vec<&str> {
    err.lines()
        .filter(|line| {
            !(line.trim().is_empty()
                || line.contains("tar: unknown file type")
                || line.contains("tar: had errors"))
        })
        .collect()
}

/// Sockets and the like make tar exit non-zero; only fail when something
/// else was reported as well.
pub fn check_tar_result(code: i32, err: &str) -> Result<()> {
    if code != 0 {
        info!("tar returns: code {}: {}", code, err.trim());
    }
    let lines = significant_tar_errors(err);
    if !lines.is_empty() {
        let message = lines.join("\n");
        if code != 0 {
            return Err(EngineError::Script(message));
        }
        warn!("{}", message);
    }
    Ok(())
}

/// Remove the content of `target` except the `keep` names.
pub fn wipe_directory(shell: &dyn Shell, target: &str, keep: &[String]) -> Result<()> {
    if target.trim().is_empty() || target.trim_end_matches('/').is_empty() {
        warn!("Refusing to wipe {:?}", target);
        return Ok(());
    }
    let base = target.trim_end_matches('/');
    let victims: Vec<String> = shell
        .list_directory(target)?
        .into_iter()
        .filter(|name| !keep.contains(name))
        .map(|name| format!("{}/{}", base, name))
        .collect();
    if victims.is_empty() {
        return Ok(());
    }
    shell.run_checked(&format!("{} -rf {}", shell.tool("rm"), quote_multiple(&victims)))?;
    Ok(())
}
