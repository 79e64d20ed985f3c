//! Package database access.
//!
//! The engine only needs a narrow view of the package manager: resolving a
//! package (paths, version, permissions), refreshing it after an install and
//! looking up its uid for pausing.

pub mod special;

use crate::model::Package;
use crate::shell::{quote, Shell};
use crate::utils::errors::{EngineError, Result};
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// Per-user uid range size on Android.
pub const PER_USER_RANGE: u32 = 100_000;

pub trait PackageSource: Send + Sync {
    fn lookup(&self, package_name: &str, profile_id: u32) -> Result<Package>;

    /// Re-read a package after it was (re)installed.
    fn refresh(&self, package: &Package) -> Result<Package> {
        if package.is_special() {
            return Ok(package.clone());
        }
        self.lookup(&package.package_name, package.profile_id)
    }

    fn application_uid(&self, package_name: &str, profile_id: u32) -> Result<u32>;
}

/// [`PackageSource`] backed by `pm` and `dumpsys` through the shell.
pub struct ShellPackageSource {
    shell: Arc<dyn Shell>,
    exchange_dir: String,
}

impl ShellPackageSource {
    pub fn new(shell: Arc<dyn Shell>, exchange_dir: &str) -> Self {
        Self {
            shell,
            exchange_dir: exchange_dir.to_string(),
        }
    }

    fn apk_paths(&self, package_name: &str, profile_id: u32) -> Result<Vec<String>> {
        let command = format!("pm path --user {} {}", profile_id, quote(package_name));
        let result = self.shell.run(&command)?;
        let paths: Vec<String> = result
            .out
            .iter()
            .filter_map(|l| l.trim().strip_prefix("package:"))
            .map(str::to_string)
            .collect();
        if paths.is_empty() {
            return Err(EngineError::PackageNotFound(package_name.to_string()));
        }
        Ok(paths)
    }
}

impl PackageSource for ShellPackageSource {
    fn lookup(&self, package_name: &str, profile_id: u32) -> Result<Package> {
        if special::is_special(package_name) {
            return special::lookup(package_name, profile_id, &self.exchange_dir)
                .ok_or_else(|| EngineError::PackageNotFound(package_name.to_string()));
        }

        let mut package = Package::app(package_name, profile_id);
        let mut paths = self.apk_paths(package_name, profile_id)?;
        let base = paths
            .iter()
            .position(|p| p.ends_with("/base.apk"))
            .unwrap_or(0);
        package.apk_path = paths.remove(base);
        package.split_apk_paths = paths;

        let command = format!("dumpsys package {}", quote(package_name));
        let dump = self.shell.run(&command)?;
        apply_dumpsys(&mut package, &dump.out);
        debug!(
            "Resolved {} {} ({} splits, {} permissions)",
            package.package_name,
            package.version_name,
            package.split_apk_paths.len(),
            package.permissions.len()
        );
        Ok(package)
    }

    fn application_uid(&self, package_name: &str, profile_id: u32) -> Result<u32> {
        let command = format!(
            "pm list packages -U --user {} {}",
            profile_id,
            quote(package_name)
        );
        let result = self.shell.run_checked(&command)?;
        let uid = parse_package_uid(&result.out, package_name)
            .ok_or_else(|| EngineError::PackageNotFound(package_name.to_string()))?;
        // some releases print the app id only
        Ok(if uid < PER_USER_RANGE {
            profile_id * PER_USER_RANGE + uid
        } else {
            uid
        })
    }
}

/// Find `package:<name> uid:<uid>` for exactly `package_name`.
fn parse_package_uid(lines: &[String], package_name: &str) -> Option<u32> {
    let pattern = Regex::new(r"^package:(\S+)\s+uid:(\d+)").ok()?;
    lines.iter().find_map(|line| {
        let caps = pattern.captures(line.trim())?;
        (caps.get(1)?.as_str() == package_name)
            .then(|| caps.get(2)?.as_str().parse().ok())
            .flatten()
    })
}

/// Fill version, data dir and granted runtime permissions from `dumpsys package`.
fn apply_dumpsys(package: &mut Package, lines: &[String]) {
    let mut runtime_indent: Option<usize> = None;
    for line in lines {
        let indent = line.len() - line.trim_start().len();
        let trimmed = line.trim();

        if let Some(header) = runtime_indent {
            if indent <= header || trimmed.is_empty() {
                runtime_indent = None;
            } else if let Some((name, rest)) = trimmed.split_once(": ") {
                if rest.starts_with("granted=true") && !package.permissions.iter().any(|p| p == name) {
                    package.permissions.push(name.to_string());
                }
                continue;
            }
        }

        if trimmed == "runtime permissions:" {
            runtime_indent = Some(indent);
        } else if let Some(v) = trimmed.strip_prefix("versionName=") {
            if package.version_name.is_empty() {
                package.version_name = v.to_string();
            }
        } else if let Some(v) = trimmed.strip_prefix("versionCode=") {
            if package.version_code == 0 {
                let code = v.split_whitespace().next().unwrap_or("0");
                package.version_code = code.parse().unwrap_or(0);
            }
        } else if let Some(v) = trimmed.strip_prefix("dataDir=") {
            // dataDir is reported for user 0; keep the per-user path otherwise
            if package.profile_id == 0 && !v.is_empty() {
                package.data_path = v.to_string();
            }
        }
    }
}
