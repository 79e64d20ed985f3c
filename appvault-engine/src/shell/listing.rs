//! Parsing of `stat` output produced through the shell.

use crate::utils::errors::{EngineError, Result};
use std::str::FromStr;

/// `stat -c` format for one entry; the name is last so it may contain `|`.
pub const STAT_FORMAT: &str = "%F|%s|%u|%g|%a|%Y|%n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    /// Sockets, fifos, devices: never archived
    Other,
}

impl FileKind {
    fn from_stat(kind: &str) -> Self {
        match kind {
            "regular file" | "regular empty file" => FileKind::Regular,
            "directory" => FileKind::Directory,
            "symbolic link" => FileKind::Symlink,
            _ => FileKind::Other,
        }
    }
}

/// One file found below a listed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the listed directory, `/`-separated
    pub relative_path: String,
    pub absolute_path: String,
    pub kind: FileKind,
    pub size: u64,
    pub mode: u32,
    pub mtime: u64,
    pub uid: u32,
    pub gid: u32,
}

impl FileEntry {
    /// Parse one `STAT_FORMAT` line for an entry below `base`.
    pub fn parse(line: &str, base: &str) -> Result<Self> {
        let parts: Vec<&str> = line.splitn(7, '|').collect();
        if parts.len() != 7 {
            return Err(EngineError::UnexpectedCommandResult(format!(
                "malformed stat line: {}",
                line
            )));
        }
        let mode = u32::from_str_radix(parts[4].trim(), 8).map_err(|_| {
            EngineError::UnexpectedCommandResult(format!("malformed mode in: {}", line))
        })?;

        let absolute_path = parts[6].to_string();
        let prefix = format!("{}/", base.trim_end_matches('/'));
        let relative_path = absolute_path
            .strip_prefix(&prefix)
            .unwrap_or(&absolute_path)
            .to_string();

        Ok(Self {
            relative_path,
            absolute_path,
            kind: FileKind::from_stat(parts[0]),
            size: field(parts[1], line)?,
            uid: field(parts[2], line)?,
            gid: field(parts[3], line)?,
            mode,
            mtime: field(parts[5], line)?,
        })
    }
}

fn field<T: FromStr>(value: &str, line: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::UnexpectedCommandResult(format!("malformed stat line: {}", line)))
}

/// Ownership and SELinux label of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerGroupContext {
    pub uid: u32,
    pub gid: u32,
    pub context: String,
}

impl OwnerGroupContext {
    /// Parse `uid:gid:context`; the context itself contains colons.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.trim().splitn(3, ':');
        let malformed =
            || EngineError::UnexpectedCommandResult(format!("malformed owner line: {}", line));
        let uid = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(malformed)?;
        let gid = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(malformed)?;
        let context = parts.next().unwrap_or("?").to_string();
        Ok(Self { uid, gid, context })
    }

    pub fn has_context(&self) -> bool {
        !self.context.is_empty() && self.context != "?"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entry() {
        let e = FileEntry::parse(
            "symbolic link|7|10123|10123|777|1700000000|/data/data/org.example/lib",
            "/data/data/org.example/",
        )
        .unwrap();
        assert_eq!(e.kind, FileKind::Symlink);
        assert_eq!(e.relative_path, "lib");
        assert_eq!(e.mode, 0o777);
    }

    #[test]
    fn test_parse_entry_rejects_garbage() {
        assert!(FileEntry::parse("find: permission denied", "/x").is_err());
        assert!(FileEntry::parse("directory|x|0|0|755|0|/x/y", "/x").is_err());
        // a uid past u32 is rejected rather than wrapped
        assert!(FileEntry::parse("directory|0|4294977419|0|755|0|/x/y", "/x").is_err());
    }

    #[test]
    fn test_parse_owner_with_selinux_context() {
        let ogc =
            OwnerGroupContext::parse("10123:10123:u:object_r:app_data_file:s0:c123,c256").unwrap();
        assert_eq!(ogc.context, "u:object_r:app_data_file:s0:c123,c256");
        assert!(ogc.has_context());
    }
}
