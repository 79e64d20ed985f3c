//! Privileged shell gateway.
//!
//! Every file-system operation on app data goes through a [`Shell`]: the
//! engine itself usually cannot see `/data/data`, the privileged user can.
//! Queries (listing, ownership, SELinux labels) are provided methods layered
//! on the three primitives `run`, `run_piped_out` and `run_piped_in`.

pub mod listing;
pub mod root;

#[cfg(test)]
pub(crate) mod fake;

pub use listing::{FileEntry, FileKind, OwnerGroupContext};
pub use root::RootShell;

use crate::utils::errors::{EngineError, Result};
use std::io::{Read, Write};

/// Collected outcome of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellResult {
    pub code: i32,
    pub out: Vec<String>,
    pub err: Vec<String>,
}

impl ShellResult {
    pub fn ok(out: &[&str]) -> Self {
        Self {
            code: 0,
            out: out.iter().map(|s| s.to_string()).collect(),
            err: Vec::new(),
        }
    }

    pub fn failed(code: i32, err: &[&str]) -> Self {
        Self {
            code,
            out: Vec::new(),
            err: err.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// Last stderr line, else last stdout line, else "Unknown Error".
    pub fn error_message(&self) -> String {
        last_non_blank(&self.err)
            .or_else(|| last_non_blank(&self.out))
            .unwrap_or("Unknown Error")
            .to_string()
    }
}

fn last_non_blank(lines: &[String]) -> Option<&str> {
    lines
        .iter()
        .rev()
        .map(|l| l.trim_end())
        .find(|l| !l.is_empty())
}

/// Single-quote a word for `sh`.
pub fn quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', "'\\''"))
}

pub fn quote_multiple<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|w| quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Command execution as the privileged user.
///
/// Implementations run commands serially; one action owns one shell at a time.
pub trait Shell: Send + Sync {
    /// Run a command and collect its exit code and output lines.
    fn run(&self, command: &str) -> Result<ShellResult>;

    /// Stream the command's stdout into `sink`. Returns exit code and stderr.
    fn run_piped_out(&self, command: &str, sink: &mut dyn Write) -> Result<(i32, String)>;

    /// Feed `source` into the command's stdin. Returns exit code and stderr.
    fn run_piped_in(&self, command: &str, source: &mut dyn Read) -> Result<(i32, String)>;

    /// Name under which a file utility is invoked (e.g. `toybox ls`).
    fn tool(&self, name: &str) -> String {
        name.to_string()
    }

    /// Run a command and fail on a non-zero exit code.
    fn run_checked(&self, command: &str) -> Result<ShellResult> {
        let result = self.run(command)?;
        if !result.is_success() {
            return Err(EngineError::shell_failed(command, &result));
        }
        Ok(result)
    }

    fn test(&self, flag: char, path: &str) -> Result<bool> {
        Ok(self.run(&format!("test -{} {}", flag, quote(path)))?.is_success())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        self.test('e', path)
    }

    fn is_dir(&self, path: &str) -> Result<bool> {
        self.test('d', path)
    }

    /// Names of the direct children of `path`, dotfiles included.
    fn list_directory(&self, path: &str) -> Result<Vec<String>> {
        let command = format!("{} -1A {}", self.tool("ls"), quote(path));
        let result = self.run_checked(&command)?;
        Ok(result
            .out
            .into_iter()
            .filter(|l| !l.trim().is_empty())
            .collect())
    }

    /// Children of `path` with their metadata, optionally the whole subtree.
    /// Output is one line per entry, so names containing a newline are
    /// pruned together with everything below them.
    fn list_directory_detailed(&self, path: &str, recursive: bool) -> Result<Vec<FileEntry>> {
        let depth = if recursive { "" } else { " -maxdepth 1" };
        let command = format!(
            "{} {} -mindepth 1{} -name {} -prune -o -exec {} -c {} {{}} +",
            self.tool("find"),
            quote(path),
            depth,
            quote("*\n*"),
            self.tool("stat"),
            quote(listing::STAT_FORMAT),
        );
        let result = self.run_checked(&command)?;
        let mut entries = Vec::with_capacity(result.out.len());
        for line in result.out.iter().filter(|l| !l.is_empty()) {
            entries.push(FileEntry::parse(line, path)?);
        }
        Ok(entries)
    }

    /// Metadata for a single path; the relative path is its basename.
    fn stat_entry(&self, path: &str) -> Result<FileEntry> {
        let command = format!(
            "{} -c {} {}",
            self.tool("stat"),
            quote(listing::STAT_FORMAT),
            quote(path)
        );
        let result = self.run_checked(&command)?;
        let line = result
            .out
            .first()
            .ok_or_else(|| EngineError::UnexpectedCommandResult(command.clone()))?;
        let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
        FileEntry::parse(line, parent)
    }

    /// Owner uid, gid and SELinux context of `path`. A context of `?` means
    /// the label could not be read.
    fn owner_group_context(&self, path: &str) -> Result<OwnerGroupContext> {
        let command = format!("{} -c '%u:%g:%C' {}", self.tool("stat"), quote(path));
        let result = self.run(&command)?;
        // stat exits 1 without SELinux but still prints the ids
        match result.out.first() {
            Some(line) if !line.trim().is_empty() => OwnerGroupContext::parse(line),
            _ => Err(EngineError::shell_failed(&command, &result)),
        }
    }

    fn readlink(&self, path: &str) -> Result<String> {
        let command = format!("{} {}", self.tool("readlink"), quote(path));
        let result = self.run_checked(&command)?;
        result
            .out
            .into_iter()
            .next()
            .ok_or(EngineError::UnexpectedCommandResult(command))
    }
}
