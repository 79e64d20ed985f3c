//! Storage only reachable through the privileged shell.
//!
//! Reads are materialized into an anonymous temp file first; writes are
//! staged in one and committed with a single `cat >` when the sink is
//! finished, so an unfinished archive never appears at its final path.

use super::StorageBackend;
use crate::pipeline::Sink;
use crate::shell::{quote, Shell};
use crate::utils::errors::{EngineError, Result};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

pub struct RootStorage {
    shell: Arc<dyn Shell>,
}

impl RootStorage {
    pub fn new(shell: Arc<dyn Shell>) -> Self {
        Self { shell }
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

struct StagedOutput {
    shell: Arc<dyn Shell>,
    staged: File,
    target: String,
}

impl Write for StagedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.staged.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.staged.flush()
    }
}

impl Sink for StagedOutput {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let StagedOutput {
            shell,
            mut staged,
            target,
        } = *self;
        staged.flush()?;
        staged.seek(SeekFrom::Start(0))?;
        let command = format!("{} > {}", shell.tool("cat"), quote(&target));
        let (code, err) = shell
            .run_piped_in(&command, &mut staged)
            .map_err(|e| io::Error::other(e.to_string()))?;
        if code != 0 {
            return Err(io::Error::other(format!(
                "could not write {}: {}",
                target,
                err.trim()
            )));
        }
        Ok(())
    }
}

impl StorageBackend for RootStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        self.shell.exists(&path_str(path))
    }

    fn is_dir(&self, path: &Path) -> Result<bool> {
        self.shell.is_dir(&path_str(path))
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        self.shell.list_directory(&path_str(dir))
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        let command = format!("{} -p {}", self.shell.tool("mkdir"), quote(&path_str(path)));
        self.shell.run_checked(&command)?;
        Ok(())
    }

    fn open_input(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let mut staged = tempfile::tempfile()?;
        let command = format!("{} {}", self.shell.tool("cat"), quote(&path_str(path)));
        let (code, err) = self.shell.run_piped_out(&command, &mut staged)?;
        if code != 0 {
            return Err(EngineError::ShellCommandFailed {
                command,
                code,
                message: err.trim().to_string(),
            });
        }
        staged.seek(SeekFrom::Start(0))?;
        Ok(Box::new(io::BufReader::new(staged)))
    }

    fn open_output(&self, path: &Path) -> Result<Box<dyn Sink>> {
        Ok(Box::new(StagedOutput {
            shell: self.shell.clone(),
            staged: tempfile::tempfile()?,
            target: path_str(path),
        }))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let command = format!("{} -rf {}", self.shell.tool("rm"), quote(&path_str(path)));
        self.shell.run_checked(&command)?;
        Ok(())
    }

    fn size(&self, path: &Path) -> Result<u64> {
        let path = path_str(path);
        if self.shell.is_dir(&path)? {
            Ok(self
                .shell
                .list_directory_detailed(&path, true)?
                .iter()
                .filter(|e| e.kind == crate::shell::FileKind::Regular)
                .map(|e| e.size)
                .sum())
        } else {
            Ok(self.shell.stat_entry(&path)?.size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::StorageFile;
    use super::*;
    use crate::shell::fake::FakeShell;
    use crate::shell::ShellResult;

    #[test]
    fn test_output_is_committed_on_finish() {
        let shell = Arc::new(FakeShell::new());
        let storage = StorageFile::new(Arc::new(RootStorage::new(shell.clone())), "/sdcard/AppVault");
        let file = storage.child("data.tar");

        let mut sink = file.open_output().unwrap();
        sink.write_all(b"archive").unwrap();
        assert!(shell.commands().is_empty());
        sink.finish().unwrap();

        let command = "cat > '/sdcard/AppVault/data.tar'";
        assert_eq!(shell.commands(), vec![command]);
        assert_eq!(shell.received(command).unwrap(), b"archive");
    }

    /// Resolves tools through a multi-call binary.
    struct Toybox(FakeShell);

    impl Shell for Toybox {
        fn run(&self, command: &str) -> Result<ShellResult> {
            self.0.run(command)
        }

        fn run_piped_out(&self, command: &str, sink: &mut dyn Write) -> Result<(i32, String)> {
            self.0.run_piped_out(command, sink)
        }

        fn run_piped_in(&self, command: &str, source: &mut dyn std::io::Read) -> Result<(i32, String)> {
            self.0.run_piped_in(command, source)
        }

        fn tool(&self, name: &str) -> String {
            format!("toybox {}", name)
        }
    }

    #[test]
    fn test_commit_uses_configured_tool() {
        let shell = Arc::new(Toybox(FakeShell::new()));
        let storage = StorageFile::new(Arc::new(RootStorage::new(shell.clone())), "/sdcard/AppVault");

        let mut sink = storage.child("data.tar").open_output().unwrap();
        sink.write_all(b"archive").unwrap();
        sink.finish().unwrap();

        let command = "toybox cat > '/sdcard/AppVault/data.tar'";
        assert_eq!(shell.0.commands(), vec![command]);
        assert_eq!(shell.0.received(command).unwrap(), b"archive");
    }

    #[test]
    fn test_failed_read_reports_stderr() {
        let shell = Arc::new(FakeShell::new());
        shell.on("cat '/nope'", ShellResult::failed(1, &["cat: /nope: No such file or directory"]));
        let storage = StorageFile::new(Arc::new(RootStorage::new(shell)), "/nope");

        let err = storage.open_input().err().unwrap();
        assert!(err.is_file_not_found());
    }
}
