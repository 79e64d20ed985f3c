//! [`Shell`] backed by `sh -c` / `su -c` child processes.

use super::{Shell, ShellResult};
use crate::config::ShellConfig;
use crate::utils::errors::Result;
use nix::unistd::Uid;
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use tracing::debug;

pub struct RootShell {
    su_command: String,
    elevate: bool,
    utilbox: String,
}

impl RootShell {
    pub fn new(config: &ShellConfig) -> Self {
        Self {
            su_command: config.su_command.clone(),
            elevate: config.elevate && !Uid::effective().is_root(),
            utilbox: config.utilbox.clone(),
        }
    }

    /// Plain `sh -c` as the current user with PATH utilities.
    pub fn unelevated() -> Self {
        Self {
            su_command: String::new(),
            elevate: false,
            utilbox: String::new(),
        }
    }

    fn command(&self, command: &str) -> Command {
        let mut cmd = if self.elevate {
            Command::new(&self.su_command)
        } else {
            Command::new("sh")
        };
        cmd.arg("-c").arg(command);
        cmd
    }
}

fn lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}

/// Drain stderr on a helper thread so a chatty command cannot block on a
/// full pipe while we stream the other end.
fn collect_stderr(stderr: Option<std::process::ChildStderr>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_stderr(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

impl Shell for RootShell {
    fn run(&self, command: &str) -> Result<ShellResult> {
        debug!("SHELL: {}", command);
        let output = self.command(command).stdin(Stdio::null()).output()?;
        Ok(ShellResult {
            code: output.status.code().unwrap_or(-1),
            out: lines(&output.stdout),
            err: lines(&output.stderr),
        })
    }

    fn run_piped_out(&self, command: &str, sink: &mut dyn Write) -> Result<(i32, String)> {
        debug!("SHELL (pipe out): {}", command);
        let mut child = self
            .command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr = collect_stderr(child.stderr.take());
        let copied = match child.stdout.take() {
            Some(mut stdout) => io::copy(&mut stdout, sink).map(|_| ()),
            None => Ok(()),
        };
        if copied.is_err() {
            let _ = child.kill();
        }
        let status = child.wait()?;
        let err = join_stderr(stderr);
        copied?;
        Ok((status.code().unwrap_or(-1), err))
    }

    fn run_piped_in(&self, command: &str, source: &mut dyn Read) -> Result<(i32, String)> {
        debug!("SHELL (pipe in): {}", command);
        let mut child = self
            .command(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr = collect_stderr(child.stderr.take());
        let copied = match child.stdin.take() {
            // stdin is dropped (EOF) at the end of this arm
            Some(mut stdin) => match io::copy(source, &mut stdin) {
                // the command stopped reading early; its exit code tells the story
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                other => other.map(|_| ()),
            },
            None => Ok(()),
        };
        let status = child.wait()?;
        let err = join_stderr(stderr);
        copied?;
        Ok((status.code().unwrap_or(-1), err))
    }

    fn tool(&self, name: &str) -> String {
        if self.utilbox.is_empty() {
            name.to_string()
        } else {
            format!("{} {}", self.utilbox, name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_run_collects_output() {
        let shell = RootShell::unelevated();
        let result = shell.run("echo one; echo two >&2; exit 3").unwrap();
        assert_eq!(result.code, 3);
        assert_eq!(result.out, vec!["one"]);
        assert_eq!(result.err, vec!["two"]);
    }

    #[test]
    fn test_piped_round_trip() -> std::io::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("piped.bin");
        let target = super::super::quote(&path.to_string_lossy());
        let shell = RootShell::unelevated();

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (code, _) = shell
            .run_piped_in(&format!("cat > {}", target), &mut Cursor::new(payload.clone()))
            .unwrap();
        assert_eq!(code, 0);

        let mut back = Vec::new();
        let (code, _) = shell
            .run_piped_out(&format!("cat {}", target), &mut back)
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(back, payload);
        Ok(())
    }
}
