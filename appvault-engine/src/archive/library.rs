//! In-process tar strategy on top of the `tar` crate.
//!
//! Creation reads each file through the shell into a scratch file before
//! appending it; extraction pipes each member into `cat` on the shell. Only
//! regular files, directories and symlinks are carried.

use super::{EntryFilter, TarStrategy};
use crate::shell::{quote, FileEntry, FileKind, Shell};
use crate::utils::errors::{EngineError, Result};
use std::collections::HashSet;
use std::io::{Read, Seek, Write};
use std::path::{Component, Path};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, warn};

pub struct TarLibrary;

impl TarStrategy for TarLibrary {
    fn name(&self) -> &'static str {
        "tar library"
    }

    fn create(
        &self,
        shell: &dyn Shell,
        source_dir: &str,
        entries: &[FileEntry],
        filter: &EntryFilter,
        out: &mut dyn Write,
    ) -> Result<()> {
        let mut builder = Builder::new(out);

        for entry in entries.iter().filter(|e| filter.accepts(&e.relative_path)) {
            let name = entry.relative_path.as_str();
            let mut header = Header::new_gnu();
            header.set_mode(entry.mode);
            header.set_uid(entry.uid as u64);
            header.set_gid(entry.gid as u64);
            header.set_mtime(entry.mtime);

            match entry.kind {
                FileKind::Directory => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    builder.append_data(&mut header, name, std::io::empty())?;
                }
                FileKind::Symlink => {
                    let target = shell.readlink(&entry.absolute_path)?;
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    builder.append_link(&mut header, name, &target)?;
                }
                FileKind::Regular => {
                    let mut staged = tempfile::tempfile()?;
                    let command = format!("{} {}", shell.tool("cat"), quote(&entry.absolute_path));
                    let (code, err) = shell.run_piped_out(&command, &mut staged)?;
                    if code != 0 {
                        return Err(EngineError::ShellCommandFailed {
                            command,
                            code,
                            message: err.trim().to_string(),
                        });
                    }
                    let size = staged.stream_position()?;
                    staged.rewind()?;
                    header.set_entry_type(EntryType::Regular);
                    header.set_size(size);
                    builder.append_data(&mut header, name, &mut staged)?;
                }
                FileKind::Other => debug!("Skipping special file {}", entry.absolute_path),
            }
        }

        builder.finish()?;
        debug!("Archived {} from {}", entries.len(), source_dir);
        Ok(())
    }

    fn extract(
        &self,
        shell: &dyn Shell,
        input: &mut dyn Read,
        target_dir: &str,
        filter: &EntryFilter,
        legacy: bool,
    ) -> Result<()> {
        let base = target_dir.trim_end_matches('/');
        let mut known_dirs: HashSet<String> = HashSet::new();
        known_dirs.insert(base.to_string());

        let mut archive = Archive::new(input);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let Some(relative) = normalize_member_path(&entry.path()?, legacy)? else {
                continue;
            };
            if !filter.accepts(&relative) {
                continue;
            }
            let dest = format!("{}/{}", base, relative);
            let mode = entry.header().mode().unwrap_or(0o600) & 0o7777;
            let entry_type = entry.header().entry_type();

            if entry_type.is_dir() {
                shell.run_checked(&format!(
                    "{} -p {} && {} {:o} {}",
                    shell.tool("mkdir"),
                    quote(&dest),
                    shell.tool("chmod"),
                    mode,
                    quote(&dest)
                ))?;
                known_dirs.insert(dest);
            } else if entry_type.is_file() {
                ensure_parent(shell, &dest, &mut known_dirs)?;
                let command = format!(
                    "{} > {} && {} {:o} {}",
                    shell.tool("cat"),
                    quote(&dest),
                    shell.tool("chmod"),
                    mode,
                    quote(&dest)
                );
                let (code, err) = shell.run_piped_in(&command, &mut entry)?;
                if code != 0 {
                    return Err(EngineError::ShellCommandFailed {
                        command,
                        code,
                        message: err.trim().to_string(),
                    });
                }
            } else if entry_type.is_symlink() || entry_type.is_hard_link() {
                let link = entry
                    .link_name()?
                    .map(|l| l.to_string_lossy().into_owned())
                    .ok_or_else(|| EngineError::Parse(format!("link without target: {}", relative)))?;
                ensure_parent(shell, &dest, &mut known_dirs)?;
                let command = if entry_type.is_symlink() {
                    format!("{} -sfn {} {}", shell.tool("ln"), quote(&link), quote(&dest))
                } else {
                    let Some(link) = normalize_member_path(Path::new(&link), legacy)? else {
                        continue;
                    };
                    format!(
                        "{} -f {} {}",
                        shell.tool("ln"),
                        quote(&format!("{}/{}", base, link)),
                        quote(&dest)
                    )
                };
                shell.run_checked(&command)?;
            } else {
                warn!("Skipping unsupported archive member {} ({:?})", relative, entry_type);
            }
        }
        Ok(())
    }
}

/// Member name relative to the target, `None` for the archive root.
/// Legacy archives may hold absolute names, which are taken as relative.
fn normalize_member_path(raw: &Path, legacy: bool) -> Result<Option<String>> {
    let mut parts = Vec::new();
    for component in raw.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                if !legacy {
                    return Err(EngineError::Parse(format!(
                        "absolute path in archive: {}",
                        raw.display()
                    )));
                }
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(EngineError::Parse(format!(
                    "path leaves the target directory: {}",
                    raw.display()
                )));
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
        }
    }
    Ok((!parts.is_empty()).then(|| parts.join("/")))
}

fn ensure_parent(shell: &dyn Shell, dest: &str, known_dirs: &mut HashSet<String>) -> Result<()> {
    let Some((parent, _)) = dest.rsplit_once('/') else {
        return Ok(());
    };
    if parent.is_empty() || known_dirs.contains(parent) {
        return Ok(());
    }
    shell.run_checked(&format!("{} -p {}", shell.tool("mkdir"), quote(parent)))?;
    known_dirs.insert(parent.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::fake::FakeShell;
    use crate::shell::ShellResult;

    fn entry(relative: &str, kind: FileKind, mode: u32) -> FileEntry {
        FileEntry {
            relative_path: relative.to_string(),
            absolute_path: format!("/data/user/0/org.example/{}", relative),
            kind,
            size: 0,
            mode,
            mtime: 1_700_000_000,
            uid: 10123,
            gid: 10123,
        }
    }

    /// Member with a raw name the `tar` crate would refuse to write.
    fn raw_member(builder: &mut Builder<Vec<u8>>, name: &str, data: &[u8]) {
        let mut header = Header::new_gnu();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_size(data.len() as u64);
        header.set_mode(0o600);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append(&header, data).unwrap();
    }

    #[test]
    fn test_create_reads_files_through_shell() {
        let shell = FakeShell::new();
        shell.stream("cat '/data/user/0/org.example/files/notes.db'", b"sqlite!".to_vec());
        shell.on("readlink", ShellResult::ok(&["/data/app/org.example/lib/arm64"]));
        let entries = vec![
            entry("files", FileKind::Directory, 0o771),
            entry("files/notes.db", FileKind::Regular, 0o660),
            entry("libs", FileKind::Symlink, 0o777),
            entry("files/socket", FileKind::Other, 0o600),
            entry("lib", FileKind::Directory, 0o755),
        ];
        let filter = EntryFilter {
            excluded_basenames: vec!["lib".into()],
            ..Default::default()
        };

        let mut out = Vec::new();
        TarLibrary
            .create(&shell, "/data/user/0/org.example", &entries, &filter, &mut out)
            .unwrap();

        let mut archive = Archive::new(out.as_slice());
        let mut seen = Vec::new();
        for member in archive.entries().unwrap() {
            let mut member = member.unwrap();
            let path = member.path().unwrap().to_string_lossy().into_owned();
            let mut content = String::new();
            member.read_to_string(&mut content).unwrap();
            seen.push((path, member.header().entry_type(), content));
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, "files");
        assert!(seen[0].1.is_dir());
        assert_eq!(seen[1], ("files/notes.db".to_string(), EntryType::Regular, "sqlite!".to_string()));
        assert!(seen[2].1.is_symlink());
    }

    #[test]
    fn test_create_fails_on_unreadable_file() {
        let shell = FakeShell::new();
        shell.on("cat ", ShellResult::failed(1, &["cat: x: Permission denied"]));
        let entries = vec![entry("x", FileKind::Regular, 0o600)];
        let err = TarLibrary
            .create(&shell, "/data/user/0/org.example", &entries, &EntryFilter::default(), &mut Vec::new())
            .unwrap_err();
        assert!(err.to_string().contains("Permission denied"));
    }

    #[test]
    fn test_extract_pipes_members_into_shell() {
        let mut builder = Builder::new(Vec::new());
        let mut dir = Header::new_gnu();
        dir.set_entry_type(EntryType::Directory);
        dir.set_mode(0o771);
        dir.set_size(0);
        builder.append_data(&mut dir, "./files", std::io::empty()).unwrap();
        let mut file = Header::new_gnu();
        file.set_entry_type(EntryType::Regular);
        file.set_mode(0o660);
        file.set_size(5);
        builder.append_data(&mut file, "./files/a.txt", &b"hello"[..]).unwrap();
        let mut cached = Header::new_gnu();
        cached.set_entry_type(EntryType::Regular);
        cached.set_size(1);
        builder.append_data(&mut cached, "./cache/tmp", &b"x"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();

        let shell = FakeShell::new();
        let filter = EntryFilter {
            cache_dirs: vec!["cache".into()],
            ..Default::default()
        };
        TarLibrary
            .extract(&shell, &mut bytes.as_slice(), "/data/user/0/org.example/", &filter, false)
            .unwrap();

        let write = "cat > '/data/user/0/org.example/files/a.txt' && chmod 660 '/data/user/0/org.example/files/a.txt'";
        assert_eq!(
            shell.commands(),
            vec![
                "mkdir -p '/data/user/0/org.example/files' && chmod 771 '/data/user/0/org.example/files'",
                write,
            ]
        );
        assert_eq!(shell.received(write).unwrap(), b"hello");
    }

    #[test]
    fn test_extract_path_safety() {
        let mut builder = Builder::new(Vec::new());
        raw_member(&mut builder, "/data/data/org.example/files/a", b"a");
        let absolute = builder.into_inner().unwrap();

        let shell = FakeShell::new();
        assert!(TarLibrary
            .extract(&shell, &mut absolute.as_slice(), "/t", &EntryFilter::default(), false)
            .is_err());

        let shell = FakeShell::new();
        TarLibrary
            .extract(&shell, &mut absolute.as_slice(), "/t", &EntryFilter::default(), true)
            .unwrap();
        assert_eq!(shell.commands()[0], "mkdir -p '/t/data/data/org.example/files'");

        let mut builder = Builder::new(Vec::new());
        raw_member(&mut builder, "files/../../escape", b"x");
        let escaping = builder.into_inner().unwrap();
        let shell = FakeShell::new();
        assert!(TarLibrary
            .extract(&shell, &mut escaping.as_slice(), "/t", &EntryFilter::default(), true)
            .is_err());
        assert!(shell.commands().is_empty());
    }
}
