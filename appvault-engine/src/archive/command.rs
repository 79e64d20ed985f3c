//! Strategy delegating to the device's `tar` binary.

use super::{EntryFilter, TarStrategy};
use crate::actions::base::check_tar_result;
use crate::shell::{quote, FileEntry, Shell};
use crate::utils::errors::Result;
use std::io::{Read, Write};
use tracing::debug;

pub struct TarCommand;

impl TarStrategy for TarCommand {
    fn name(&self) -> &'static str {
        "tar command"
    }

    /// `tar` walks the directory itself; `entries` only tells whether
    /// there is anything to archive.
    fn create(
        &self,
        shell: &dyn Shell,
        source_dir: &str,
        entries: &[FileEntry],
        filter: &EntryFilter,
        out: &mut dyn Write,
    ) -> Result<()> {
        let command = format!(
            "cd {} && {} -cf -{} .",
            quote(source_dir),
            shell.tool("tar"),
            filter.tar_options()
        );
        debug!("Streaming {} entries with: {}", entries.len(), command);
        let (code, err) = shell.run_piped_out(&command, out)?;
        check_tar_result(code, &err)
    }

    fn extract(
        &self,
        shell: &dyn Shell,
        input: &mut dyn Read,
        target_dir: &str,
        filter: &EntryFilter,
        _legacy: bool,
    ) -> Result<()> {
        let command = format!(
            "{} -xf - -C {}{}",
            shell.tool("tar"),
            quote(target_dir),
            filter.tar_options()
        );
        let (code, err) = shell.run_piped_in(&command, input)?;
        check_tar_result(code, &err)
    }
}
