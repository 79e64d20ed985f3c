//! Scripted shell for unit tests: records every command and answers from a
//! rule table (first rule whose needle occurs in the command wins).

use super::{Shell, ShellResult};
use crate::utils::errors::Result;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Mutex;

#[derive(Default)]
pub struct FakeShell {
    rules: Mutex<Vec<(String, ShellResult)>>,
    streams: Mutex<Vec<(String, Vec<u8>)>>,
    log: Mutex<Vec<String>>,
    received: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, needle: &str, result: ShellResult) {
        self.rules
            .lock()
            .unwrap()
            .push((needle.to_string(), result));
    }

    /// Bytes written to the sink by `run_piped_out` for matching commands.
    pub fn stream(&self, needle: &str, bytes: Vec<u8>) {
        self.streams
            .lock()
            .unwrap()
            .push((needle.to_string(), bytes));
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Bytes fed to `run_piped_in` for the given command.
    pub fn received(&self, command: &str) -> Option<Vec<u8>> {
        self.received.lock().unwrap().get(command).cloned()
    }

    fn answer(&self, command: &str) -> ShellResult {
        self.log.lock().unwrap().push(command.to_string());
        self.rules
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_default()
    }
}

impl Shell for FakeShell {
    fn run(&self, command: &str) -> Result<ShellResult> {
        Ok(self.answer(command))
    }

    fn run_piped_out(&self, command: &str, sink: &mut dyn Write) -> Result<(i32, String)> {
        let result = self.answer(command);
        let bytes = self
            .streams
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, b)| b.clone());
        if let Some(bytes) = bytes {
            sink.write_all(&bytes)?;
        }
        Ok((result.code, result.err.join("\n")))
    }

    fn run_piped_in(&self, command: &str, source: &mut dyn Read) -> Result<(i32, String)> {
        let result = self.answer(command);
        let mut buf = Vec::new();
        source.read_to_end(&mut buf)?;
        self.received
            .lock()
            .unwrap()
            .insert(command.to_string(), buf);
        Ok((result.code, result.err.join("\n")))
    }
}
