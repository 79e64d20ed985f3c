//! Error types for the archive engine.

use crate::shell::ShellResult;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A privileged command exited non-zero.
    #[error("Shell command failed: {command}\n{message}")]
    ShellCommandFailed {
        command: String,
        code: i32,
        message: String,
    },

    #[error("Unexpected command result: {0}")]
    UnexpectedCommandResult(String),

    #[error("Crypto setup failed: {0}")]
    CryptoSetup(String),

    #[error("Storage location is not accessible: {0}")]
    StorageInaccessible(String),

    /// tar reported errors that are not on the benign list.
    #[error("{0}")]
    Script(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error(
        "PackageManager returned invalid data paths after trying {0} seconds to retrieve them"
    )]
    PackageManagerDataIncomplete(u64),

    #[error("Package not found: {0}")]
    PackageNotFound(String),

    #[error("{message}")]
    BackupFailed {
        message: String,
        #[source]
        source: Option<Box<EngineError>>,
    },

    #[error("{message}")]
    RestoreFailed {
        message: String,
        #[source]
        source: Option<Box<EngineError>>,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn shell_failed(command: &str, result: &ShellResult) -> Self {
        EngineError::ShellCommandFailed {
            command: command.to_string(),
            code: result.code,
            message: result.error_message(),
        }
    }

    pub fn backup_failed(message: impl Into<String>, source: Option<EngineError>) -> Self {
        EngineError::BackupFailed {
            message: message.into(),
            source: source.map(Box::new),
        }
    }

    pub fn restore_failed(message: impl Into<String>, source: Option<EngineError>) -> Self {
        EngineError::RestoreFailed {
            message: message.into(),
            source: source.map(Box::new),
        }
    }

    /// True for shell failures caused by a missing path.
    pub fn is_file_not_found(&self) -> bool {
        match self {
            EngineError::ShellCommandFailed { message, .. } => {
                message.contains("No such file or directory")
            }
            EngineError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            EngineError::BackupFailed { source: Some(inner), .. }
            | EngineError::RestoreFailed { source: Some(inner), .. } => inner.is_file_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
