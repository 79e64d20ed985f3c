//! AppVault archive engine
//!
//! Backs up Android apps (APKs plus each data category) into per-instance
//! archive directories and restores them, driving a privileged shell for
//! every access to app data.

pub mod actions;
pub mod archive;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod model;
pub mod packages;
pub mod pipeline;
pub mod shell;
pub mod storage;
pub mod utils;
pub mod wifi;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::EngineError;
pub type Result<T> = std::result::Result<T, EngineError>;
