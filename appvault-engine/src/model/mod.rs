//! Data model shared by the actions.

pub mod backup;
pub mod category;
pub mod package;

pub use backup::{find_backups, ActionResult, Backup, BackupBuilder};
pub use category::{Category, Mode};
pub use package::{Package, PackageKind, SpecialKind};
