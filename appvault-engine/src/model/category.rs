//! Backup categories and the mode bitmask selecting them.

use crate::utils::errors::{EngineError, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Apk,
    Data,
    DeviceProtected,
    External,
    Obb,
    Media,
}

impl Category {
    /// Processing order for both backup and restore.
    pub const ALL: [Category; 6] = [
        Category::Apk,
        Category::Data,
        Category::DeviceProtected,
        Category::External,
        Category::Obb,
        Category::Media,
    ];

    pub const DATA: [Category; 5] = [
        Category::Data,
        Category::DeviceProtected,
        Category::External,
        Category::Obb,
        Category::Media,
    ];

    pub fn mode_bit(self) -> u32 {
        match self {
            Category::Apk => 0b000001,
            Category::Data => 0b000010,
            Category::DeviceProtected => 0b000100,
            Category::External => 0b001000,
            Category::Obb => 0b010000,
            Category::Media => 0b100000,
        }
    }

    /// Stem of the archive file (`<stem>.tar...`).
    pub fn archive_name(self) -> &'static str {
        match self {
            Category::Apk => "apk",
            Category::Data => "data",
            Category::DeviceProtected => "device_protected_files",
            Category::External => "external_files",
            Category::Obb => "obb_files",
            Category::Media => "media_files",
        }
    }

    /// Categories whose source directory may legitimately not exist.
    pub fn is_optional(self) -> bool {
        !matches!(self, Category::Apk | Category::Data)
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "apk" => Ok(Category::Apk),
            "data" => Ok(Category::Data),
            "de" | "device_protected" => Ok(Category::DeviceProtected),
            "ext" | "external" => Ok(Category::External),
            "obb" => Ok(Category::Obb),
            "media" => Ok(Category::Media),
            other => Err(EngineError::Config(format!("unknown category: {}", other))),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.archive_name())
    }
}

/// Set of categories requested for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode(pub u32);

impl Mode {
    pub const ALL: Mode = Mode(0b111111);
    pub const APK: Mode = Mode(0b000001);
    pub const DATA: Mode = Mode(0b111110);

    pub fn contains(self, category: Category) -> bool {
        self.0 & category.mode_bit() != 0
    }

    pub fn from_categories(categories: &[Category]) -> Self {
        Mode(categories.iter().fold(0, |m, c| m | c.mode_bit()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bits() {
        assert!(Mode::ALL.contains(Category::Media));
        assert!(!Mode::DATA.contains(Category::Apk));
        let mode = Mode::from_categories(&[Category::Apk, Category::Obb]);
        assert_eq!(mode.0, 0b010001);
        assert!(mode.contains(Category::Obb));
        assert!(!mode.contains(Category::Data));
    }

    #[test]
    fn test_parse() {
        assert_eq!(Category::parse("DE").unwrap(), Category::DeviceProtected);
        assert!(Category::parse("cache").is_err());
    }
}
