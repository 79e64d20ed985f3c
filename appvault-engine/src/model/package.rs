//! Installed or synthetic packages as seen by the engine.

use super::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialKind {
    Wifi,
    Bluetooth,
    SmsMmsJson,
    CallLogsJson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PackageKind {
    #[default]
    App,
    Special(SpecialKind),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Package {
    pub package_name: String,
    pub label: String,
    pub kind: PackageKind,
    pub profile_id: u32,
    pub version_name: String,
    pub version_code: i64,
    /// Base APK path
    pub apk_path: String,
    pub split_apk_paths: Vec<String>,
    pub data_path: String,
    pub device_protected_path: String,
    pub external_path: String,
    pub obb_path: String,
    pub media_path: String,
    /// Absolute paths restored by special packages
    pub special_files: Vec<String>,
    /// Granted runtime permissions
    pub permissions: Vec<String>,
}

impl Package {
    /// App package with the conventional Android data locations.
    pub fn app(package_name: &str, profile_id: u32) -> Self {
        Package {
            package_name: package_name.to_string(),
            label: package_name.to_string(),
            kind: PackageKind::App,
            profile_id,
            data_path: format!("/data/user/{}/{}", profile_id, package_name),
            device_protected_path: format!("/data/user_de/{}/{}", profile_id, package_name),
            external_path: format!(
                "/storage/emulated/{}/Android/data/{}",
                profile_id, package_name
            ),
            obb_path: format!(
                "/storage/emulated/{}/Android/obb/{}",
                profile_id, package_name
            ),
            media_path: format!(
                "/storage/emulated/{}/Android/media/{}",
                profile_id, package_name
            ),
            ..Default::default()
        }
    }

    pub fn is_special(&self) -> bool {
        matches!(self.kind, PackageKind::Special(_))
    }

    /// Source or target directory of a data category.
    pub fn data_dir(&self, category: Category) -> &str {
        match category {
            Category::Apk => &self.apk_path,
            Category::Data => &self.data_path,
            Category::DeviceProtected => &self.device_protected_path,
            Category::External => &self.external_path,
            Category::Obb => &self.obb_path,
            Category::Media => &self.media_path,
        }
    }

    /// The package manager reports real paths for an installed app.
    pub fn has_plausible_paths(&self) -> bool {
        let plausible = |p: &str| !p.trim().is_empty() && p.contains(&self.package_name);
        !self.apk_path.trim().is_empty()
            && plausible(&self.data_path)
            && plausible(&self.device_protected_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conventional_paths() {
        let p = Package::app("org.example.notes", 10);
        assert_eq!(p.data_dir(Category::Data), "/data/user/10/org.example.notes");
        assert_eq!(
            p.data_dir(Category::Obb),
            "/storage/emulated/10/Android/obb/org.example.notes"
        );
        // not installed yet: no APK path
        assert!(!p.has_plausible_paths());
    }
}
