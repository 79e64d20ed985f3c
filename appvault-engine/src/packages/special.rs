//! Synthetic packages covering system state that is not an app.

use crate::model::{Package, PackageKind, SpecialKind};

struct SpecialEntry {
    package_name: &'static str,
    label: &'static str,
    kind: SpecialKind,
    /// Absolute paths; a leading `@` is relative to the exchange directory
    files: &'static [&'static str],
}

const TABLE: &[SpecialEntry] = &[
    SpecialEntry {
        package_name: "special.wifi.access.points",
        label: "Wi-Fi Access Points",
        kind: SpecialKind::Wifi,
        files: &[
            "/data/misc/apexdata/com.android.wifi/WifiConfigStore.xml",
            "/data/misc/apexdata/com.android.wifi/WifiConfigStoreSoftAp.xml",
        ],
    },
    SpecialEntry {
        package_name: "special.bluetooth",
        label: "Bluetooth",
        kind: SpecialKind::Bluetooth,
        files: &["/data/misc/bluedroid/bt_config.conf"],
    },
    SpecialEntry {
        package_name: "special.smsmms.json",
        label: "SMS/MMS",
        kind: SpecialKind::SmsMmsJson,
        files: &["@special.smsmms.json"],
    },
    SpecialEntry {
        package_name: "special.calllogs.json",
        label: "Call Logs",
        kind: SpecialKind::CallLogsJson,
        files: &["@special.calllogs.json"],
    },
];

pub fn is_special(package_name: &str) -> bool {
    package_name.starts_with("special.")
}

fn build(entry: &SpecialEntry, profile_id: u32, exchange_dir: &str) -> Package {
    let files = entry
        .files
        .iter()
        .map(|f| match f.strip_prefix('@') {
            Some(name) => format!("{}/{}", exchange_dir.trim_end_matches('/'), name),
            None => f.to_string(),
        })
        .collect();
    Package {
        package_name: entry.package_name.to_string(),
        label: entry.label.to_string(),
        kind: PackageKind::Special(entry.kind),
        profile_id,
        special_files: files,
        ..Default::default()
    }
}

/// The special package with this name, if any. JSON dumps are exchanged
/// with their importer through `exchange_dir`.
pub fn lookup(package_name: &str, profile_id: u32, exchange_dir: &str) -> Option<Package> {
    TABLE
        .iter()
        .find(|e| e.package_name == package_name)
        .map(|e| build(e, profile_id, exchange_dir))
}
