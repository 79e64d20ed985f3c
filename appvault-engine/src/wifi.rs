//! Decoder for Android's `WifiConfigStore.xml`.
//!
//! Restoring the raw store file is not enough on current releases: the Wi-Fi
//! service keeps its own copy in memory and rewrites the file. Networks are
//! therefore re-added through `cmd wifi add-network`, one command per saved
//! network.

use crate::shell::quote;
use crate::utils::errors::{EngineError, Result};
use roxmltree::{Document, Node};
use tracing::warn;

// AllowedKeyMgmt is a serialized Java BitSet, little-endian bytes
const KEY_MGMT_NONE: u8 = 0x01;
const KEY_MGMT_WPA_PSK: u8 = 0x02;
const KEY_MGMT_WPA_EAP: u8 = 0x04;
const KEY_MGMT_IEEE8021X: u8 = 0x08;
const KEY_MGMT_SAE: u8 = 0x80;
/// Bit 8, i.e. bit 0 of the second byte
const KEY_MGMT_OWE: u8 = 0x01;

const SELECTION_ENABLED: &str = "NETWORK_SELECTION_ENABLED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityType {
    Open,
    /// Enhanced Open
    Owe,
    Wep,
    Wpa2Personal,
    Wpa3Personal,
    Wpa2Wpa3Mixed,
    /// EAP / 802.1X: cannot be configured from the shell
    Enterprise,
}

impl SecurityType {
    pub fn from_key_mgmt(bytes: &[u8], has_wep_key: bool) -> Self {
        let byte0 = bytes.first().copied().unwrap_or(0);
        let byte1 = bytes.get(1).copied().unwrap_or(0);
        let sae = (byte0 | byte1) & KEY_MGMT_SAE != 0;
        let psk = byte0 & KEY_MGMT_WPA_PSK != 0;

        if byte0 & (KEY_MGMT_WPA_EAP | KEY_MGMT_IEEE8021X) != 0 {
            SecurityType::Enterprise
        } else if psk && sae {
            SecurityType::Wpa2Wpa3Mixed
        } else if sae {
            SecurityType::Wpa3Personal
        } else if psk {
            SecurityType::Wpa2Personal
        } else if byte1 & KEY_MGMT_OWE != 0 {
            SecurityType::Owe
        } else if byte0 & KEY_MGMT_NONE != 0 && has_wep_key {
            SecurityType::Wep
        } else {
            SecurityType::Open
        }
    }

    /// Keyword for `cmd wifi add-network`, `None` for enterprise networks.
    pub fn keyword(self) -> Option<&'static str> {
        match self {
            SecurityType::Open => Some("open"),
            SecurityType::Owe => Some("owe"),
            SecurityType::Wep | SecurityType::Wpa2Personal => Some("wpa2"),
            SecurityType::Wpa3Personal | SecurityType::Wpa2Wpa3Mixed => Some("wpa3"),
            SecurityType::Enterprise => None,
        }
    }

    pub fn needs_passphrase(self) -> bool {
        matches!(
            self,
            SecurityType::Wep
                | SecurityType::Wpa2Personal
                | SecurityType::Wpa3Personal
                | SecurityType::Wpa2Wpa3Mixed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiNetwork {
    pub ssid: String,
    pub psk: Option<String>,
    pub hidden: bool,
    pub security: SecurityType,
    pub auto_join: bool,
    pub mac_randomized: bool,
}

impl WifiNetwork {
    /// `cmd wifi add-network <hex-ssid> <keyword> ['<psk>'] -x [-h] [-d]`,
    /// or `None` when the network cannot be added from the shell.
    pub fn to_command(&self) -> Option<String> {
        let Some(keyword) = self.security.keyword() else {
            warn!(
                "Skipping {:?}: enterprise networks need manual setup",
                self.ssid
            );
            return None;
        };

        let mut command = format!("cmd wifi add-network {} {}", hex::encode(self.ssid.as_bytes()), keyword);
        if self.security.needs_passphrase() {
            let Some(psk) = self.psk.as_deref() else {
                warn!("Skipping {:?}: {:?} without a passphrase", self.ssid, self.security);
                return None;
            };
            command.push(' ');
            command.push_str(&quote(psk));
        }
        command.push_str(" -x");
        if self.hidden {
            command.push_str(" -h");
        }
        if !self.auto_join {
            command.push_str(" -d");
        }
        Some(command)
    }
}

/// All well-formed `<Network>` entries; malformed ones are skipped.
pub fn parse_networks(xml: &str) -> Result<Vec<WifiNetwork>> {
    let doc = Document::parse(xml)
        .map_err(|e| EngineError::Parse(format!("WifiConfigStore.xml: {}", e)))?;
    Ok(doc
        .descendants()
        .filter(|n| n.has_tag_name("Network"))
        .filter_map(|n| match parse_network(n) {
            Ok(network) => Some(network),
            Err(e) => {
                warn!("Skipping malformed <Network>: {}", e);
                None
            }
        })
        .collect())
}

/// Commands re-adding every network that can be restored.
pub fn restore_commands(networks: &[WifiNetwork]) -> Vec<String> {
    networks.iter().filter_map(WifiNetwork::to_command).collect()
}

fn parse_network(network: Node<'_, '_>) -> Result<WifiNetwork> {
    let config = child_element(network, "WifiConfiguration")
        .ok_or_else(|| EngineError::Parse("missing <WifiConfiguration>".to_string()))?;
    let ssid = named_string(config, "SSID")
        .map(|s| unquote(&s))
        .ok_or_else(|| EngineError::Parse("missing SSID".to_string()))?;
    let psk = named_string(config, "PreSharedKey").map(|s| unquote(&s));

    let key_mgmt = named(config, "AllowedKeyMgmt")
        .and_then(|n| n.text())
        .unwrap_or("")
        .trim();
    let key_mgmt = hex::decode(key_mgmt)
        .map_err(|e| EngineError::Parse(format!("AllowedKeyMgmt {:?}: {}", key_mgmt, e)))?;
    let security = SecurityType::from_key_mgmt(&key_mgmt, has_wep_key(config));

    // AutoJoinEnabled exists from Android 10 on
    let auto_join = named_bool(config, "AutoJoinEnabled").unwrap_or_else(|| {
        child_element(network, "NetworkStatus")
            .and_then(|status| named_string(status, "SelectionStatus"))
            .map_or(true, |status| status == SELECTION_ENABLED)
    });

    Ok(WifiNetwork {
        ssid,
        psk,
        hidden: named_bool(config, "HiddenSSID").unwrap_or(false),
        security,
        auto_join,
        mac_randomized: named_int(config, "MacRandomizationSetting").unwrap_or(0) != 0,
    })
}

fn child_element<'a, 'input>(parent: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    parent.children().find(|c| c.has_tag_name(tag))
}

/// Child element carrying `name="<name>"`.
fn named<'a, 'input>(parent: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    parent
        .children()
        .find(|c| c.is_element() && c.attribute("name") == Some(name))
}

fn named_string(parent: Node<'_, '_>, name: &str) -> Option<String> {
    named(parent, name)
        .filter(|n| n.has_tag_name("string"))
        .map(|n| n.text().unwrap_or("").to_string())
}

fn named_bool(parent: Node<'_, '_>, name: &str) -> Option<bool> {
    named(parent, name)?
        .attribute("value")
        .map(|v| v.eq_ignore_ascii_case("true"))
}

fn named_int(parent: Node<'_, '_>, name: &str) -> Option<i64> {
    named(parent, name)?.attribute("value")?.trim().parse().ok()
}

fn has_wep_key(config: Node<'_, '_>) -> bool {
    let Some(keys) = named(config, "WEPKeys") else {
        return false;
    };
    let present = |v: &str| !v.trim().is_empty() && v != "null";
    if keys.has_tag_name("string-array") {
        keys.children()
            .filter(|c| c.has_tag_name("item"))
            .any(|item| item.attribute("value").is_some_and(present))
    } else {
        keys.text().is_some_and(present)
    }
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}
