//! Daemon stage notifications
//!
//! Daemons report progress as short tags, with JSON payloads for config
//! updates and OpenVPN client messages. Raw strings are parsed once into a
//! [`StageMessage`] at the bridge; state machines only ever see typed values.

use serde::Deserialize;
use serde_json::Value;
use std::fmt;

use crate::error::{VpnError, VpnResult};

pub const IPSEC_STARTED_TAG: &str = "ipsec-started";
pub const SWANCTL_LOADED_TAG: &str = "swanctl-loaded";
pub const IPSEC_CONNECT_TAG: &str = "connect";
pub const L2TP_STARTED_TAG: &str = "l2tp-started";
pub const L2TP_CONFIGURED_TAG: &str = "l2tp-configured";
pub const L2TP_CONNECTED_TAG: &str = "l2tp-connected";

const OPENVPN_ROOT: &str = "openvpn";
const OPENVPN_CONFIG_KEY: &str = "config";
const UPDATE_CONFIG_KEY: &str = "updateconfig";
const MASK_TAG: &str = "***";

/// Address parameters pushed by the IPsec or L2TP daemon
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct TunnelUpdate {
    pub mtu: Option<u32>,
    pub address: String,
    pub netmask: String,
    #[serde(rename = "phyifname")]
    pub phy_ifname: String,
    #[serde(rename = "remoteip")]
    pub remote_ip: String,
    #[serde(rename = "primarydns")]
    pub primary_dns: String,
    #[serde(rename = "secondarydns")]
    pub secondary_dns: String,
}

impl TunnelUpdate {
    /// Up to two DNS servers, in order
    pub fn dns(&self) -> Vec<String> {
        [&self.primary_dns, &self.secondary_dns]
            .into_iter()
            .filter(|d| !d.is_empty())
            .cloned()
            .collect()
    }
}

/// Interface parameters reported by the OpenVPN client
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct OpenvpnTunConfig {
    pub mtu: Option<u32>,
    pub address: String,
    pub netmask: String,
}

/// One OpenVPN client message; a message may carry several parts
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpenvpnMessage {
    pub config: Option<OpenvpnTunConfig>,
    pub update_state: Option<i32>,
    pub setup_vpn_tun: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageKind {
    IpsecStarted,
    SwanctlLoaded,
    IpsecConnected,
    L2tpStarted,
    L2tpConfigured,
    L2tpConnected,
    UpdateConfig(TunnelUpdate),
    Openvpn(OpenvpnMessage),
    /// Tag no state machine understands
    Unknown(String),
}

/// Parsed stage notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageMessage {
    pub kind: StageKind,
    /// Log-safe rendering of the raw message
    pub display: String,
}

impl StageMessage {
    pub fn parse(raw: &str) -> VpnResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(VpnError::Parse("empty stage message".to_string()));
        }

        let kind = match trimmed {
            IPSEC_STARTED_TAG => StageKind::IpsecStarted,
            SWANCTL_LOADED_TAG => StageKind::SwanctlLoaded,
            IPSEC_CONNECT_TAG => StageKind::IpsecConnected,
            L2TP_STARTED_TAG => StageKind::L2tpStarted,
            L2TP_CONFIGURED_TAG => StageKind::L2tpConfigured,
            L2TP_CONNECTED_TAG => StageKind::L2tpConnected,
            _ if trimmed.starts_with(OPENVPN_ROOT) => StageKind::Openvpn(parse_openvpn(trimmed)?),
            _ if trimmed.starts_with('{') => parse_json_stage(trimmed)?,
            other => StageKind::Unknown(other.to_string()),
        };

        Ok(Self { kind, display: mask_openvpn_message(trimmed) })
    }

    /// Build from an already known kind
    pub fn new(kind: StageKind) -> Self {
        let display = match &kind {
            StageKind::IpsecStarted => IPSEC_STARTED_TAG.to_string(),
            StageKind::SwanctlLoaded => SWANCTL_LOADED_TAG.to_string(),
            StageKind::IpsecConnected => IPSEC_CONNECT_TAG.to_string(),
            StageKind::L2tpStarted => L2TP_STARTED_TAG.to_string(),
            StageKind::L2tpConfigured => L2TP_CONFIGURED_TAG.to_string(),
            StageKind::L2tpConnected => L2TP_CONNECTED_TAG.to_string(),
            StageKind::UpdateConfig(_) => UPDATE_CONFIG_KEY.to_string(),
            StageKind::Openvpn(_) => OPENVPN_ROOT.to_string(),
            StageKind::Unknown(tag) => tag.clone(),
        };
        Self { kind, display }
    }
}

impl fmt::Display for StageMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

fn json_object(raw: &str) -> VpnResult<serde_json::Map<String, Value>> {
    let start = raw
        .find('{')
        .ok_or_else(|| VpnError::Parse("stage payload has no JSON object".to_string()))?;
    match serde_json::from_str::<Value>(&raw[start..])? {
        Value::Object(map) => Ok(map),
        _ => Err(VpnError::Parse("stage payload is not a JSON object".to_string())),
    }
}

fn parse_openvpn(raw: &str) -> VpnResult<OpenvpnMessage> {
    let map = json_object(raw)?;
    let mut message = OpenvpnMessage::default();

    if let Some(config) = map.get(OPENVPN_CONFIG_KEY).filter(|v| v.is_object()) {
        message.config = Some(serde_json::from_value(config.clone())?);
    }
    if let Some(update) = map.get("updateState").and_then(Value::as_object) {
        let state = update
            .get("state")
            .and_then(Value::as_i64)
            .ok_or_else(|| VpnError::Parse("updateState without numeric state".to_string()))?;
        message.update_state = Some(
            i32::try_from(state).map_err(|_| VpnError::Parse(format!("state {} out of range", state)))?,
        );
    }
    message.setup_vpn_tun = map.get("setupVpnTun").map(Value::is_object).unwrap_or(false);
    Ok(message)
}

fn parse_json_stage(raw: &str) -> VpnResult<StageKind> {
    let map = json_object(raw)?;
    match map.get(UPDATE_CONFIG_KEY) {
        Some(update) if update.is_object() => {
            Ok(StageKind::UpdateConfig(serde_json::from_value(update.clone())?))
        }
        _ => Ok(StageKind::Unknown(raw.to_string())),
    }
}

/// Replace everything after the `config` key of an OpenVPN client message
pub fn mask_openvpn_message(msg: &str) -> String {
    if !msg.starts_with(OPENVPN_ROOT) {
        return msg.to_string();
    }
    match msg.find(OPENVPN_CONFIG_KEY) {
        Some(pos) => {
            let keep = pos + OPENVPN_CONFIG_KEY.len();
            if keep < msg.len() {
                format!("{}{}", &msg[..keep], MASK_TAG)
            } else {
                msg.to_string()
            }
        }
        None => msg.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_tags() {
        assert_eq!(StageMessage::parse("ipsec-started").unwrap().kind, StageKind::IpsecStarted);
        assert_eq!(StageMessage::parse(" swanctl-loaded\n").unwrap().kind, StageKind::SwanctlLoaded);
        assert_eq!(StageMessage::parse("connect").unwrap().kind, StageKind::IpsecConnected);
        assert_eq!(StageMessage::parse("l2tp-connected").unwrap().kind, StageKind::L2tpConnected);
        assert_eq!(
            StageMessage::parse("something-else").unwrap().kind,
            StageKind::Unknown("something-else".into())
        );
        assert!(StageMessage::parse("  ").is_err());
    }

    #[test]
    fn test_update_config() {
        let msg = StageMessage::parse(
            r#"{"updateconfig":{"mtu":1400,"address":"10.2.0.5","netmask":"255.255.255.0","phyifname":"wlan0","remoteip":"203.0.113.9","primarydns":"10.2.0.1"}}"#,
        )
        .unwrap();
        let StageKind::UpdateConfig(update) = msg.kind else { panic!("expected update") };
        assert_eq!(update.mtu, Some(1400));
        assert_eq!(update.address, "10.2.0.5");
        assert_eq!(update.phy_ifname, "wlan0");
        assert_eq!(update.remote_ip, "203.0.113.9");
        assert_eq!(update.dns(), vec!["10.2.0.1".to_string()]);
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(StageMessage::parse("{\"updateconfig\":"), Err(VpnError::Parse(_))));
        assert!(matches!(StageMessage::parse("openvpn{oops"), Err(VpnError::Parse(_))));
        assert!(matches!(StageMessage::parse("openvpn no json"), Err(VpnError::Parse(_))));
    }

    #[test]
    fn test_openvpn_messages() {
        let msg = StageMessage::parse(r#"openvpn{"config":{"address":"10.8.0.6","netmask":"255.255.255.0","mtu":1500}}"#).unwrap();
        let StageKind::Openvpn(ovpn) = msg.kind else { panic!("expected openvpn") };
        let config = ovpn.config.unwrap();
        assert_eq!(config.address, "10.8.0.6");
        assert_eq!(config.mtu, Some(1500));
        assert!(!ovpn.setup_vpn_tun);
        assert_eq!(msg.display, "openvpn{\"config***");

        let msg = StageMessage::parse(r#"openvpn{"updateState":{"state":203}}"#).unwrap();
        assert_eq!(
            msg.kind,
            StageKind::Openvpn(OpenvpnMessage { update_state: Some(203), ..Default::default() })
        );

        let msg = StageMessage::parse(r#"openvpn{"setupVpnTun":{}}"#).unwrap();
        assert_eq!(
            msg.kind,
            StageKind::Openvpn(OpenvpnMessage { setup_vpn_tun: true, ..Default::default() })
        );

        assert!(StageMessage::parse(r#"openvpn{"updateState":{"state":"x"}}"#).is_err());
    }

    #[test]
    fn test_mask() {
        assert_eq!(mask_openvpn_message("openvpn{\"config\":{\"address\":\"secret\"}}"), "openvpn{\"config***");
        assert_eq!(mask_openvpn_message("openvpn{\"setupVpnTun\":{}}"), "openvpn{\"setupVpnTun\":{}}");
        assert_eq!(mask_openvpn_message("connect"), "connect");
    }
}
