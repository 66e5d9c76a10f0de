//! VPN configuration and runtime types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::error::{VpnError, VpnResult};

/// System VPN protocol variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum VpnType {
    Ikev2IpsecMschapv2,
    Ikev2IpsecPsk,
    Ikev2IpsecRsa,
    L2tpIpsecPsk,
    L2tpIpsecRsa,
    IpsecXauthPsk,
    IpsecXauthRsa,
    IpsecHybridRsa,
    Openvpn,
    L2tp,
    VirtualVpn,
}

/// Daemon family a [`VpnType`] is driven by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VpnFamily {
    Ipsec,
    L2tp,
    Openvpn,
    Virtual,
}

impl VpnType {
    pub const ALL: [VpnType; 11] = [
        VpnType::Ikev2IpsecMschapv2,
        VpnType::Ikev2IpsecPsk,
        VpnType::Ikev2IpsecRsa,
        VpnType::L2tpIpsecPsk,
        VpnType::L2tpIpsecRsa,
        VpnType::IpsecXauthPsk,
        VpnType::IpsecXauthRsa,
        VpnType::IpsecHybridRsa,
        VpnType::Openvpn,
        VpnType::L2tp,
        VpnType::VirtualVpn,
    ];

    pub fn code(self) -> i32 {
        match self {
            VpnType::Ikev2IpsecMschapv2 => 1,
            VpnType::Ikev2IpsecPsk => 2,
            VpnType::Ikev2IpsecRsa => 3,
            VpnType::L2tpIpsecPsk => 4,
            VpnType::L2tpIpsecRsa => 5,
            VpnType::IpsecXauthPsk => 6,
            VpnType::IpsecXauthRsa => 7,
            VpnType::IpsecHybridRsa => 8,
            VpnType::Openvpn => 9,
            VpnType::L2tp => 10,
            VpnType::VirtualVpn => 11,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }

    pub fn family(self) -> VpnFamily {
        match self {
            VpnType::Ikev2IpsecMschapv2
            | VpnType::Ikev2IpsecPsk
            | VpnType::Ikev2IpsecRsa
            | VpnType::IpsecXauthPsk
            | VpnType::IpsecXauthRsa
            | VpnType::IpsecHybridRsa => VpnFamily::Ipsec,
            VpnType::L2tpIpsecPsk | VpnType::L2tpIpsecRsa | VpnType::L2tp => VpnFamily::L2tp,
            VpnType::Openvpn => VpnFamily::Openvpn,
            VpnType::VirtualVpn => VpnFamily::Virtual,
        }
    }
}

impl TryFrom<i32> for VpnType {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        VpnType::from_code(code).ok_or_else(|| format!("unknown vpn type {}", code))
    }
}

impl From<VpnType> for i32 {
    fn from(t: VpnType) -> i32 {
        t.code()
    }
}

impl fmt::Display for VpnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VpnType::Ikev2IpsecMschapv2 => "IKEV2_IPSEC_MSCHAPv2",
            VpnType::Ikev2IpsecPsk => "IKEV2_IPSEC_PSK",
            VpnType::Ikev2IpsecRsa => "IKEV2_IPSEC_RSA",
            VpnType::L2tpIpsecPsk => "L2TP_IPSEC_PSK",
            VpnType::L2tpIpsecRsa => "L2TP_IPSEC_RSA",
            VpnType::IpsecXauthPsk => "IPSEC_XAUTH_PSK",
            VpnType::IpsecXauthRsa => "IPSEC_XAUTH_RSA",
            VpnType::IpsecHybridRsa => "IPSEC_HYBRID_RSA",
            VpnType::Openvpn => "OPENVPN",
            VpnType::L2tp => "L2TP",
            VpnType::VirtualVpn => "VIRTUAL_VPN",
        };
        f.write_str(name)
    }
}

/// Connection state reported to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VpnConnectState {
    Connected,
    #[default]
    Disconnected,
}

/// Address with prefix length
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct INetAddr {
    pub address: String,
    pub prefix_len: u8,
}

impl INetAddr {
    pub fn new(address: impl Into<String>, prefix_len: u8) -> Self {
        Self { address: address.into(), prefix_len }
    }

    pub fn is_ipv6(&self) -> bool {
        self.address.parse::<IpAddr>().map(|a| a.is_ipv6()).unwrap_or(false)
    }

    /// Default-route destination matching this address' family
    pub fn any_for(&self) -> INetAddr {
        if self.is_ipv6() {
            INetAddr::new("::", 0)
        } else {
            INetAddr::new("0.0.0.0", 0)
        }
    }
}

/// Prefix length of a dotted IPv4 netmask, rejecting non-contiguous masks
pub fn netmask_to_prefix_len(netmask: &str) -> VpnResult<u8> {
    let mask: Ipv4Addr = netmask
        .trim()
        .parse()
        .map_err(|_| VpnError::Parse(format!("invalid netmask '{}'", netmask)))?;
    let bits = u32::from(mask);
    let ones = bits.leading_ones();
    if bits.checked_shl(ones).unwrap_or(0) != 0 {
        return Err(VpnError::Parse(format!("non-contiguous netmask '{}'", netmask)));
    }
    Ok(ones as u8)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Route {
    /// Interface the route is bound to, rewritten to the tunnel interface on setup
    pub iface: String,
    pub destination: INetAddr,
    pub gateway: Option<String>,
    pub is_default: bool,
}

impl Route {
    pub fn default_via(iface: &str, family_of: &INetAddr) -> Self {
        Self {
            iface: iface.to_string(),
            destination: family_of.any_for(),
            gateway: None,
            is_default: true,
        }
    }
}

/// Network parameters of one tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VpnConfig {
    /// Local tunnel addresses
    pub addresses: Vec<INetAddr>,
    pub routes: Vec<Route>,
    /// Zero leaves the interface default
    pub mtu: u32,
    pub dns_addresses: Vec<String>,
    pub search_domains: Vec<String>,
    /// Bundle names routed through the tunnel
    pub accepted_applications: Vec<String>,
    /// Bundle names excluded from the tunnel
    pub refused_applications: Vec<String>,
    pub is_metered: bool,
    pub is_legacy: bool,
}

impl VpnConfig {
    /// First local address, the one checked for collisions
    pub fn local_address(&self) -> &str {
        self.addresses.first().map(|a| a.address.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OpenvpnConfig {
    pub ovpn_port: String,
    pub ovpn_protocol: i32,
    /// Base64 encoded client configuration
    pub ovpn_config: String,
    pub ovpn_auth_type: i32,
    pub askpass: String,
    pub ovpn_config_file_path: String,
    pub ovpn_ca_cert_file_path: String,
    pub ovpn_user_cert_file_path: String,
    pub ovpn_private_key_file_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IpsecVpnConfig {
    pub ipsec_pre_shared_key: String,
    pub ipsec_identifier: String,
    /// Base64 swanctl.conf
    pub swanctl_conf: String,
    /// Base64 strongswan.conf
    pub strongswan_conf: String,
    pub ipsec_ca_cert_conf: String,
    pub ipsec_private_user_cert_conf: String,
    pub ipsec_public_user_cert_conf: String,
    pub ipsec_private_server_cert_conf: String,
    pub ipsec_public_server_cert_conf: String,
    pub ipsec_ca_cert_file_path: String,
    pub ipsec_private_user_cert_file_path: String,
    pub ipsec_public_user_cert_file_path: String,
    pub ipsec_private_server_cert_file_path: String,
    pub ipsec_public_server_cert_file_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct L2tpVpnConfig {
    #[serde(flatten)]
    pub ipsec: IpsecVpnConfig,
    /// Base64 ipsec.conf for the transport-mode connection
    pub ipsec_conf: String,
    /// Base64 ipsec.secrets
    pub ipsec_secrets: String,
    /// Base64 ppp options file
    pub options_l2tpd_client: String,
    /// Base64 xl2tpd.conf
    pub xl2tpd_conf: String,
    pub l2tp_shared_key: String,
}

/// Protocol specific part of a system VPN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VpnPayload {
    Openvpn(OpenvpnConfig),
    Ipsec(IpsecVpnConfig),
    L2tp(L2tpVpnConfig),
    Virtual,
}

impl VpnPayload {
    /// Empty payload for a type
    pub fn empty_for(vpn_type: VpnType) -> Self {
        match vpn_type.family() {
            VpnFamily::Openvpn => VpnPayload::Openvpn(OpenvpnConfig::default()),
            VpnFamily::Ipsec => VpnPayload::Ipsec(IpsecVpnConfig::default()),
            VpnFamily::L2tp => VpnPayload::L2tp(L2tpVpnConfig::default()),
            VpnFamily::Virtual => VpnPayload::Virtual,
        }
    }

    fn family(&self) -> VpnFamily {
        match self {
            VpnPayload::Openvpn(_) => VpnFamily::Openvpn,
            VpnPayload::Ipsec(_) => VpnFamily::Ipsec,
            VpnPayload::L2tp(_) => VpnFamily::L2tp,
            VpnPayload::Virtual => VpnFamily::Virtual,
        }
    }
}

/// A persisted system VPN profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysVpnConfig {
    pub vpn_id: String,
    pub vpn_name: String,
    pub vpn_type: VpnType,
    /// Server address
    #[serde(default)]
    pub vpn_address: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub user_id: i32,
    #[serde(default)]
    pub save_login: bool,
    /// Comma separated CIDRs routed through the tunnel
    #[serde(default)]
    pub forwarding_routes: String,
    #[serde(default)]
    pub network: VpnConfig,
    pub payload: VpnPayload,
}

impl SysVpnConfig {
    pub fn new(vpn_id: impl Into<String>, vpn_name: impl Into<String>, vpn_type: VpnType) -> Self {
        Self {
            vpn_id: vpn_id.into(),
            vpn_name: vpn_name.into(),
            vpn_type,
            vpn_address: String::new(),
            user_name: String::new(),
            password: String::new(),
            user_id: 0,
            save_login: false,
            forwarding_routes: String::new(),
            network: VpnConfig::default(),
            payload: VpnPayload::empty_for(vpn_type),
        }
    }

    /// Reject profiles whose payload does not match the declared type
    pub fn validate(&self) -> VpnResult<()> {
        if self.vpn_id.is_empty() {
            return Err(VpnError::InvalidConfig("vpn id is empty".to_string()));
        }
        if self.payload.family() != self.vpn_type.family() {
            return Err(VpnError::InvalidConfig(format!(
                "payload does not match vpn type {}",
                self.vpn_type
            )));
        }
        Ok(())
    }

    pub fn openvpn(&self) -> Option<&OpenvpnConfig> {
        match &self.payload {
            VpnPayload::Openvpn(c) => Some(c),
            _ => None,
        }
    }

    pub fn ipsec(&self) -> Option<&IpsecVpnConfig> {
        match &self.payload {
            VpnPayload::Ipsec(c) => Some(c),
            VpnPayload::L2tp(c) => Some(&c.ipsec),
            _ => None,
        }
    }

    pub fn l2tp(&self) -> Option<&L2tpVpnConfig> {
        match &self.payload {
            VpnPayload::L2tp(c) => Some(c),
            _ => None,
        }
    }
}

/// Listing entry for stored profiles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysVpnSummary {
    pub vpn_id: String,
    pub vpn_name: String,
    pub vpn_type: VpnType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vpn_type_codes() {
        for t in VpnType::ALL {
            assert_eq!(VpnType::from_code(t.code()), Some(t));
        }
        assert_eq!(VpnType::from_code(0), None);
        assert_eq!(VpnType::from_code(42), None);
    }

    #[test]
    fn test_vpn_type_family() {
        assert_eq!(VpnType::Ikev2IpsecPsk.family(), VpnFamily::Ipsec);
        assert_eq!(VpnType::IpsecHybridRsa.family(), VpnFamily::Ipsec);
        assert_eq!(VpnType::L2tpIpsecRsa.family(), VpnFamily::L2tp);
        assert_eq!(VpnType::L2tp.family(), VpnFamily::L2tp);
        assert_eq!(VpnType::Openvpn.family(), VpnFamily::Openvpn);
        assert_eq!(VpnType::VirtualVpn.family(), VpnFamily::Virtual);
    }

    #[test]
    fn test_netmask_to_prefix_len() {
        assert_eq!(netmask_to_prefix_len("255.255.255.0").unwrap(), 24);
        assert_eq!(netmask_to_prefix_len("255.255.255.255").unwrap(), 32);
        assert_eq!(netmask_to_prefix_len("0.0.0.0").unwrap(), 0);
        assert_eq!(netmask_to_prefix_len("255.255.128.0").unwrap(), 17);
        assert!(netmask_to_prefix_len("255.0.255.0").is_err());
        assert!(netmask_to_prefix_len("not-a-mask").is_err());
    }

    #[test]
    fn test_validate_payload_matches_type() {
        let mut config = SysVpnConfig::new("id-1", "office", VpnType::Ikev2IpsecPsk);
        assert!(config.validate().is_ok());
        config.payload = VpnPayload::Openvpn(OpenvpnConfig::default());
        assert!(matches!(config.validate(), Err(VpnError::InvalidConfig(_))));

        let empty_id = SysVpnConfig::new("", "x", VpnType::L2tp);
        assert!(empty_id.validate().is_err());
    }

    #[test]
    fn test_serde_tagged_payload() {
        let mut config = SysVpnConfig::new("id-2", "home", VpnType::L2tpIpsecPsk);
        if let VpnPayload::L2tp(l2tp) = &mut config.payload {
            l2tp.l2tp_shared_key = "k".into();
            l2tp.ipsec.ipsec_identifier = "me".into();
        }
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["vpn_type"], 4);
        assert_eq!(json["payload"]["kind"], "l2tp");
        assert_eq!(json["payload"]["ipsec_identifier"], "me");

        let back: SysVpnConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
        assert_eq!(back.ipsec().unwrap().ipsec_identifier, "me");
    }

    #[test]
    fn test_default_route_family() {
        let v4 = INetAddr::new("10.0.0.2", 24);
        let v6 = INetAddr::new("fd00::2", 64);
        assert_eq!(Route::default_via("tun0", &v4).destination.address, "0.0.0.0");
        assert_eq!(Route::default_via("tun0", &v6).destination.address, "::");
    }
}
