//! Flat persisted form of a system VPN profile

use serde::{Deserialize, Serialize};

use crate::error::{VpnError, VpnResult};
use crate::vpn::types::{
    IpsecVpnConfig, L2tpVpnConfig, OpenvpnConfig, SysVpnConfig, SysVpnSummary, VpnConfig,
    VpnPayload, VpnType,
};

const LIST_SEPARATOR: char = ',';

/// One stored row. Every field is present regardless of vpn type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct VpnRecord {
    pub vpn_id: String,
    pub vpn_name: String,
    pub vpn_type: i32,
    pub vpn_address: String,
    pub user_name: String,
    pub password: String,
    pub user_id: i32,
    pub is_legacy: bool,
    pub save_login: bool,
    pub forwarding_routes: String,
    pub dns_addresses: String,
    pub search_domains: String,

    pub ovpn_port: String,
    pub ovpn_protocol: i32,
    pub ovpn_config: String,
    pub ovpn_auth_type: i32,
    pub askpass: String,
    pub ovpn_config_file_path: String,
    pub ovpn_ca_cert_file_path: String,
    pub ovpn_user_cert_file_path: String,
    pub ovpn_private_key_file_path: String,

    pub ipsec_pre_shared_key: String,
    pub ipsec_identifier: String,
    pub swanctl_conf: String,
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
    pub ipsec_conf: String,
    pub ipsec_secrets: String,
    pub options_l2tpd_client: String,
    pub xl2tpd_conf: String,
    pub l2tp_shared_key: String,
}

fn join_list(items: &[String]) -> String {
    items.join(&LIST_SEPARATOR.to_string())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(LIST_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl VpnRecord {
    /// Fields sealed before the record is written
    pub fn secret_fields_mut(&mut self) -> [&mut String; 8] {
        [
            &mut self.user_name,
            &mut self.password,
            &mut self.ipsec_pre_shared_key,
            &mut self.l2tp_shared_key,
            &mut self.askpass,
            &mut self.swanctl_conf,
            &mut self.options_l2tpd_client,
            &mut self.ipsec_secrets,
        ]
    }

    pub fn summary(&self) -> VpnResult<SysVpnSummary> {
        Ok(SysVpnSummary {
            vpn_id: self.vpn_id.clone(),
            vpn_name: self.vpn_name.clone(),
            vpn_type: self.parsed_type()?,
        })
    }

    fn parsed_type(&self) -> VpnResult<VpnType> {
        VpnType::from_code(self.vpn_type)
            .ok_or_else(|| VpnError::Store(format!("record {} has unknown vpn type {}", self.vpn_id, self.vpn_type)))
    }

    fn put_ipsec(&mut self, c: &IpsecVpnConfig) {
        self.ipsec_pre_shared_key = c.ipsec_pre_shared_key.clone();
        self.ipsec_identifier = c.ipsec_identifier.clone();
        self.swanctl_conf = c.swanctl_conf.clone();
        self.strongswan_conf = c.strongswan_conf.clone();
        self.ipsec_ca_cert_conf = c.ipsec_ca_cert_conf.clone();
        self.ipsec_private_user_cert_conf = c.ipsec_private_user_cert_conf.clone();
        self.ipsec_public_user_cert_conf = c.ipsec_public_user_cert_conf.clone();
        self.ipsec_private_server_cert_conf = c.ipsec_private_server_cert_conf.clone();
        self.ipsec_public_server_cert_conf = c.ipsec_public_server_cert_conf.clone();
        self.ipsec_ca_cert_file_path = c.ipsec_ca_cert_file_path.clone();
        self.ipsec_private_user_cert_file_path = c.ipsec_private_user_cert_file_path.clone();
        self.ipsec_public_user_cert_file_path = c.ipsec_public_user_cert_file_path.clone();
        self.ipsec_private_server_cert_file_path = c.ipsec_private_server_cert_file_path.clone();
        self.ipsec_public_server_cert_file_path = c.ipsec_public_server_cert_file_path.clone();
    }

    fn take_ipsec(&self) -> IpsecVpnConfig {
        IpsecVpnConfig {
            ipsec_pre_shared_key: self.ipsec_pre_shared_key.clone(),
            ipsec_identifier: self.ipsec_identifier.clone(),
            swanctl_conf: self.swanctl_conf.clone(),
            strongswan_conf: self.strongswan_conf.clone(),
            ipsec_ca_cert_conf: self.ipsec_ca_cert_conf.clone(),
            ipsec_private_user_cert_conf: self.ipsec_private_user_cert_conf.clone(),
            ipsec_public_user_cert_conf: self.ipsec_public_user_cert_conf.clone(),
            ipsec_private_server_cert_conf: self.ipsec_private_server_cert_conf.clone(),
            ipsec_public_server_cert_conf: self.ipsec_public_server_cert_conf.clone(),
            ipsec_ca_cert_file_path: self.ipsec_ca_cert_file_path.clone(),
            ipsec_private_user_cert_file_path: self.ipsec_private_user_cert_file_path.clone(),
            ipsec_public_user_cert_file_path: self.ipsec_public_user_cert_file_path.clone(),
            ipsec_private_server_cert_file_path: self.ipsec_private_server_cert_file_path.clone(),
            ipsec_public_server_cert_file_path: self.ipsec_public_server_cert_file_path.clone(),
        }
    }
}

impl From<&SysVpnConfig> for VpnRecord {
    fn from(config: &SysVpnConfig) -> Self {
        let mut record = VpnRecord {
            vpn_id: config.vpn_id.clone(),
            vpn_name: config.vpn_name.clone(),
            vpn_type: config.vpn_type.code(),
            vpn_address: config.vpn_address.clone(),
            user_name: config.user_name.clone(),
            password: config.password.clone(),
            user_id: config.user_id,
            is_legacy: config.network.is_legacy,
            save_login: config.save_login,
            forwarding_routes: config.forwarding_routes.clone(),
            dns_addresses: join_list(&config.network.dns_addresses),
            search_domains: join_list(&config.network.search_domains),
            ..Default::default()
        };

        match &config.payload {
            VpnPayload::Openvpn(c) => {
                record.ovpn_port = c.ovpn_port.clone();
                record.ovpn_protocol = c.ovpn_protocol;
                record.ovpn_config = c.ovpn_config.clone();
                record.ovpn_auth_type = c.ovpn_auth_type;
                record.askpass = c.askpass.clone();
                record.ovpn_config_file_path = c.ovpn_config_file_path.clone();
                record.ovpn_ca_cert_file_path = c.ovpn_ca_cert_file_path.clone();
                record.ovpn_user_cert_file_path = c.ovpn_user_cert_file_path.clone();
                record.ovpn_private_key_file_path = c.ovpn_private_key_file_path.clone();
            }
            VpnPayload::Ipsec(c) => record.put_ipsec(c),
            VpnPayload::L2tp(c) => {
                record.put_ipsec(&c.ipsec);
                record.ipsec_conf = c.ipsec_conf.clone();
                record.ipsec_secrets = c.ipsec_secrets.clone();
                record.options_l2tpd_client = c.options_l2tpd_client.clone();
                record.xl2tpd_conf = c.xl2tpd_conf.clone();
                record.l2tp_shared_key = c.l2tp_shared_key.clone();
            }
            VpnPayload::Virtual => {}
        }
        record
    }
}

impl TryFrom<&VpnRecord> for SysVpnConfig {
    type Error = VpnError;

    fn try_from(record: &VpnRecord) -> VpnResult<Self> {
        let vpn_type = record.parsed_type()?;
        let payload = match VpnPayload::empty_for(vpn_type) {
            VpnPayload::Openvpn(_) => VpnPayload::Openvpn(OpenvpnConfig {
                ovpn_port: record.ovpn_port.clone(),
                ovpn_protocol: record.ovpn_protocol,
                ovpn_config: record.ovpn_config.clone(),
                ovpn_auth_type: record.ovpn_auth_type,
                askpass: record.askpass.clone(),
                ovpn_config_file_path: record.ovpn_config_file_path.clone(),
                ovpn_ca_cert_file_path: record.ovpn_ca_cert_file_path.clone(),
                ovpn_user_cert_file_path: record.ovpn_user_cert_file_path.clone(),
                ovpn_private_key_file_path: record.ovpn_private_key_file_path.clone(),
            }),
            VpnPayload::Ipsec(_) => VpnPayload::Ipsec(record.take_ipsec()),
            VpnPayload::L2tp(_) => VpnPayload::L2tp(L2tpVpnConfig {
                ipsec: record.take_ipsec(),
                ipsec_conf: record.ipsec_conf.clone(),
                ipsec_secrets: record.ipsec_secrets.clone(),
                options_l2tpd_client: record.options_l2tpd_client.clone(),
                xl2tpd_conf: record.xl2tpd_conf.clone(),
                l2tp_shared_key: record.l2tp_shared_key.clone(),
            }),
            VpnPayload::Virtual => VpnPayload::Virtual,
        };

        Ok(SysVpnConfig {
            vpn_id: record.vpn_id.clone(),
            vpn_name: record.vpn_name.clone(),
            vpn_type,
            vpn_address: record.vpn_address.clone(),
            user_name: record.user_name.clone(),
            password: record.password.clone(),
            user_id: record.user_id,
            save_login: record.save_login,
            forwarding_routes: record.forwarding_routes.clone(),
            network: VpnConfig {
                dns_addresses: split_list(&record.dns_addresses),
                search_domains: split_list(&record.search_domains),
                is_legacy: record.is_legacy,
                ..Default::default()
            },
            payload,
        })
    }
}
