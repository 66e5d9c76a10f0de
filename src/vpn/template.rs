//! Daemon config generation for IPsec and L2TP profiles
//!
//! Profiles created without pre-built daemon configs get theirs generated
//! from fixed templates. Placeholders are replaced by profile values, and
//! every generated file is stored base64 encoded like an imported one.

use std::path::Path;
use tracing::debug;

use super::common::encode_base64;
use super::types::{IpsecVpnConfig, L2tpVpnConfig, SysVpnConfig, VpnPayload, VpnType};
use crate::error::{VpnError, VpnResult};

const KEY_VPN_ADDRESS: &str = "vpn_address_value";
const KEY_VPN_USERNAME: &str = "vpn_username_value";
const KEY_VPN_IPSEC_IDENTIFIER: &str = "vpn_ipsec_identifier_value";
const KEY_VPN_PASSWORD: &str = "vpn_password_value";
const KEY_VPN_IPSEC_SHARED_KEY: &str = "vpn_ipsec_sharedKey_value";
const KEY_VPN_DIR: &str = "vpn_dir_value";

const IKEV2_MSCHAPV2_SWANCTL: &str = r#"
connections {
    home {
        remote_addrs = vpn_address_value
        vips = 0.0.0.0
        local {
            auth = eap-mschapv2
            eap_id = vpn_username_value
        }
        remote {
            auth = pubkey
        }
        children {
            home {
                remote_ts=0.0.0.0/0
                esp_proposals = aes128gcm128-x25519
            }
        }
        version = 2
        proposals = aes128-sha256-x25519
    }
}
secrets {
    eap-dave {
        id = vpn_username_value
        secret = vpn_password_value
    }
}"#;

const IKEV2_PSK_SWANCTL: &str = r#"
connections {
    home {
        remote_addrs = vpn_address_value
        vips = 0.0.0.0
        local {
            auth = psk
        }
        remote {
            auth = psk
            id = vpn_ipsec_identifier_value
        }
        children {
            home {
                remote_ts=0.0.0.0/0
                esp_proposals = aes128gcm128-x25519
            }
        }
        version = 2
        proposals = aes128-sha256-x25519
    }
}
secrets {
    ike-moon {
        id = vpn_ipsec_identifier_value
        secret = vpn_ipsec_sharedKey_value
    }
}"#;

const IKEV2_RSA_SWANCTL: &str = r#"
connections {
    home {
        remote_addrs = vpn_address_value
        vips = 0.0.0.0
        local {
            auth = pubkey
            certs = vpn_dir_value/client.cert.pem
            id = vpn_ipsec_identifier_value
        }
        remote {
            auth = pubkey
        }
        children {
            home {
                remote_ts=0.0.0.0/0
                esp_proposals = aes128gcm128-x25519
            }
        }
        version = 2
        proposals = aes128-sha256-x25519
    }
}"#;

const HYBRID_RSA_SWANCTL: &str = r#"
connections {
    home {
        remote_addrs = vpn_address_value
        vips = 0.0.0.0
        local {
            auth = xauth
            xauth_id = vpn_username_value
        }
        remote {
            auth = pubkey
        }
        children {
            home {
                remote_ts=0.0.0.0/0
                esp_proposals = aes256-sha2_384
            }
        }
        version = 1
        proposals = aes256-sha2_384-modp1024
    }
}
secrets {
    xauth {
        id = vpn_username_value
        secret = vpn_password_value
    }
}"#;

const XAUTH_PSK_SWANCTL: &str = r#"
connections {
    home {
        remote_addrs = vpn_address_value
        vips = 0.0.0.0
        local {
            auth = psk
        }
        local-xauth {
            auth = xauth
            xauth_id = vpn_username_value
        }
        remote {
            auth = psk
        }
        children {
            home {
                remote_ts=0.0.0.0/0
                esp_proposals = aes256-sha2_384
            }
        }
        version = 1
        proposals = aes256-sha2_384-modp1024
        aggressive = yes
    }
}
secrets {
    ike-moon {
        secret = vpn_ipsec_sharedKey_value
    }
    xauth {
        id = vpn_username_value
        secret = vpn_password_value
    }
}"#;

const XAUTH_RSA_SWANCTL: &str = r#"
connections {
    home {
        remote_addrs = vpn_address_value
        vips = 0.0.0.0
        local {
            auth = pubkey
            certs = vpn_dir_value/client.cert.pem
            id = vpn_username_value
        }
        local-xauth {
            auth = xauth
        }
        remote {
            auth = pubkey
        }
        children {
            home {
                remote_ts=0.0.0.0/0
                esp_proposals = aes256-sha2_384
            }
        }
        version = 1
        proposals = aes256-sha2_384-modp1024
    }
}
secrets {
    xauth-carol {
        id = vpn_username_value
        secret = vpn_password_value
    }
}"#;

const XL2TPD_CONF: &str = r#"
[lac myVPN]
lns = vpn_address_value
ppp debug = yes
pppoptfile = vpn_dir_value/options.l2tpd.client.conf
length bit = yes
"#;

const OPTIONS_L2TPD_CLIENT: &str = r#"
ipcp-accept-local
ipcp-accept-remote
refuse-eap
require-mschap-v2
noccp
noauth
logfile vpn_dir_value/xl2tpd.log
idle 1800
mtu 1410
mru 1410
defaultroute
usepeerdns
debug
connect-delay 5000
name vpn_username_value
password vpn_password_value
"#;

const L2TP_RSA_IPSEC_CONF: &str = r#"
config setup
    uniqueids=no
conn %default
    dpdaction=clear
    dpddelay=300s
    rekey=no
    left=%defaultroute
    leftfirewall=yes
    ikelifetime=60m
    keylife=20m
    rekeymargin=3m
    keyingtries=1
    auto=add
conn home
    type=transport
    ike=aes256-sha2_384-modp1024
    esp=aes256-sha2_384
    keyexchange=ikev1
    authby=pubkey
    leftcert=vpn_dir_value/client.cert.pem
    leftprotoport=udp/l2tp
    right=vpn_address_value
"#;

const L2TP_PSK_IPSEC_CONF: &str = r#"
config setup
conn %default
    ikelifetime=60m
    keylife=20m
    rekeymargin=3m
    keyingtries=1
    keyexchange=ikev1
    authby=secret
    ike=aes128-sha1-modp1024,3des-sha1-modp1024!
    esp=aes128-sha1-modp1024,3des-sha1-modp1024!
conn home
    keyexchange=ikev1
    left=%defaultroute
    auto=add
    authby=secret
    type=transport
    leftprotoport=17/1701
    rightprotoport=17/1701
    right=vpn_address_value
    rightid=%any
"#;

const L2TP_RSA_IPSEC_SECRETS: &str = "\n: RSA vpn_dir_value/client.key.pem";
const L2TP_PSK_IPSEC_SECRETS: &str = "\n: PSK vpn_ipsec_sharedKey_value";

const STRONGSWAN_HEADER: &str = "# /etc/strongswan.conf - strongSwan configuration file";

const SWANCTL_PLUGINS: &str = r#"
swanctl {
    load = pem pkcs1 x509 revocation constraints pubkey openssl random
}"#;

const SWANCTL_PSK_PLUGINS: &str = r#"
swanctl {
    load = random openssl
}
charon-systemd {
    load = random nonce aes sha1 sha2 hmac kdf curve25519 kernel-netlink socket-default updown vici kernel-libipsec
}"#;

const CHARON_START: &str = "\ncharon {";

const CHARON_IKEV2_START: &str = r#"
charon {
    plugins {
        kernel-libipsec {
            allow_peer_ts = yes
        }
    }"#;

const CHARON_L2TP_START: &str = r#"
charon {
    load_modular = yes
    plugins {
        include /system/etc/strongswan/strongswan.d/charon/*.conf
        kernel-libipsec {
            load = no
        }
    }"#;

const CHARON_XAUTH_PSK_START: &str = r#"
charon {
    i_dont_care_about_security_and_use_aggressive_mode_psk = yes
    plugins {
        kernel-netlink {
            install_routes_xfrmi = yes
        }
    }"#;

const CHARON_XAUTH_RSA_START: &str = r#"
charon {
    i_dont_care_about_security_and_use_aggressive_mode_psk = yes"#;

const CHARON_END: &str = "\n}";

const STRONGSWAN_INCLUDE: &str = "\ninclude /system/etc/strongswan/strongswan.d/*.conf";

/// Replace every placeholder with its value. Empty values leave the
/// placeholder in place.
pub fn inflate(template: &str, params: &[(&str, &str)]) -> String {
    params.iter().fold(template.to_string(), |conf, (key, value)| {
        if value.is_empty() {
            conf
        } else {
            conf.replace(key, value)
        }
    })
}

fn swanctl_template(vpn_type: VpnType) -> &'static str {
    match vpn_type {
        VpnType::Ikev2IpsecMschapv2 => IKEV2_MSCHAPV2_SWANCTL,
        VpnType::Ikev2IpsecPsk => IKEV2_PSK_SWANCTL,
        VpnType::Ikev2IpsecRsa => IKEV2_RSA_SWANCTL,
        VpnType::IpsecHybridRsa => HYBRID_RSA_SWANCTL,
        VpnType::IpsecXauthPsk => XAUTH_PSK_SWANCTL,
        VpnType::IpsecXauthRsa => XAUTH_RSA_SWANCTL,
        _ => "",
    }
}

/// strongswan.conf text for a profile type
pub fn strongswan_conf(vpn_type: VpnType) -> String {
    let mut conf = String::from(STRONGSWAN_HEADER);
    match vpn_type {
        VpnType::Ikev2IpsecMschapv2
        | VpnType::Ikev2IpsecRsa
        | VpnType::IpsecHybridRsa
        | VpnType::IpsecXauthPsk
        | VpnType::IpsecXauthRsa => conf.push_str(SWANCTL_PLUGINS),
        VpnType::Ikev2IpsecPsk => conf.push_str(SWANCTL_PSK_PLUGINS),
        _ => {}
    }
    conf.push_str(match vpn_type {
        VpnType::Ikev2IpsecPsk => CHARON_IKEV2_START,
        VpnType::L2tpIpsecPsk | VpnType::L2tpIpsecRsa => CHARON_L2TP_START,
        VpnType::IpsecXauthPsk => CHARON_XAUTH_PSK_START,
        VpnType::IpsecXauthRsa => CHARON_XAUTH_RSA_START,
        _ => CHARON_START,
    });
    conf.push_str(CHARON_END);
    if matches!(vpn_type, VpnType::L2tpIpsecPsk | VpnType::L2tpIpsecRsa) {
        conf.push_str(STRONGSWAN_INCLUDE);
    }
    conf
}

/// Fills empty daemon config fields of system profiles
pub struct TemplateProcessor<'a> {
    vpn_dir: &'a Path,
}

impl<'a> TemplateProcessor<'a> {
    pub fn new(vpn_dir: &'a Path) -> Self {
        Self { vpn_dir }
    }

    /// Generate daemon configs for an IPsec or L2TP profile. Profiles of other
    /// families are rejected.
    pub fn build(&self, config: &mut SysVpnConfig) -> VpnResult<()> {
        let vpn_type = config.vpn_type;
        let address = config.vpn_address.clone();
        let user = config.user_name.clone();
        let password = config.password.clone();
        let dir = self.vpn_dir.to_string_lossy().into_owned();

        match &mut config.payload {
            VpnPayload::Ipsec(ipsec) => {
                self.build_ipsec(vpn_type, ipsec, &address, &user, &password, &dir);
            }
            VpnPayload::L2tp(l2tp) => {
                self.build_l2tp(vpn_type, l2tp, &address, &user, &password, &dir);
            }
            _ => {
                return Err(VpnError::InvalidConfig(format!(
                    "no config templates for vpn type {}",
                    vpn_type
                )))
            }
        }
        debug!("Generated daemon configs for {} profile {}", vpn_type, config.vpn_id);
        Ok(())
    }

    fn build_ipsec(
        &self,
        vpn_type: VpnType,
        ipsec: &mut IpsecVpnConfig,
        address: &str,
        user: &str,
        password: &str,
        dir: &str,
    ) {
        let params = [
            (KEY_VPN_ADDRESS, address),
            (KEY_VPN_IPSEC_IDENTIFIER, ipsec.ipsec_identifier.as_str()),
            (KEY_VPN_IPSEC_SHARED_KEY, ipsec.ipsec_pre_shared_key.as_str()),
            (KEY_VPN_USERNAME, user),
            (KEY_VPN_PASSWORD, password),
            (KEY_VPN_DIR, dir),
        ];
        let swanctl = inflate(swanctl_template(vpn_type), &params);
        ipsec.swanctl_conf = encode_base64(&swanctl);
        ipsec.strongswan_conf = encode_base64(&strongswan_conf(vpn_type));
    }

    fn build_l2tp(
        &self,
        vpn_type: VpnType,
        l2tp: &mut L2tpVpnConfig,
        address: &str,
        user: &str,
        password: &str,
        dir: &str,
    ) {
        let shared_key = l2tp.ipsec.ipsec_pre_shared_key.clone();

        let options = inflate(
            OPTIONS_L2TPD_CLIENT,
            &[(KEY_VPN_USERNAME, user), (KEY_VPN_PASSWORD, password), (KEY_VPN_DIR, dir)],
        );
        let xl2tpd = inflate(XL2TPD_CONF, &[(KEY_VPN_ADDRESS, address), (KEY_VPN_DIR, dir)]);
        let (ipsec_conf, secrets) = match vpn_type {
            VpnType::L2tpIpsecRsa => (L2TP_RSA_IPSEC_CONF, L2TP_RSA_IPSEC_SECRETS),
            VpnType::L2tpIpsecPsk => (L2TP_PSK_IPSEC_CONF, L2TP_PSK_IPSEC_SECRETS),
            _ => ("", ""),
        };
        let ipsec_conf = inflate(ipsec_conf, &[(KEY_VPN_ADDRESS, address), (KEY_VPN_DIR, dir)]);
        let secrets = inflate(secrets, &[(KEY_VPN_IPSEC_SHARED_KEY, shared_key.as_str()), (KEY_VPN_DIR, dir)]);

        l2tp.options_l2tpd_client = encode_base64(&options);
        l2tp.xl2tpd_conf = encode_base64(&xl2tpd);
        l2tp.ipsec_conf = encode_base64(&ipsec_conf);
        l2tp.ipsec_secrets = encode_base64(&secrets);
        l2tp.ipsec.strongswan_conf = encode_base64(&strongswan_conf(vpn_type));
    }
}

/// True when the profile lacks the daemon configs it needs to start
pub fn needs_generation(config: &SysVpnConfig) -> bool {
    match &config.payload {
        VpnPayload::Ipsec(ipsec) => ipsec.swanctl_conf.is_empty() || ipsec.strongswan_conf.is_empty(),
        VpnPayload::L2tp(l2tp) => l2tp.xl2tpd_conf.is_empty() || l2tp.options_l2tpd_client.is_empty(),
        _ => false,
    }
}
