//! IKEv2 / IKEv1 tunnels driven through strongSwan
//!
//! Stage sequence for a tunnel that starts the shared daemon:
//!
//! ```text
//! Init --ipsec-started--> Started --swanctl-loaded--> Configured --connect--> Connected
//! ```
//!
//! A tunnel joining an already running daemon skips straight to `Started`.
//! `updateconfig` messages are accepted while `Configured` and rebind the
//! interface with the pushed address.

use async_trait::async_trait;
use std::fmt;
use tracing::{debug, error, info, warn};

use super::allocator::{MultiVpnInfo, SharedDaemon, SharedDaemonGuard};
use super::common::{delete_config_file, write_base64_config};
use super::daemon::{StageCommand, IPSEC_CONNECTION};
use super::driver::{is_recoverable, DriverContext, TunnelBase, TunnelDriver};
use super::stage::{StageKind, StageMessage, TunnelUpdate};
use super::telemetry::{VpnEventErrorType, VpnEventOperation, VpnEventType};
use super::types::{netmask_to_prefix_len, INetAddr, IpsecVpnConfig, SysVpnConfig, VpnConnectState};
use crate::error::{VpnError, VpnResult, SUCCESS};

pub const SWANCTL_FILE: &str = "swanctl.conf";
pub const STRONGSWAN_FILE: &str = "strongswan.conf";

/// Certificate and config selectors for `cert_uri`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpsecCertType {
    CaCert,
    UserCert,
    ServerCert,
    SwanctlConf,
    OptionsL2tpdClientConf,
    L2tpIpsecSecretsConf,
}

impl IpsecCertType {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::CaCert),
            1 => Some(Self::UserCert),
            2 => Some(Self::ServerCert),
            3 => Some(Self::SwanctlConf),
            4 => Some(Self::OptionsL2tpdClientConf),
            5 => Some(Self::L2tpIpsecSecretsConf),
            _ => None,
        }
    }
}

/// Certificate path or config blob of an IPsec based profile
pub(crate) fn ipsec_cert_uri(config: &SysVpnConfig, cert_type: i32) -> VpnResult<String> {
    let kind = IpsecCertType::from_code(cert_type)
        .ok_or_else(|| VpnError::InvalidConfig(format!("unknown cert type {}", cert_type)))?;
    let ipsec = config
        .ipsec()
        .ok_or_else(|| VpnError::InvalidConfig(format!("{} is not an IPsec profile", config.vpn_id)))?;
    let l2tp = config.l2tp();
    let uri = match kind {
        IpsecCertType::CaCert => ipsec.ipsec_ca_cert_file_path.clone(),
        IpsecCertType::UserCert => ipsec.ipsec_public_user_cert_file_path.clone(),
        IpsecCertType::ServerCert => ipsec.ipsec_public_server_cert_file_path.clone(),
        IpsecCertType::SwanctlConf => ipsec.swanctl_conf.clone(),
        IpsecCertType::OptionsL2tpdClientConf => l2tp.map(|l| l.options_l2tpd_client.clone()).unwrap_or_default(),
        IpsecCertType::L2tpIpsecSecretsConf => l2tp.map(|l| l.ipsec_secrets.clone()).unwrap_or_default(),
    };
    Ok(uri)
}

/// Merge a daemon pushed update into the live network config and rebind.
/// Collisions are rejected before the binder is touched.
pub(crate) async fn apply_tunnel_update(base: &mut TunnelBase, update: &TunnelUpdate) -> VpnResult<()> {
    let mut network = base.network.clone();
    if let Some(mtu) = update.mtu {
        network.mtu = mtu;
    }
    if !update.address.is_empty() {
        let candidate = INetAddr::new(update.address.clone(), 0);
        let prefix_len = if !update.netmask.is_empty() {
            netmask_to_prefix_len(&update.netmask)?
        } else if candidate.is_ipv6() {
            128
        } else {
            32
        };
        network.addresses = vec![INetAddr::new(update.address.clone(), prefix_len)];
    }
    let dns = update.dns();
    if !dns.is_empty() {
        network.dns_addresses = dns;
    }
    if !update.remote_ip.is_empty() || !update.phy_ifname.is_empty() {
        debug!(
            "Tunnel {} peer {} via {}",
            base.info.if_name, update.remote_ip, update.phy_ifname
        );
    }

    base.claim_address(network.local_address())?;
    base.network = network;

    if base.binder.is_bound() {
        base.binder.destroy().await;
    }
    base.binder.set_up(&base.network).await?;
    info!("Applied config update on {}", base.info.if_name);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpsecState {
    Init,
    Started,
    Configured,
    Controlled,
    Connected,
    Disconnected,
    L2tpStarted,
}

impl fmt::Display for IpsecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct IpsecVpnCtl {
    base: TunnelBase,
    config: SysVpnConfig,
    state: IpsecState,
    daemon_guard: Option<SharedDaemonGuard>,
}

impl IpsecVpnCtl {
    pub fn new(config: SysVpnConfig, info: MultiVpnInfo, ctx: DriverContext) -> Self {
        let network = config.network.clone();
        Self {
            base: TunnelBase::new(info, network, VpnEventType::Legacy, ctx),
            config,
            state: IpsecState::Init,
            daemon_guard: None,
        }
    }

    pub fn state(&self) -> IpsecState {
        self.state
    }

    pub fn base(&self) -> &TunnelBase {
        &self.base
    }

    fn ipsec_config(&self) -> VpnResult<IpsecVpnConfig> {
        self.config
            .ipsec()
            .cloned()
            .ok_or_else(|| VpnError::InvalidConfig(format!("{} has no IPsec payload", self.config.vpn_id)))
    }

    async fn write_config_files(&self, ipsec: &IpsecVpnConfig) -> VpnResult<()> {
        let swanctl = self.base.config_path(SWANCTL_FILE);
        let strongswan = self.base.config_path(STRONGSWAN_FILE);
        delete_config_file(&swanctl).await?;
        delete_config_file(&strongswan).await?;
        write_base64_config(&swanctl, &ipsec.swanctl_conf).await?;
        write_base64_config(&strongswan, &ipsec.strongswan_conf).await?;
        Ok(())
    }

    async fn start(&mut self) -> VpnResult<()> {
        let ipsec = self.ipsec_config()?;
        self.write_config_files(&ipsec).await?;

        let guard = self.base.ctx.allocator.acquire_shared_daemon(SharedDaemon::Ipsec);
        let already_running = guard.already_running();
        self.daemon_guard = Some(guard);

        if already_running {
            info!("IPsec daemon already running, loading config for {}", self.base.info.if_name);
            self.state = IpsecState::Started;
            self.base
                .send(StageCommand::SwanctlLoad { config: self.base.config_path(SWANCTL_FILE) })
                .await
        } else {
            self.base.send(StageCommand::Restart).await
        }
    }

    async fn advance(&mut self, stage: &StageMessage) -> VpnResult<()> {
        match (self.state, &stage.kind) {
            (IpsecState::Init, StageKind::IpsecStarted) => {
                info!("IPsec setup step 1 on {}: daemon started", self.base.info.if_name);
                self.state = IpsecState::Started;
                self.base
                    .send(StageCommand::SwanctlLoad { config: self.base.config_path(SWANCTL_FILE) })
                    .await
            }
            (IpsecState::Started, StageKind::SwanctlLoaded) => {
                info!("IPsec setup step 2 on {}: bringing connection up", self.base.info.if_name);
                self.state = IpsecState::Configured;
                self.base
                    .send(StageCommand::UpHome { connection: IPSEC_CONNECTION.to_string() })
                    .await
            }
            (IpsecState::Configured, StageKind::UpdateConfig(update)) => {
                apply_tunnel_update(&mut self.base, update).await
            }
            (IpsecState::Configured, StageKind::IpsecConnected) => {
                info!("IPsec setup step 3 on {}: connected", self.base.info.if_name);
                self.base.bind().await?;
                self.state = IpsecState::Connected;
                self.base.notify_connect_state(VpnConnectState::Connected);
                Ok(())
            }
            (state, _) => Err(VpnError::StageProtocolViolation(format!(
                "stage {} not valid in state {}",
                stage, state
            ))),
        }
    }

    async fn abort(&mut self, operation: VpnEventOperation, err: VpnError) -> VpnError {
        error!("IPsec tunnel {} failed: {}", self.base.info.if_name, err);
        if !matches!(err, VpnError::NetworkBindFailed { .. }) {
            self.base.fault(operation, VpnEventErrorType::DaemonStage, err.to_string());
        }
        if let Err(e) = self.destroy().await {
            warn!("Teardown of {} after failure: {}", self.base.info.if_name, e);
        }
        err
    }
}

#[async_trait]
impl TunnelDriver for IpsecVpnCtl {
    fn tunnel(&self) -> &MultiVpnInfo {
        &self.base.info
    }

    fn is_system(&self) -> bool {
        true
    }

    async fn set_up(&mut self) -> VpnResult<()> {
        info!("Starting IPsec tunnel {} on {}", self.base.info.vpn_id, self.base.info.if_name);
        self.state = IpsecState::Init;
        self.base.begin_connecting();
        match self.start().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abort(VpnEventOperation::StartSa, e).await),
        }
    }

    async fn destroy(&mut self) -> VpnResult<()> {
        if self.daemon_guard.is_some() {
            if let Err(e) = self
                .base
                .send(StageCommand::DownHome { connection: IPSEC_CONNECTION.to_string() })
                .await
            {
                warn!("Failed to take down {}: {}", IPSEC_CONNECTION, e);
            }
        }
        self.base.binder.destroy().await;

        if let Some(guard) = self.daemon_guard.take() {
            if guard.release() {
                if let Err(e) = self.base.send(StageCommand::Stop).await {
                    warn!("Failed to stop IPsec daemon: {}", e);
                }
            } else {
                debug!("IPsec daemon still serves other tunnels");
            }
        }

        self.state = IpsecState::Disconnected;
        self.base.notify_connect_state(VpnConnectState::Disconnected);
        Ok(())
    }

    async fn notify_connect_stage(&mut self, stage: &StageMessage, result: i32) -> VpnResult<()> {
        if result != SUCCESS {
            let err = VpnError::DaemonStartFailed(format!("stage {} failed with result {}", stage, result));
            return Err(self.abort(VpnEventOperation::StartSa, err).await);
        }
        debug!("IPsec stage {} in state {}", stage, self.state);
        match self.advance(stage).await {
            Ok(()) => Ok(()),
            Err(e) if is_recoverable(&e) => {
                warn!("Rejected stage on {}: {}", self.base.info.if_name, e);
                Err(e)
            }
            Err(e) => Err(self.abort(VpnEventOperation::ConnectSetting, e).await),
        }
    }

    fn connect_state(&self) -> VpnConnectState {
        self.base.connect_state()
    }

    fn state_name(&self) -> String {
        self.state.to_string()
    }

    fn connected_config(&self) -> Option<&SysVpnConfig> {
        (self.state == IpsecState::Connected).then_some(&self.config)
    }

    fn cert_uri(&self, cert_type: i32) -> VpnResult<String> {
        ipsec_cert_uri(&self.config, cert_type)
    }

    async fn resume_uids(&mut self) -> VpnResult<()> {
        self.base.binder.resume_uids().await
    }
}
