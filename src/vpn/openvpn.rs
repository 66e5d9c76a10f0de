//! OpenVPN tunnels
//!
//! The client reports progress as `openvpn{...}` JSON messages carrying any
//! of `config`, `updateState` and `setupVpnTun`.

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::allocator::{MultiVpnInfo, TUN_CARD_NAME};
use super::common::{decode_base64, write_secure_config};
use super::daemon::StageCommand;
use super::driver::{is_recoverable, DriverContext, TunnelBase, TunnelDriver};
use super::stage::{OpenvpnMessage, OpenvpnTunConfig, StageKind, StageMessage};
use super::telemetry::{VpnEventErrorType, VpnEventOperation, VpnEventType};
use super::types::{netmask_to_prefix_len, INetAddr, OpenvpnConfig, Route, SysVpnConfig, VpnConnectState};
use crate::error::{VpnError, VpnResult, SUCCESS};

pub const OPENVPN_CONFIG_FILE: &str = "config.ovpn";
pub const OPENVPN_ASKPASS_FILE: &str = "askpass";

/// Client states as numbered by the OpenVPN daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenvpnState {
    Unknown,
    Setup,
    Started,
    Connected,
    Disconnected,
    ErrorPrivateKey,
    ErrorClientCrt,
    ErrorCaCert,
    ErrorTimeOut,
}

impl OpenvpnState {
    pub fn code(self) -> i32 {
        match self {
            OpenvpnState::Unknown => 1,
            OpenvpnState::Setup => 2,
            OpenvpnState::Started => 3,
            OpenvpnState::Connected => 4,
            OpenvpnState::Disconnected => 5,
            OpenvpnState::ErrorPrivateKey => 200,
            OpenvpnState::ErrorClientCrt => 201,
            OpenvpnState::ErrorCaCert => 202,
            OpenvpnState::ErrorTimeOut => 203,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        [
            OpenvpnState::Unknown,
            OpenvpnState::Setup,
            OpenvpnState::Started,
            OpenvpnState::Connected,
            OpenvpnState::Disconnected,
            OpenvpnState::ErrorPrivateKey,
            OpenvpnState::ErrorClientCrt,
            OpenvpnState::ErrorCaCert,
            OpenvpnState::ErrorTimeOut,
        ]
        .into_iter()
        .find(|s| s.code() == code)
    }

    pub fn is_error(self) -> bool {
        self.code() >= OpenvpnState::ErrorPrivateKey.code()
    }
}

/// Selectors for `cert_uri`
const OPENVPN_ASKPASS: i32 = 0;
const OPENVPN_CONF: i32 = 1;

pub struct OpenvpnCtl {
    base: TunnelBase,
    config: SysVpnConfig,
    state: OpenvpnState,
    daemon_started: bool,
}

impl OpenvpnCtl {
    pub fn new(config: SysVpnConfig, info: MultiVpnInfo, ctx: DriverContext) -> Self {
        let network = config.network.clone();
        Self {
            base: TunnelBase::new(info, network, VpnEventType::Legacy, ctx),
            config,
            state: OpenvpnState::Unknown,
            daemon_started: false,
        }
    }

    pub fn state(&self) -> OpenvpnState {
        self.state
    }

    pub fn base(&self) -> &TunnelBase {
        &self.base
    }

    fn openvpn_config(&self) -> VpnResult<OpenvpnConfig> {
        self.config
            .openvpn()
            .cloned()
            .ok_or_else(|| VpnError::InvalidConfig(format!("{} has no OpenVPN payload", self.config.vpn_id)))
    }

    async fn start(&mut self) -> VpnResult<()> {
        let openvpn = self.openvpn_config()?;
        self.state = OpenvpnState::Started;

        let mut content = decode_base64(&openvpn.ovpn_config)?;
        if !openvpn.askpass.is_empty() {
            let askpass = self.base.config_path(OPENVPN_ASKPASS_FILE);
            write_secure_config(&askpass, format!("{}\n", openvpn.askpass).as_bytes(), 0o600).await?;
            if !content.is_empty() && !content.ends_with(b"\n") {
                content.push(b'\n');
            }
            content.extend_from_slice(format!("askpass {}\n", askpass.display()).as_bytes());
        }
        let path = self.base.config_path(OPENVPN_CONFIG_FILE);
        write_secure_config(&path, &content, 0o600).await?;

        self.daemon_started = true;
        self.base.send(StageCommand::OpenvpnRestart { config: path }).await
    }

    /// Merge the interface parameters pushed by the client
    fn update_config(&mut self, tun: &OpenvpnTunConfig) -> VpnResult<()> {
        let mut network = self.base.network.clone();
        if let Some(mtu) = tun.mtu {
            network.mtu = mtu;
            debug!("OpenVPN mtu {}", mtu);
        }
        if !tun.address.is_empty() {
            let prefix_len = if tun.netmask.is_empty() { 32 } else { netmask_to_prefix_len(&tun.netmask)? };
            network.addresses = vec![INetAddr::new(tun.address.clone(), prefix_len)];
            network.routes = vec![Route {
                iface: TUN_CARD_NAME.to_string(),
                destination: INetAddr::new(tun.address.clone(), prefix_len),
                gateway: Some(tun.address.clone()),
                is_default: true,
            }];
        }
        self.base.claim_address(network.local_address())?;
        self.base.network = network;
        Ok(())
    }

    async fn update_state(&mut self, code: i32) -> VpnResult<()> {
        let Some(state) = OpenvpnState::from_code(code) else {
            warn!("Unknown OpenVPN state {}", code);
            return Ok(());
        };
        info!("OpenVPN state {:?} on {}", state, self.base.info.if_name);
        match state {
            OpenvpnState::Connected => {
                self.state = state;
                self.base.notify_connect_state(VpnConnectState::Connected);
            }
            OpenvpnState::Disconnected => {
                self.destroy().await?;
            }
            s if s.is_error() => {
                self.base.fault(
                    VpnEventOperation::StartSa,
                    VpnEventErrorType::DaemonStage,
                    format!("openvpn reported {:?}", s),
                );
                self.destroy().await?;
                self.state = s;
            }
            _ => self.state = state,
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: &OpenvpnMessage) -> VpnResult<()> {
        if let Some(tun) = &message.config {
            self.update_config(tun)?;
        }
        if let Some(code) = message.update_state {
            self.update_state(code).await?;
        }
        if message.setup_vpn_tun {
            info!("Setting up {}", self.base.info.if_name);
            self.base.bind().await?;
        }
        Ok(())
    }

    async fn abort(&mut self, operation: VpnEventOperation, err: VpnError) -> VpnError {
        error!("OpenVPN tunnel {} failed: {}", self.base.info.if_name, err);
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
impl TunnelDriver for OpenvpnCtl {
    fn tunnel(&self) -> &MultiVpnInfo {
        &self.base.info
    }

    fn is_system(&self) -> bool {
        true
    }

    async fn set_up(&mut self) -> VpnResult<()> {
        info!("Starting OpenVPN tunnel {}", self.base.info.vpn_id);
        self.state = OpenvpnState::Setup;
        self.base.begin_connecting();
        match self.start().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abort(VpnEventOperation::StartSa, e).await),
        }
    }

    async fn destroy(&mut self) -> VpnResult<()> {
        if std::mem::take(&mut self.daemon_started) {
            if let Err(e) = self.base.send(StageCommand::OpenvpnStop).await {
                warn!("Failed to stop openvpn: {}", e);
            }
        }
        self.base.binder.destroy().await;
        self.state = OpenvpnState::Disconnected;
        self.base.notify_connect_state(VpnConnectState::Disconnected);
        Ok(())
    }

    async fn notify_connect_stage(&mut self, stage: &StageMessage, result: i32) -> VpnResult<()> {
        if result != SUCCESS {
            let err = VpnError::DaemonStartFailed(format!("openvpn stage failed with result {}", result));
            return Err(self.abort(VpnEventOperation::StartSa, err).await);
        }
        info!("OpenVPN message: {}", stage);
        let outcome = match &stage.kind {
            StageKind::Openvpn(message) => self.handle_message(message).await,
            _ => Err(VpnError::StageProtocolViolation(format!(
                "stage {} is not an OpenVPN message",
                stage
            ))),
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(e) if is_recoverable(&e) => {
                warn!("Rejected OpenVPN message on {}: {}", self.base.info.if_name, e);
                Err(e)
            }
            Err(e) => Err(self.abort(VpnEventOperation::ConnectSetting, e).await),
        }
    }

    fn connect_state(&self) -> VpnConnectState {
        self.base.connect_state()
    }

    fn state_name(&self) -> String {
        format!("{:?}", self.state)
    }

    fn connected_config(&self) -> Option<&SysVpnConfig> {
        (self.state == OpenvpnState::Connected).then_some(&self.config)
    }

    fn cert_uri(&self, cert_type: i32) -> VpnResult<String> {
        let openvpn = self.openvpn_config()?;
        match cert_type {
            OPENVPN_ASKPASS => Ok(openvpn.askpass),
            OPENVPN_CONF => Ok(openvpn.ovpn_config),
            other => Err(VpnError::InvalidConfig(format!("unknown cert type {}", other))),
        }
    }

    async fn resume_uids(&mut self) -> VpnResult<()> {
        self.base.binder.resume_uids().await
    }
}
