//! L2TP tunnels, with or without IPsec transport protection
//!
//! L2TP over IPsec interleaves both daemons:
//!
//! ```text
//! Init --ipsec-started--> Started --swanctl-loaded--> Configured
//!   --l2tp-started|l2tp-configured--> L2tpStarted --connect--> Controlled
//!   --l2tp-connected--> Connected
//! ```
//!
//! When xl2tpd is already running for another tunnel the `Configured` leg is
//! skipped. Plain L2TP only runs the xl2tpd half:
//! `Init --l2tp-started--> Controlled --l2tp-connected--> Connected`.

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::allocator::{MultiVpnInfo, SharedDaemon, SharedDaemonGuard};
use super::common::{delete_config_file, write_base64_config};
use super::daemon::{StageCommand, IPSEC_CONNECTION, L2TP_CONNECTION};
use super::driver::{is_recoverable, DriverContext, TunnelBase, TunnelDriver};
use super::ipsec::{apply_tunnel_update, ipsec_cert_uri, IpsecState, STRONGSWAN_FILE};
use super::stage::{StageKind, StageMessage};
use super::telemetry::{VpnEventErrorType, VpnEventOperation, VpnEventType};
use super::types::{L2tpVpnConfig, SysVpnConfig, VpnConnectState, VpnType};
use crate::error::{VpnError, VpnResult, SUCCESS};

pub const XL2TPD_FILE: &str = "xl2tpd.conf";
pub const OPTIONS_L2TPD_CLIENT_FILE: &str = "options.l2tpd.client.conf";
pub const IPSEC_CONF_FILE: &str = "ipsec.conf";
pub const IPSEC_SECRETS_FILE: &str = "ipsec.secrets.conf";

pub struct L2tpVpnCtl {
    base: TunnelBase,
    config: SysVpnConfig,
    state: IpsecState,
    ipsec_guard: Option<SharedDaemonGuard>,
    l2tp_guard: Option<SharedDaemonGuard>,
}

impl L2tpVpnCtl {
    pub fn new(config: SysVpnConfig, info: MultiVpnInfo, ctx: DriverContext) -> Self {
        let network = config.network.clone();
        Self {
            base: TunnelBase::new(info, network, VpnEventType::Legacy, ctx),
            config,
            state: IpsecState::Init,
            ipsec_guard: None,
            l2tp_guard: None,
        }
    }

    /// Plain L2TP without IPsec
    pub fn is_pure_l2tp(&self) -> bool {
        self.config.vpn_type == VpnType::L2tp
    }

    pub fn state(&self) -> IpsecState {
        self.state
    }

    pub fn base(&self) -> &TunnelBase {
        &self.base
    }

    fn l2tp_config(&self) -> VpnResult<L2tpVpnConfig> {
        self.config
            .l2tp()
            .cloned()
            .ok_or_else(|| VpnError::InvalidConfig(format!("{} has no L2TP payload", self.config.vpn_id)))
    }

    async fn write_config_files(&self, l2tp: &L2tpVpnConfig) -> VpnResult<()> {
        let mut files = vec![
            (XL2TPD_FILE, &l2tp.xl2tpd_conf),
            (OPTIONS_L2TPD_CLIENT_FILE, &l2tp.options_l2tpd_client),
        ];
        if !self.is_pure_l2tp() {
            files.push((STRONGSWAN_FILE, &l2tp.ipsec.strongswan_conf));
            files.push((IPSEC_CONF_FILE, &l2tp.ipsec_conf));
            files.push((IPSEC_SECRETS_FILE, &l2tp.ipsec_secrets));
        }
        for (name, content) in files {
            let path = self.base.config_path(name);
            delete_config_file(&path).await?;
            write_base64_config(&path, content).await?;
        }
        Ok(())
    }

    async fn send_l2tp_load(&self) -> VpnResult<()> {
        self.base
            .send(StageCommand::L2tpLoad { config: self.base.config_path(XL2TPD_FILE) })
            .await
    }

    async fn send_l2tp_ctl(&self) -> VpnResult<()> {
        self.base
            .send(StageCommand::L2tpCtl { connection: L2TP_CONNECTION.to_string() })
            .await
    }

    async fn send_up_home(&self) -> VpnResult<()> {
        self.base
            .send(StageCommand::UpHome { connection: IPSEC_CONNECTION.to_string() })
            .await
    }

    async fn send_ipsec_load(&self) -> VpnResult<()> {
        self.base
            .send(StageCommand::SwanctlLoad { config: self.base.config_path(IPSEC_CONF_FILE) })
            .await
    }

    async fn start(&mut self) -> VpnResult<()> {
        let l2tp = self.l2tp_config()?;
        self.write_config_files(&l2tp).await?;

        if self.is_pure_l2tp() {
            let guard = self.base.ctx.allocator.acquire_shared_daemon(SharedDaemon::L2tp);
            let already_running = guard.already_running();
            self.l2tp_guard = Some(guard);
            if already_running {
                self.state = IpsecState::Controlled;
                return self.send_l2tp_ctl().await;
            }
            return self.send_l2tp_load().await;
        }

        let guard = self.base.ctx.allocator.acquire_shared_daemon(SharedDaemon::Ipsec);
        let already_running = guard.already_running();
        self.ipsec_guard = Some(guard);
        if already_running {
            self.state = IpsecState::Started;
            self.send_ipsec_load().await
        } else {
            self.base.send(StageCommand::Restart).await
        }
    }

    /// IPsec config is loaded; bring up xl2tpd unless another tunnel already did
    async fn start_l2tp_daemon(&mut self) -> VpnResult<()> {
        let guard = self.base.ctx.allocator.acquire_shared_daemon(SharedDaemon::L2tp);
        let already_running = guard.already_running();
        self.l2tp_guard = Some(guard);
        if already_running {
            self.state = IpsecState::L2tpStarted;
            self.send_up_home().await
        } else {
            self.state = IpsecState::Configured;
            self.send_l2tp_load().await
        }
    }

    async fn connected(&mut self) -> VpnResult<()> {
        info!("L2TP tunnel {} connected", self.base.info.if_name);
        self.base.bind().await?;
        self.state = IpsecState::Connected;
        self.base.notify_connect_state(VpnConnectState::Connected);
        Ok(())
    }

    async fn advance_pure(&mut self, stage: &StageMessage) -> VpnResult<()> {
        match (self.state, &stage.kind) {
            (IpsecState::Init, StageKind::L2tpStarted | StageKind::L2tpConfigured) => {
                self.state = IpsecState::Controlled;
                self.send_l2tp_ctl().await
            }
            (IpsecState::Controlled, StageKind::UpdateConfig(update)) => {
                apply_tunnel_update(&mut self.base, update).await
            }
            (IpsecState::Controlled, StageKind::L2tpConnected) => self.connected().await,
            (state, _) => Err(VpnError::StageProtocolViolation(format!(
                "stage {} not valid in state {}",
                stage, state
            ))),
        }
    }

    async fn advance(&mut self, stage: &StageMessage) -> VpnResult<()> {
        if self.is_pure_l2tp() {
            return self.advance_pure(stage).await;
        }
        match (self.state, &stage.kind) {
            (IpsecState::Init, StageKind::IpsecStarted) => {
                debug!("L2TP setup step 1 on {}: IPsec daemon started", self.base.info.if_name);
                self.state = IpsecState::Started;
                self.send_ipsec_load().await
            }
            (IpsecState::Started, StageKind::SwanctlLoaded) => {
                debug!("L2TP setup step 2 on {}: starting xl2tpd", self.base.info.if_name);
                self.start_l2tp_daemon().await
            }
            (IpsecState::Configured, StageKind::L2tpStarted | StageKind::L2tpConfigured) => {
                debug!("L2TP setup step 3 on {}: bringing IPsec up", self.base.info.if_name);
                self.state = IpsecState::L2tpStarted;
                self.send_up_home().await
            }
            (IpsecState::L2tpStarted, StageKind::IpsecConnected) => {
                debug!("L2TP setup step 4 on {}: dialing", self.base.info.if_name);
                self.state = IpsecState::Controlled;
                self.send_l2tp_ctl().await
            }
            (IpsecState::L2tpStarted | IpsecState::Controlled, StageKind::UpdateConfig(update)) => {
                apply_tunnel_update(&mut self.base, update).await
            }
            (IpsecState::Controlled, StageKind::L2tpConnected) => self.connected().await,
            (state, _) => Err(VpnError::StageProtocolViolation(format!(
                "stage {} not valid in state {}",
                stage, state
            ))),
        }
    }

    async fn abort(&mut self, operation: VpnEventOperation, err: VpnError) -> VpnError {
        error!("L2TP tunnel {} failed: {}", self.base.info.if_name, err);
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
impl TunnelDriver for L2tpVpnCtl {
    fn tunnel(&self) -> &MultiVpnInfo {
        &self.base.info
    }

    fn is_system(&self) -> bool {
        true
    }

    async fn set_up(&mut self) -> VpnResult<()> {
        info!(
            "Starting {} tunnel {} on {}",
            self.config.vpn_type, self.base.info.vpn_id, self.base.info.if_name
        );
        self.state = IpsecState::Init;
        self.base.begin_connecting();
        match self.start().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abort(VpnEventOperation::StartSa, e).await),
        }
    }

    async fn destroy(&mut self) -> VpnResult<()> {
        if self.ipsec_guard.is_some() {
            if let Err(e) = self
                .base
                .send(StageCommand::DownHome { connection: IPSEC_CONNECTION.to_string() })
                .await
            {
                warn!("Failed to take down {}: {}", IPSEC_CONNECTION, e);
            }
        }
        self.base.binder.destroy().await;

        if let Some(guard) = self.l2tp_guard.take() {
            if guard.release() {
                if let Err(e) = self.base.send(StageCommand::L2tpStop).await {
                    warn!("Failed to stop xl2tpd: {}", e);
                }
            }
        }
        if let Some(guard) = self.ipsec_guard.take() {
            if guard.release() {
                if let Err(e) = self.base.send(StageCommand::Stop).await {
                    warn!("Failed to stop IPsec daemon: {}", e);
                }
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
        debug!("L2TP stage {} in state {}", stage, self.state);
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
