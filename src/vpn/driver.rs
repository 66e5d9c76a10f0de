//! Tunnel driver interface
//!
//! Every VPN family is driven through [`TunnelDriver`]. The orchestrator only
//! sees boxed drivers; [`create_driver`] picks the concrete state machine from
//! the profile payload.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use super::allocator::{MultiVpnInfo, TunnelAllocator};
use super::binder::NetworkBinder;
use super::daemon::{DaemonBridge, StageCommand};
use super::ipsec::IpsecVpnCtl;
use super::l2tp::L2tpVpnCtl;
use super::netstack::{AppUidResolver, NetworkStack};
use super::openvpn::OpenvpnCtl;
use super::stage::StageMessage;
use super::telemetry::{FaultEvent, FaultReporter, VpnEventErrorType, VpnEventOperation, VpnEventType};
use super::types::{SysVpnConfig, VpnConfig, VpnConnectState, VpnPayload};
use super::virtual_vpn::VirtualVpnCtl;
use crate::error::{VpnError, VpnResult};

/// Receives connect state changes of every tunnel
pub trait StateObserver: Send + Sync {
    fn on_connect_state(&self, tunnel: &MultiVpnInfo, state: VpnConnectState);
}

/// Collaborators shared by every driver
#[derive(Clone)]
pub struct DriverContext {
    pub allocator: Arc<TunnelAllocator>,
    pub stack: Arc<dyn NetworkStack>,
    pub daemon: Arc<dyn DaemonBridge>,
    pub faults: Arc<dyn FaultReporter>,
    pub apps: Arc<dyn AppUidResolver>,
    pub observer: Arc<dyn StateObserver>,
    /// Directory daemon config files are written to
    pub vpn_dir: PathBuf,
}

#[async_trait]
pub trait TunnelDriver: Send + Sync {
    /// Runtime record as registered with the allocator
    fn tunnel(&self) -> &MultiVpnInfo;

    fn vpn_id(&self) -> &str {
        &self.tunnel().vpn_id
    }

    /// True for profiles driven by a native daemon
    fn is_system(&self) -> bool;

    /// Start bringing the tunnel up
    async fn set_up(&mut self) -> VpnResult<()>;

    /// Tear everything down. Safe in any state and idempotent.
    async fn destroy(&mut self) -> VpnResult<()>;

    /// Feed one daemon stage notification
    async fn notify_connect_stage(&mut self, stage: &StageMessage, result: i32) -> VpnResult<()>;

    fn connect_state(&self) -> VpnConnectState;

    /// Human readable state machine position
    fn state_name(&self) -> String;

    /// The profile in use, only while connected
    fn connected_config(&self) -> Option<&SysVpnConfig> {
        None
    }

    fn cert_uri(&self, cert_type: i32) -> VpnResult<String> {
        Err(VpnError::InvalidConfig(format!(
            "{} has no certificate of type {}",
            self.tunnel().if_name,
            cert_type
        )))
    }

    /// Reinstall uid rules after the network stack restarted
    async fn resume_uids(&mut self) -> VpnResult<()>;
}

/// Errors that leave the tunnel in its current state instead of tearing it down
pub fn is_recoverable(err: &VpnError) -> bool {
    matches!(
        err,
        VpnError::StageProtocolViolation(_) | VpnError::AddressCollision(_) | VpnError::Parse(_)
    )
}

/// State and helpers every driver shares
pub struct TunnelBase {
    pub info: MultiVpnInfo,
    pub network: VpnConfig,
    pub binder: NetworkBinder,
    pub ctx: DriverContext,
    event_type: VpnEventType,
    connect_state: VpnConnectState,
    last_notified: Option<VpnConnectState>,
}

impl TunnelBase {
    pub fn new(info: MultiVpnInfo, network: VpnConfig, event_type: VpnEventType, ctx: DriverContext) -> Self {
        let binder = NetworkBinder::new(
            info.if_name.clone(),
            info.user_id,
            event_type,
            Arc::clone(&ctx.stack),
            Arc::clone(&ctx.apps),
            Arc::clone(&ctx.faults),
        );
        Self {
            info,
            network,
            binder,
            ctx,
            event_type,
            connect_state: VpnConnectState::Disconnected,
            last_notified: None,
        }
    }

    pub fn if_name_id(&self) -> u32 {
        self.info.if_name_id
    }

    pub fn connect_state(&self) -> VpnConnectState {
        self.connect_state
    }

    pub fn is_connected(&self) -> bool {
        self.connect_state == VpnConnectState::Connected
    }

    pub fn event_type(&self) -> VpnEventType {
        self.event_type
    }

    pub fn begin_connecting(&self) {
        self.ctx.allocator.set_connecting(self.info.if_name_id, true);
    }

    /// Record and publish a connect state. Repeats of the last published
    /// state are not sent again.
    pub fn notify_connect_state(&mut self, state: VpnConnectState) {
        self.connect_state = state;
        self.ctx.allocator.set_connect_state(self.info.if_name_id, state);
        if state == VpnConnectState::Disconnected {
            self.ctx.allocator.set_connecting(self.info.if_name_id, false);
        }
        if self.last_notified == Some(state) {
            return;
        }
        self.last_notified = Some(state);
        self.info.connect_state = state;
        info!("Tunnel {} on {} is {:?}", self.info.vpn_id, self.info.if_name, state);
        self.ctx.observer.on_connect_state(&self.info, state);
    }

    pub fn fault(&self, operation: VpnEventOperation, error_type: VpnEventErrorType, message: impl Into<String>) {
        self.ctx.faults.report(FaultEvent::new(self.event_type, operation, error_type, message));
    }

    pub async fn send(&self, command: StageCommand) -> VpnResult<()> {
        debug!("{} -> {}", self.info.if_name, command);
        self.ctx.daemon.send(command).await
    }

    /// Claim `address` for this tunnel, failing on collision
    pub fn claim_address(&self, address: &str) -> VpnResult<()> {
        self.ctx.allocator.claim_local_address(self.info.if_name_id, address).map_err(|e| {
            if let VpnError::AddressCollision(addr) = &e {
                self.fault(
                    VpnEventOperation::ConnectSetting,
                    VpnEventErrorType::AddressCollision,
                    format!("local address {} already in use", addr),
                );
            }
            e
        })
    }

    /// Bind with the current network config unless already bound
    pub async fn bind(&mut self) -> VpnResult<()> {
        if self.binder.is_bound() {
            return Ok(());
        }
        self.binder.set_up(&self.network).await
    }

    pub fn config_path(&self, file: &str) -> PathBuf {
        self.ctx.vpn_dir.join(file)
    }
}

/// Build the state machine for a system profile
pub fn create_driver(
    config: SysVpnConfig,
    info: MultiVpnInfo,
    ctx: DriverContext,
) -> VpnResult<Box<dyn TunnelDriver>> {
    config.validate()?;
    let driver: Box<dyn TunnelDriver> = match &config.payload {
        VpnPayload::Ipsec(_) => Box::new(IpsecVpnCtl::new(config, info, ctx)),
        VpnPayload::L2tp(_) => Box::new(L2tpVpnCtl::new(config, info, ctx)),
        VpnPayload::Openvpn(_) => Box::new(OpenvpnCtl::new(config, info, ctx)),
        VpnPayload::Virtual => Box::new(VirtualVpnCtl::new(config.network.clone(), info, ctx)),
    };
    Ok(driver)
}
