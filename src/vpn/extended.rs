//! App supplied tunnels
//!
//! The app owns the tun device and its own protocol. This driver only claims
//! the tunnel address and attaches the interface to the network stack.

use async_trait::async_trait;
use tracing::{error, info};

use super::allocator::MultiVpnInfo;
use super::driver::{DriverContext, TunnelBase, TunnelDriver};
use super::stage::StageMessage;
use super::telemetry::VpnEventType;
use super::types::{VpnConfig, VpnConnectState};
use crate::error::{VpnError, VpnResult};

pub struct ExtendedVpnCtl {
    base: TunnelBase,
}

impl ExtendedVpnCtl {
    pub fn new(network: VpnConfig, info: MultiVpnInfo, ctx: DriverContext) -> Self {
        Self { base: TunnelBase::new(info, network, VpnEventType::Extended, ctx) }
    }

    pub fn base(&self) -> &TunnelBase {
        &self.base
    }
}

#[async_trait]
impl TunnelDriver for ExtendedVpnCtl {
    fn tunnel(&self) -> &MultiVpnInfo {
        &self.base.info
    }

    fn is_system(&self) -> bool {
        false
    }

    async fn set_up(&mut self) -> VpnResult<()> {
        info!(
            "Setting up app tunnel {} for {} on {}",
            self.base.info.vpn_id, self.base.info.bundle_name, self.base.info.if_name
        );
        self.base.begin_connecting();
        let local = self.base.network.local_address().to_string();
        if let Err(e) = self.base.claim_address(&local) {
            self.base.ctx.allocator.set_connecting(self.base.if_name_id(), false);
            return Err(e);
        }

        if let Err(e) = self.base.bind().await {
            error!("App tunnel {} failed: {}", self.base.info.if_name, e);
            self.destroy().await?;
            return Err(e);
        }
        self.base.notify_connect_state(VpnConnectState::Connected);
        Ok(())
    }

    async fn destroy(&mut self) -> VpnResult<()> {
        self.base.binder.destroy().await;
        self.base.notify_connect_state(VpnConnectState::Disconnected);
        Ok(())
    }

    async fn notify_connect_stage(&mut self, stage: &StageMessage, _result: i32) -> VpnResult<()> {
        Err(VpnError::StageProtocolViolation(format!(
            "app tunnel {} has no daemon stages, got {}",
            self.base.info.if_name, stage
        )))
    }

    fn connect_state(&self) -> VpnConnectState {
        self.base.connect_state()
    }

    fn state_name(&self) -> String {
        format!("{:?}", self.base.binder.state())
    }

    async fn resume_uids(&mut self) -> VpnResult<()> {
        self.base.binder.resume_uids().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::testutil::Harness;
    use crate::vpn::types::INetAddr;

    fn network(address: &str) -> VpnConfig {
        VpnConfig {
            addresses: vec![INetAddr::new(address, 24)],
            mtu: 1400,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_set_up_and_destroy() {
        let harness = Harness::new();
        let info = harness.register("app-1", None);
        assert_eq!(info.if_name, "multitun-vpn1");
        let mut ctl = ExtendedVpnCtl::new(network("10.10.0.2"), info, harness.context());

        ctl.set_up().await.unwrap();
        assert!(ctl.base().binder.is_bound());
        assert_eq!(ctl.connect_state(), VpnConnectState::Connected);
        assert_eq!(harness.allocator.get(1).unwrap().local_address, "10.10.0.2");

        ctl.destroy().await.unwrap();
        ctl.destroy().await.unwrap();
        assert!(!ctl.base().binder.is_bound());
        assert_eq!(harness.observer.states(), vec![VpnConnectState::Connected, VpnConnectState::Disconnected]);
    }

    #[tokio::test]
    async fn test_collision_blocks_bind() {
        let harness = Harness::new();
        let mut first = ExtendedVpnCtl::new(network("10.10.0.2"), harness.register("app-1", None), harness.context());
        let mut second = ExtendedVpnCtl::new(network("10.10.0.2"), harness.register("app-2", None), harness.context());

        first.set_up().await.unwrap();
        assert!(matches!(second.set_up().await, Err(VpnError::AddressCollision(_))));
        assert!(!second.base().binder.is_bound());
        assert_eq!(harness.stack.registered_suppliers(), 1);
        assert!(!harness.allocator.is_any_tunnel_connecting());
    }

    #[tokio::test]
    async fn test_bind_failure_reports_disconnected() {
        let harness = Harness::new();
        harness.stack.fail_link_updates(true);
        let mut ctl = ExtendedVpnCtl::new(network("10.10.0.9"), harness.register("app-1", None), harness.context());
        assert!(matches!(ctl.set_up().await, Err(VpnError::NetworkBindFailed { .. })));
        assert_eq!(harness.stack.registered_suppliers(), 0);
        assert_eq!(harness.observer.states(), vec![VpnConnectState::Disconnected]);
    }

    #[tokio::test]
    async fn test_stage_rejected() {
        let harness = Harness::new();
        let mut ctl = ExtendedVpnCtl::new(network("10.10.0.2"), harness.register("app-1", None), harness.context());
        let stage = StageMessage::parse("connect").unwrap();
        assert!(matches!(
            ctl.notify_connect_stage(&stage, 0).await,
            Err(VpnError::StageProtocolViolation(_))
        ));
    }
}
