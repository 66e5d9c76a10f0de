//! Virtual tunnels for shared modem connections
//!
//! A peer device shares its VPN; locally there is no interface. Only the
//! supplier is registered so the bearer shows up, and connectivity changes
//! are broadcast by hand since no link update will trigger one.

use async_trait::async_trait;
use tracing::info;

use super::allocator::MultiVpnInfo;
use super::driver::{DriverContext, TunnelBase, TunnelDriver};
use super::stage::StageMessage;
use super::telemetry::VpnEventType;
use super::types::{VpnConfig, VpnConnectState};
use crate::error::{VpnError, VpnResult};

pub struct VirtualVpnCtl {
    base: TunnelBase,
}

impl VirtualVpnCtl {
    pub fn new(network: VpnConfig, info: MultiVpnInfo, ctx: DriverContext) -> Self {
        Self { base: TunnelBase::new(info, network, VpnEventType::Extended, ctx) }
    }

    pub fn base(&self) -> &TunnelBase {
        &self.base
    }
}

#[async_trait]
impl TunnelDriver for VirtualVpnCtl {
    fn tunnel(&self) -> &MultiVpnInfo {
        &self.base.info
    }

    fn is_system(&self) -> bool {
        false
    }

    async fn set_up(&mut self) -> VpnResult<()> {
        info!("Setting up virtual tunnel {}", self.base.info.if_name);
        let is_metered = self.base.network.is_metered;
        if let Err(e) = self.base.binder.register_supplier(is_metered).await {
            self.base.binder.destroy().await;
            return Err(e);
        }
        self.base.binder.broadcast_connectivity(true).await;
        self.base.notify_connect_state(VpnConnectState::Connected);
        Ok(())
    }

    async fn destroy(&mut self) -> VpnResult<()> {
        self.base.binder.broadcast_connectivity(false).await;
        self.base.binder.destroy().await;
        self.base.notify_connect_state(VpnConnectState::Disconnected);
        info!("Destroyed virtual tunnel {}", self.base.info.if_name);
        Ok(())
    }

    async fn notify_connect_stage(&mut self, stage: &StageMessage, _result: i32) -> VpnResult<()> {
        Err(VpnError::StageProtocolViolation(format!("virtual tunnel got stage {}", stage)))
    }

    fn connect_state(&self) -> VpnConnectState {
        self.base.connect_state()
    }

    fn state_name(&self) -> String {
        format!("{:?}", self.base.connect_state())
    }

    async fn resume_uids(&mut self) -> VpnResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::testutil::Harness;
    use crate::vpn::types::VpnType;

    #[tokio::test]
    async fn test_supplier_and_broadcasts() {
        let harness = Harness::new();
        let info = harness.register("virt", Some(VpnType::VirtualVpn));
        let mut ctl = VirtualVpnCtl::new(VpnConfig::default(), info, harness.context());

        ctl.set_up().await.unwrap();
        assert_eq!(harness.stack.registered_suppliers(), 1);
        assert_eq!(harness.stack.broadcasts(), vec![true]);
        assert_eq!(ctl.connect_state(), VpnConnectState::Connected);
        // no link info or uid rules for a virtual tunnel
        assert!(harness.stack.rules().is_empty());

        ctl.destroy().await.unwrap();
        assert_eq!(harness.stack.registered_suppliers(), 0);
        assert_eq!(harness.stack.broadcasts(), vec![true, false]);

        ctl.destroy().await.unwrap();
        assert_eq!(harness.stack.broadcasts(), vec![true, false]);
    }
}
