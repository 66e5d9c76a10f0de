//! Attaches a tunnel interface to the system network stack

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::netstack::{
    AppUidResolver, BearerType, LinkInfo, NetCapability, NetworkStack, SupplierInfo, UidRange,
};
use super::telemetry::{
    FaultEvent, FaultReporter, VpnEventErrorType, VpnEventOperation, VpnEventType,
};
use super::types::{INetAddr, Route, VpnConfig};
use crate::error::{BindStep, VpnError, VpnResult};

/// Uids reserved per user
pub const BASE_USER_RANGE: u32 = 200_000;
/// First application uid within a user range
pub const BASE_APP_UID: u32 = 10_000;
/// Last application uid within a user range
pub const MAX_APP_UID: u32 = 65_535;

/// Application uid span of `user_id`
pub fn user_app_range(user_id: u32) -> UidRange {
    let base = user_id.saturating_mul(BASE_USER_RANGE);
    UidRange::new(base.saturating_add(BASE_APP_UID), base.saturating_add(MAX_APP_UID))
}

/// Coalesce a sorted uid set into contiguous ranges
pub fn ranges_from_accepted(uids: &BTreeSet<u32>) -> Vec<UidRange> {
    let mut ranges: Vec<UidRange> = Vec::new();
    for &uid in uids {
        match ranges.last_mut() {
            Some(last) if last.end.checked_add(1) == Some(uid) => last.end = uid,
            _ => ranges.push(UidRange::new(uid, uid)),
        }
    }
    ranges
}

/// Everything in `within` except `uids`
pub fn ranges_from_refused(uids: &BTreeSet<u32>, within: UidRange) -> Vec<UidRange> {
    let mut ranges = Vec::new();
    let mut start = within.begin;
    for &uid in uids.range(within.begin..=within.end) {
        if uid > start {
            ranges.push(UidRange::new(start, uid - 1));
        }
        start = uid + 1;
    }
    if start <= within.end {
        ranges.push(UidRange::new(start, within.end));
    }
    ranges
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Unbound,
    Bound,
}

/// Per-tunnel network registration
///
/// Owns the supplier id, network id and installed uid rules of one tunnel.
/// `set_up` moves Unbound to Bound, `destroy` moves back; partial state left
/// by a failed `set_up` is tracked so `destroy` can unwind it.
pub struct NetworkBinder {
    iface: String,
    user_id: i32,
    event_type: VpnEventType,
    stack: Arc<dyn NetworkStack>,
    apps: Arc<dyn AppUidResolver>,
    faults: Arc<dyn FaultReporter>,
    supplier_id: Option<u32>,
    net_id: Option<i32>,
    routes: Vec<Route>,
    uid_ranges: Vec<UidRange>,
    installed: Vec<UidRange>,
    state: BindState,
}

impl NetworkBinder {
    pub fn new(
        iface: impl Into<String>,
        user_id: i32,
        event_type: VpnEventType,
        stack: Arc<dyn NetworkStack>,
        apps: Arc<dyn AppUidResolver>,
        faults: Arc<dyn FaultReporter>,
    ) -> Self {
        Self {
            iface: iface.into(),
            user_id,
            event_type,
            stack,
            apps,
            faults,
            supplier_id: None,
            net_id: None,
            routes: Vec::new(),
            uid_ranges: Vec::new(),
            installed: Vec::new(),
            state: BindState::Unbound,
        }
    }

    pub fn state(&self) -> BindState {
        self.state
    }

    pub fn is_bound(&self) -> bool {
        self.state == BindState::Bound
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn net_id(&self) -> Option<i32> {
        self.net_id
    }

    pub fn supplier_id(&self) -> Option<u32> {
        self.supplier_id
    }

    pub fn uid_ranges(&self) -> &[UidRange] {
        &self.uid_ranges
    }

    fn fault(&self, operation: VpnEventOperation, error_type: VpnEventErrorType, message: String) {
        self.faults.report(FaultEvent::new(self.event_type, operation, error_type, message));
    }

    fn fail(&self, step: BindStep, error_type: VpnEventErrorType, reason: String) -> VpnError {
        error!("Binding {} failed at {}: {}", self.iface, step, reason);
        self.fault(VpnEventOperation::ConnectSetting, error_type, format!("{}: {}", step, reason));
        VpnError::bind(step, reason)
    }

    /// Register only the supplier and mark it available. Used by tunnels
    /// without an interface of their own.
    pub async fn register_supplier(&mut self, is_metered: bool) -> VpnResult<u32> {
        if let Some(id) = self.supplier_id {
            return Err(self.fail(
                BindStep::SupplierRegistration,
                VpnEventErrorType::RegNetSupplier,
                format!("supplier {} already registered", id),
            ));
        }
        let mut capabilities = vec![NetCapability::Internet];
        if !is_metered {
            capabilities.push(NetCapability::NotMetered);
        }
        let supplier_id = self
            .stack
            .register_supplier(BearerType::Vpn, &self.iface, capabilities)
            .await
            .map_err(|e| self.fail(BindStep::SupplierRegistration, VpnEventErrorType::RegNetSupplier, e.to_string()))?;
        self.supplier_id = Some(supplier_id);
        debug!("Registered supplier {} for {}", supplier_id, self.iface);

        self.stack
            .update_supplier_info(supplier_id, SupplierInfo { is_available: true })
            .await
            .map_err(|e| self.fail(BindStep::SupplierInfoUpdate, VpnEventErrorType::UpdateSupplierInfo, e.to_string()))?;
        Ok(supplier_id)
    }

    fn link_info(&self, config: &VpnConfig) -> LinkInfo {
        let mut routes: Vec<Route> = config
            .routes
            .iter()
            .map(|r| Route { iface: self.iface.clone(), ..r.clone() })
            .collect();
        if routes.is_empty() {
            let has_v6 = config.addresses.iter().any(INetAddr::is_ipv6);
            let has_v4 = !has_v6 || config.addresses.iter().any(|a| !a.is_ipv6());
            if has_v4 {
                routes.push(Route::default_via(&self.iface, &INetAddr::new("0.0.0.0", 0)));
            }
            if has_v6 {
                routes.push(Route::default_via(&self.iface, &INetAddr::new("::", 0)));
            }
        }

        LinkInfo {
            iface_name: self.iface.clone(),
            addresses: config.addresses.clone(),
            routes,
            dns: config.dns_addresses.clone(),
            domain: config.search_domains.join(" "),
            mtu: config.mtu,
        }
    }

    /// Uid ranges routed through the tunnel: accepted apps, else everything
    /// but refused apps, else the whole user range
    pub fn compute_uid_ranges(&self, config: &VpnConfig) -> Vec<UidRange> {
        let user = u32::try_from(self.user_id).unwrap_or(0);
        let lookup = |apps: &[String]| -> BTreeSet<u32> {
            apps.iter()
                .filter_map(|app| {
                    let uid = self.apps.uid_for(app, self.user_id);
                    if uid.is_none() {
                        warn!("No uid for application {}", app);
                    }
                    uid
                })
                .collect()
        };

        if !config.accepted_applications.is_empty() {
            ranges_from_accepted(&lookup(&config.accepted_applications))
        } else if !config.refused_applications.is_empty() {
            ranges_from_refused(&lookup(&config.refused_applications), user_app_range(user))
        } else {
            vec![user_app_range(user)]
        }
    }

    /// Register the supplier, push link info and install uid rules.
    /// On failure the partial state stays recorded for `destroy`.
    pub async fn set_up(&mut self, config: &VpnConfig) -> VpnResult<()> {
        if self.is_bound() {
            return Err(VpnError::AlreadyExists(format!("{} is already bound", self.iface)));
        }
        info!("Binding tunnel interface {}", self.iface);

        let supplier_id = self.register_supplier(config.is_metered).await?;

        let link = self.link_info(config);
        let routes = link.routes.clone();
        self.stack
            .update_link_info(supplier_id, link)
            .await
            .map_err(|e| self.fail(BindStep::LinkInfoUpdate, VpnEventErrorType::UpdateNetlinkInfo, e.to_string()))?;
        self.routes = routes;

        let net_id = self
            .stack
            .resolve_net_id(&self.iface)
            .await
            .map_err(|e| self.fail(BindStep::NetIdResolution, VpnEventErrorType::Internal, e.to_string()))?;
        if net_id <= 0 {
            return Err(self.fail(
                BindStep::NetIdResolution,
                VpnEventErrorType::Internal,
                format!("invalid net id {}", net_id),
            ));
        }
        self.net_id = Some(net_id);
        info!("Tunnel {} has net id {}", self.iface, net_id);

        self.uid_ranges = self.compute_uid_ranges(config);
        for range in self.uid_ranges.clone() {
            self.stack
                .add_uid_rule(net_id, range)
                .await
                .map_err(|e| self.fail(BindStep::UidRule, VpnEventErrorType::SetAppUidRule, e.to_string()))?;
            self.installed.push(range);
            debug!("Routed uids {} through net {}", range, net_id);
        }

        self.state = BindState::Bound;
        Ok(())
    }

    /// Undo whatever `set_up` applied. Never fails and is safe in any state.
    pub async fn destroy(&mut self) {
        if let Some(net_id) = self.net_id {
            for range in std::mem::take(&mut self.installed) {
                if let Err(e) = self.stack.remove_uid_rule(net_id, range).await {
                    warn!("Failed to remove uid rule {} on net {}: {}", range, net_id, e);
                }
            }
        }

        let routes = std::mem::take(&mut self.routes);
        if !routes.is_empty() {
            if let Err(e) = self.stack.remove_routes(&self.iface, routes).await {
                warn!("Failed to remove routes of {}: {}", self.iface, e);
            }
        }

        if let Some(supplier_id) = self.supplier_id.take() {
            if let Err(e) = self.stack.update_supplier_info(supplier_id, SupplierInfo { is_available: false }).await {
                warn!("Failed to mark supplier {} unavailable: {}", supplier_id, e);
            }
            if let Err(e) = self.stack.unregister_supplier(supplier_id).await {
                warn!("Failed to unregister supplier {}: {}", supplier_id, e);
                self.fault(VpnEventOperation::ConnectDestroy, VpnEventErrorType::RegNetSupplier, e.to_string());
            }
        }

        if self.state == BindState::Bound {
            info!("Unbound tunnel interface {}", self.iface);
        }
        self.net_id = None;
        self.uid_ranges.clear();
        self.state = BindState::Unbound;
    }

    /// Reinstall the computed uid rules after the network stack restarted
    pub async fn resume_uids(&mut self) -> VpnResult<()> {
        let net_id = match (self.state, self.net_id) {
            (BindState::Bound, Some(id)) => id,
            _ => return Err(VpnError::NotConnected(format!("{} is not bound", self.iface))),
        };
        for range in &self.uid_ranges {
            self.stack.add_uid_rule(net_id, *range).await.map_err(|e| {
                self.fail(BindStep::UidRule, VpnEventErrorType::SetAppUidRule, e.to_string())
            })?;
        }
        info!("Resumed {} uid range(s) on {}", self.uid_ranges.len(), self.iface);
        Ok(())
    }

    /// Connectivity broadcast for suppliers without link info
    pub async fn broadcast_connectivity(&self, connected: bool) {
        if let Some(supplier_id) = self.supplier_id {
            if let Err(e) = self.stack.broadcast_connectivity(supplier_id, connected).await {
                warn!("Connectivity broadcast for {} failed: {}", self.iface, e);
            }
        }
    }
}
