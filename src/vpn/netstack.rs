//! Kernel network stack boundary
//!
//! The tunnel logic never touches routing tables directly. It talks to a
//! [`NetworkStack`] that registers suppliers, pushes link information and
//! installs per-UID routing rules.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

use super::types::{INetAddr, Route};
use crate::error::VpnResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BearerType {
    Vpn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetCapability {
    Internet,
    NotMetered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupplierInfo {
    pub is_available: bool,
}

/// Link parameters pushed for a tunnel interface
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkInfo {
    pub iface_name: String,
    pub addresses: Vec<INetAddr>,
    pub routes: Vec<Route>,
    pub dns: Vec<String>,
    /// Search domains joined by spaces
    pub domain: String,
    pub mtu: u32,
}

/// Inclusive span of process uids
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UidRange {
    pub begin: u32,
    pub end: u32,
}

impl UidRange {
    pub fn new(begin: u32, end: u32) -> Self {
        Self { begin, end }
    }
}

impl fmt::Display for UidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.begin, self.end)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkStack: Send + Sync {
    /// Register a supplier for `ident` and return its id
    async fn register_supplier(
        &self,
        bearer: BearerType,
        ident: &str,
        capabilities: Vec<NetCapability>,
    ) -> VpnResult<u32>;

    async fn unregister_supplier(&self, supplier_id: u32) -> VpnResult<()>;

    async fn update_supplier_info(&self, supplier_id: u32, info: SupplierInfo) -> VpnResult<()>;

    async fn update_link_info(&self, supplier_id: u32, link: LinkInfo) -> VpnResult<()>;

    async fn remove_routes(&self, iface: &str, routes: Vec<Route>) -> VpnResult<()>;

    /// Kernel network id assigned to the supplier of `ident`
    async fn resolve_net_id(&self, ident: &str) -> VpnResult<i32>;

    async fn add_uid_rule(&self, net_id: i32, range: UidRange) -> VpnResult<()>;

    async fn remove_uid_rule(&self, net_id: i32, range: UidRange) -> VpnResult<()>;

    /// Announce a connectivity change for suppliers without a real link
    async fn broadcast_connectivity(&self, supplier_id: u32, connected: bool) -> VpnResult<()>;
}

/// Maps bundle names to the uid they run under for a user
pub trait AppUidResolver: Send + Sync {
    fn uid_for(&self, bundle_name: &str, user_id: i32) -> Option<u32>;
}

/// Fixed bundle to per-user app id table
#[derive(Debug, Clone, Default)]
pub struct AppUidTable {
    app_ids: HashMap<String, u32>,
}

impl AppUidTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `app_id` is the offset inside a user's uid range
    pub fn insert(&mut self, bundle_name: impl Into<String>, app_id: u32) {
        self.app_ids.insert(bundle_name.into(), app_id);
    }
}

impl AppUidResolver for AppUidTable {
    fn uid_for(&self, bundle_name: &str, user_id: i32) -> Option<u32> {
        let app_id = *self.app_ids.get(bundle_name)?;
        let base = u32::try_from(user_id).ok()?.checked_mul(super::binder::BASE_USER_RANGE)?;
        base.checked_add(app_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_uid_table() {
        let mut table = AppUidTable::new();
        table.insert("com.example.mail", 20_010);
        assert_eq!(table.uid_for("com.example.mail", 0), Some(20_010));
        assert_eq!(table.uid_for("com.example.mail", 100), Some(20_020_010));
        assert_eq!(table.uid_for("com.example.other", 100), None);
        assert_eq!(table.uid_for("com.example.mail", -1), None);
    }
}
