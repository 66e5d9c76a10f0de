//! Multi-tunnel resource allocation
//!
//! One [`TunnelAllocator`] is shared by every active tunnel. It hands out
//! interface name suffixes, tracks which tunnel holds which local address, and
//! reference-counts the daemons that serve several tunnels at once. All state
//! sits behind a single mutex so id allocation and collision checks always see
//! a consistent snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::types::{VpnConnectState, VpnFamily, VpnType};
use crate::error::{VpnError, VpnResult};

/// Default registry capacity
pub const MAX_TUNNELS: usize = 20;

/// Interface shared by OpenVPN tunnels
pub const TUN_CARD_NAME: &str = "vpn-tun";

const XFRM_PREFIX: &str = "xfrm-vpn";
const PPP_PREFIX: &str = "ppp-vpn";
const MULTITUN_PREFIX: &str = "multitun-vpn";

/// Native daemons that serve several tunnels from one process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedDaemon {
    Ipsec,
    L2tp,
}

/// Runtime record of one active tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiVpnInfo {
    pub vpn_id: String,
    pub if_name: String,
    pub if_name_id: u32,
    /// None for app supplied tunnels
    pub vpn_type: Option<VpnType>,
    pub calling_uid: i32,
    pub user_id: i32,
    pub bundle_name: String,
    pub connect_state: VpnConnectState,
    pub is_vpn_ext_call: bool,
    pub local_address: String,
    pub is_connecting: bool,
}

/// Interface name for a tunnel of `vpn_type` holding `id`
pub fn interface_name(vpn_type: Option<VpnType>, id: u32) -> String {
    match vpn_type.map(VpnType::family) {
        Some(VpnFamily::Ipsec) => format!("{}{}", XFRM_PREFIX, id),
        Some(VpnFamily::Openvpn) => TUN_CARD_NAME.to_string(),
        Some(VpnFamily::L2tp) => format!("{}{}", PPP_PREFIX, id),
        _ => format!("{}{}", MULTITUN_PREFIX, id),
    }
}

/// Smallest positive integer missing from `used`
fn first_free_id<I: IntoIterator<Item = u32>>(used: I) -> u32 {
    let mut ids: Vec<u32> = used.into_iter().collect();
    ids.sort_unstable();
    let mut candidate = 1;
    for id in ids {
        if id == candidate {
            candidate += 1;
        } else if id > candidate {
            break;
        }
    }
    candidate
}

#[derive(Default)]
struct AllocatorState {
    tunnels: BTreeMap<u32, MultiVpnInfo>,
    ref_counts: HashMap<SharedDaemon, usize>,
}

impl AllocatorState {
    fn new_info(
        &self,
        vpn_id: &str,
        vpn_type: Option<VpnType>,
        calling_uid: i32,
        user_id: i32,
        max_tunnels: usize,
    ) -> VpnResult<MultiVpnInfo> {
        if self.tunnels.len() >= max_tunnels {
            warn!("Tunnel registry full ({} tunnels)", max_tunnels);
            return Err(VpnError::CapacityExceeded(format!("at most {} tunnels can be active", max_tunnels)));
        }
        let id = first_free_id(self.tunnels.keys().copied());
        Ok(MultiVpnInfo {
            vpn_id: vpn_id.to_string(),
            if_name: interface_name(vpn_type, id),
            if_name_id: id,
            vpn_type,
            calling_uid,
            user_id,
            bundle_name: String::new(),
            connect_state: VpnConnectState::Disconnected,
            is_vpn_ext_call: false,
            local_address: String::new(),
            is_connecting: false,
        })
    }

    fn collides(&self, owner: Option<u32>, candidate: &str) -> bool {
        self.tunnels
            .values()
            .any(|t| Some(t.if_name_id) != owner && t.local_address == candidate)
    }
}

/// Shared registry of active tunnels and daemon reference counts
pub struct TunnelAllocator {
    state: Mutex<AllocatorState>,
    max_tunnels: usize,
}

impl Default for TunnelAllocator {
    fn default() -> Self {
        Self::new(MAX_TUNNELS)
    }
}

impl TunnelAllocator {
    pub fn new(max_tunnels: usize) -> Self {
        Self {
            state: Mutex::new(AllocatorState::default()),
            max_tunnels,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Smallest positive id not held by a registered tunnel
    pub fn allocate_interface_id(&self) -> u32 {
        first_free_id(self.lock().tunnels.keys().copied())
    }

    /// Build an unregistered record with a fresh id and interface name
    pub fn create_tunnel_info(
        &self,
        vpn_id: &str,
        vpn_type: Option<VpnType>,
        calling_uid: i32,
        user_id: i32,
    ) -> VpnResult<MultiVpnInfo> {
        self.lock().new_info(vpn_id, vpn_type, calling_uid, user_id, self.max_tunnels)
    }

    /// Create and register in one step, so no other caller can take the id in between
    pub fn register_new(
        &self,
        vpn_id: &str,
        vpn_type: Option<VpnType>,
        calling_uid: i32,
        user_id: i32,
    ) -> VpnResult<MultiVpnInfo> {
        let mut state = self.lock();
        if state.tunnels.values().any(|t| t.vpn_id == vpn_id) {
            return Err(VpnError::AlreadyExists(format!("tunnel {} is already active", vpn_id)));
        }
        let info = state.new_info(vpn_id, vpn_type, calling_uid, user_id, self.max_tunnels)?;
        state.tunnels.insert(info.if_name_id, info.clone());
        info!("Registered tunnel {} on {}", vpn_id, info.if_name);
        Ok(info)
    }

    /// Add `info`. Registering the same tunnel again is a no-op.
    pub fn register(&self, info: &MultiVpnInfo) -> VpnResult<()> {
        let mut state = self.lock();
        if let Some(existing) = state.tunnels.get(&info.if_name_id) {
            if existing.vpn_id == info.vpn_id {
                return Ok(());
            }
            return Err(VpnError::AlreadyExists(format!(
                "interface id {} is held by tunnel {}",
                info.if_name_id, existing.vpn_id
            )));
        }
        if state.tunnels.len() >= self.max_tunnels {
            return Err(VpnError::CapacityExceeded(format!("at most {} tunnels can be active", self.max_tunnels)));
        }
        state.tunnels.insert(info.if_name_id, info.clone());
        info!("Registered tunnel {} on {}", info.vpn_id, info.if_name);
        Ok(())
    }

    /// Remove the tunnel holding `if_name_id`. Removing an absent tunnel is a no-op.
    pub fn unregister(&self, if_name_id: u32) -> Option<MultiVpnInfo> {
        let removed = self.lock().tunnels.remove(&if_name_id);
        if let Some(info) = &removed {
            info!("Unregistered tunnel {} from {}", info.vpn_id, info.if_name);
        }
        removed
    }

    pub fn get(&self, if_name_id: u32) -> Option<MultiVpnInfo> {
        self.lock().tunnels.get(&if_name_id).cloned()
    }

    pub fn find_by_vpn_id(&self, vpn_id: &str) -> Option<MultiVpnInfo> {
        self.lock().tunnels.values().find(|t| t.vpn_id == vpn_id).cloned()
    }

    /// Snapshot of every registered tunnel, ordered by interface id
    pub fn tunnels(&self) -> Vec<MultiVpnInfo> {
        self.lock().tunnels.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail if a tunnel other than `owner` already holds `candidate`.
    /// An empty candidate always passes.
    pub fn check_local_address_collision(&self, owner: Option<u32>, candidate: &str) -> VpnResult<()> {
        if candidate.is_empty() {
            return Ok(());
        }
        if self.lock().collides(owner, candidate) {
            warn!("Local address {} already in use by another tunnel", candidate);
            return Err(VpnError::AddressCollision(candidate.to_string()));
        }
        Ok(())
    }

    /// Check and record `candidate` as the local address of `if_name_id` atomically
    pub fn claim_local_address(&self, if_name_id: u32, candidate: &str) -> VpnResult<()> {
        let mut state = self.lock();
        if !candidate.is_empty() && state.collides(Some(if_name_id), candidate) {
            warn!("Local address {} already in use by another tunnel", candidate);
            return Err(VpnError::AddressCollision(candidate.to_string()));
        }
        let tunnel = state
            .tunnels
            .get_mut(&if_name_id)
            .ok_or_else(|| VpnError::NotFound(format!("tunnel with interface id {}", if_name_id)))?;
        tunnel.local_address = candidate.to_string();
        debug!("Tunnel {} claimed local address {}", tunnel.vpn_id, candidate);
        Ok(())
    }

    pub fn set_connecting(&self, if_name_id: u32, connecting: bool) {
        if let Some(t) = self.lock().tunnels.get_mut(&if_name_id) {
            t.is_connecting = connecting;
        }
    }

    pub fn set_connect_state(&self, if_name_id: u32, state: VpnConnectState) {
        if let Some(t) = self.lock().tunnels.get_mut(&if_name_id) {
            t.connect_state = state;
            if state == VpnConnectState::Connected {
                t.is_connecting = false;
            }
        }
    }

    pub fn set_owner(&self, if_name_id: u32, bundle_name: &str, is_vpn_ext_call: bool) {
        if let Some(t) = self.lock().tunnels.get_mut(&if_name_id) {
            t.bundle_name = bundle_name.to_string();
            t.is_vpn_ext_call = is_vpn_ext_call;
        }
    }

    pub fn is_any_tunnel_connecting(&self) -> bool {
        self.lock().tunnels.values().any(|t| t.is_connecting)
    }

    /// Take a reference on `daemon`. The returned guard reports whether the
    /// daemon was already running and must be released exactly once.
    pub fn acquire_shared_daemon(self: &Arc<Self>, daemon: SharedDaemon) -> SharedDaemonGuard {
        let mut state = self.lock();
        let count = state.ref_counts.entry(daemon).or_insert(0);
        let already_running = *count > 0;
        *count += 1;
        debug!("Acquired {:?} daemon, {} holder(s)", daemon, count);
        SharedDaemonGuard {
            allocator: Arc::clone(self),
            daemon,
            already_running,
            released: false,
        }
    }

    pub fn shared_daemon_count(&self, daemon: SharedDaemon) -> usize {
        self.lock().ref_counts.get(&daemon).copied().unwrap_or(0)
    }

    fn release_shared_daemon(&self, daemon: SharedDaemon) -> bool {
        let mut state = self.lock();
        let count = state.ref_counts.entry(daemon).or_insert(0);
        if *count == 0 {
            warn!("Release of {:?} daemon without a holder", daemon);
            return false;
        }
        *count -= 1;
        debug!("Released {:?} daemon, {} holder(s) left", daemon, count);
        *count == 0
    }
}

/// One tunnel's reference on a shared daemon
#[derive(Debug)]
pub struct SharedDaemonGuard {
    allocator: Arc<TunnelAllocator>,
    daemon: SharedDaemon,
    already_running: bool,
    released: bool,
}

impl SharedDaemonGuard {
    /// True when another tunnel had started the daemon before this acquire
    pub fn already_running(&self) -> bool {
        self.already_running
    }

    pub fn daemon(&self) -> SharedDaemon {
        self.daemon
    }

    /// Drop the reference. Returns true when this was the last holder and the
    /// daemon should be stopped.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.allocator.release_shared_daemon(self.daemon)
    }
}

impl Drop for SharedDaemonGuard {
    fn drop(&mut self) {
        if !self.released && self.allocator.release_shared_daemon(self.daemon) {
            warn!("{:?} daemon lost its last holder without an explicit stop", self.daemon);
        }
    }
}

impl std::fmt::Debug for TunnelAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("TunnelAllocator")
            .field("tunnels", &state.tunnels.len())
            .field("max_tunnels", &self.max_tunnels)
            .finish()
    }
}
