//! In-memory collaborators for driver tests

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use super::allocator::{MultiVpnInfo, TunnelAllocator};
use super::daemon::{DaemonBridge, StageCommand};
use super::driver::{DriverContext, StateObserver};
use super::netstack::{AppUidTable, BearerType, LinkInfo, NetCapability, NetworkStack, SupplierInfo, UidRange};
use super::telemetry::FaultLog;
use super::types::{Route, VpnConnectState, VpnType};
use crate::error::{VpnError, VpnResult};

#[derive(Default)]
struct StackState {
    next_supplier: u32,
    suppliers: BTreeSet<u32>,
    by_ident: HashMap<String, u32>,
    rules: Vec<(i32, UidRange)>,
    broadcasts: Vec<bool>,
    fail_link_updates: bool,
}

/// Network stack that only records what it was asked to do
#[derive(Default)]
pub struct FakeStack {
    state: Mutex<StackState>,
}

impl FakeStack {
    pub fn registered_suppliers(&self) -> usize {
        self.state.lock().unwrap().suppliers.len()
    }

    pub fn fail_link_updates(&self, fail: bool) {
        self.state.lock().unwrap().fail_link_updates = fail;
    }

    pub fn rules(&self) -> Vec<(i32, UidRange)> {
        self.state.lock().unwrap().rules.clone()
    }

    pub fn broadcasts(&self) -> Vec<bool> {
        self.state.lock().unwrap().broadcasts.clone()
    }
}

#[async_trait]
impl NetworkStack for FakeStack {
    async fn register_supplier(&self, _bearer: BearerType, ident: &str, _capabilities: Vec<NetCapability>) -> VpnResult<u32> {
        let mut state = self.state.lock().unwrap();
        state.next_supplier += 1;
        let id = state.next_supplier;
        state.suppliers.insert(id);
        state.by_ident.insert(ident.to_string(), id);
        Ok(id)
    }

    async fn unregister_supplier(&self, supplier_id: u32) -> VpnResult<()> {
        let mut state = self.state.lock().unwrap();
        state.suppliers.remove(&supplier_id);
        state.by_ident.retain(|_, id| *id != supplier_id);
        Ok(())
    }

    async fn update_supplier_info(&self, _supplier_id: u32, _info: SupplierInfo) -> VpnResult<()> {
        Ok(())
    }

    async fn update_link_info(&self, _supplier_id: u32, _link: LinkInfo) -> VpnResult<()> {
        if self.state.lock().unwrap().fail_link_updates {
            return Err(VpnError::InvalidConfig("link update rejected".into()));
        }
        Ok(())
    }

    async fn remove_routes(&self, _iface: &str, _routes: Vec<Route>) -> VpnResult<()> {
        Ok(())
    }

    async fn resolve_net_id(&self, ident: &str) -> VpnResult<i32> {
        let state = self.state.lock().unwrap();
        let id = state
            .by_ident
            .get(ident)
            .ok_or_else(|| VpnError::NotFound(format!("supplier for {}", ident)))?;
        Ok(100 + *id as i32)
    }

    async fn add_uid_rule(&self, net_id: i32, range: UidRange) -> VpnResult<()> {
        self.state.lock().unwrap().rules.push((net_id, range));
        Ok(())
    }

    async fn remove_uid_rule(&self, net_id: i32, range: UidRange) -> VpnResult<()> {
        self.state.lock().unwrap().rules.retain(|r| *r != (net_id, range));
        Ok(())
    }

    async fn broadcast_connectivity(&self, _supplier_id: u32, connected: bool) -> VpnResult<()> {
        self.state.lock().unwrap().broadcasts.push(connected);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingDaemon {
    commands: Mutex<Vec<StageCommand>>,
}

impl RecordingDaemon {
    pub fn commands(&self) -> Vec<StageCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count(&self, command: &StageCommand) -> usize {
        self.commands.lock().unwrap().iter().filter(|c| *c == command).count()
    }
}

#[async_trait]
impl DaemonBridge for RecordingDaemon {
    async fn send(&self, command: StageCommand) -> VpnResult<()> {
        self.commands.lock().unwrap().push(command);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    states: Mutex<Vec<VpnConnectState>>,
}

impl RecordingObserver {
    pub fn states(&self) -> Vec<VpnConnectState> {
        self.states.lock().unwrap().clone()
    }
}

impl StateObserver for RecordingObserver {
    fn on_connect_state(&self, _tunnel: &MultiVpnInfo, state: VpnConnectState) {
        self.states.lock().unwrap().push(state);
    }
}

pub struct Harness {
    pub allocator: Arc<TunnelAllocator>,
    pub stack: Arc<FakeStack>,
    pub daemon: Arc<RecordingDaemon>,
    pub faults: Arc<FaultLog>,
    pub observer: Arc<RecordingObserver>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            allocator: Arc::new(TunnelAllocator::default()),
            stack: Arc::new(FakeStack::default()),
            daemon: Arc::new(RecordingDaemon::default()),
            faults: Arc::new(FaultLog::default()),
            observer: Arc::new(RecordingObserver::default()),
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn context(&self) -> DriverContext {
        DriverContext {
            allocator: Arc::clone(&self.allocator),
            stack: self.stack.clone(),
            daemon: self.daemon.clone(),
            faults: self.faults.clone(),
            apps: Arc::new(AppUidTable::new()),
            observer: self.observer.clone(),
            vpn_dir: self.dir.path().to_path_buf(),
        }
    }

    pub fn register(&self, vpn_id: &str, vpn_type: Option<VpnType>) -> MultiVpnInfo {
        self.allocator.register_new(vpn_id, vpn_type, 0, 0).unwrap()
    }
}
