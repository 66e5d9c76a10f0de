//! Shared fakes for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use libnetvpn::error::VpnResult;
use libnetvpn::vpn::netstack::{BearerType, LinkInfo, NetCapability, SupplierInfo};
use libnetvpn::vpn::types::Route;
use libnetvpn::vpn::{AppUidTable, Collaborators, DaemonBridge, FaultLog, NetworkStack, StageCommand, UidRange};
use libnetvpn::{ConfigStore, CredentialCipher, MemoryBackend, MemoryKeyVault, ServiceConfig, VpnOrchestrator};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct StackState {
    next_id: u32,
    suppliers: BTreeSet<u32>,
    idents: HashMap<String, u32>,
    links: Vec<LinkInfo>,
    rules: Vec<(i32, UidRange)>,
}

/// Network stack that keeps what it was told
#[derive(Default)]
pub struct RecordingStack {
    state: Mutex<StackState>,
}

impl RecordingStack {
    pub fn suppliers(&self) -> usize {
        self.state.lock().unwrap().suppliers.len()
    }

    pub fn links(&self) -> Vec<LinkInfo> {
        self.state.lock().unwrap().links.clone()
    }

    pub fn rules(&self) -> Vec<(i32, UidRange)> {
        self.state.lock().unwrap().rules.clone()
    }
}

#[async_trait]
impl NetworkStack for RecordingStack {
    async fn register_supplier(&self, _bearer: BearerType, ident: &str, _caps: Vec<NetCapability>) -> VpnResult<u32> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.suppliers.insert(id);
        state.idents.insert(ident.to_string(), id);
        Ok(id)
    }

    async fn unregister_supplier(&self, supplier_id: u32) -> VpnResult<()> {
        let mut state = self.state.lock().unwrap();
        state.suppliers.remove(&supplier_id);
        state.idents.retain(|_, id| *id != supplier_id);
        Ok(())
    }

    async fn update_supplier_info(&self, _supplier_id: u32, _info: SupplierInfo) -> VpnResult<()> {
        Ok(())
    }

    async fn update_link_info(&self, _supplier_id: u32, link: LinkInfo) -> VpnResult<()> {
        self.state.lock().unwrap().links.push(link);
        Ok(())
    }

    async fn remove_routes(&self, _iface: &str, _routes: Vec<Route>) -> VpnResult<()> {
        Ok(())
    }

    async fn resolve_net_id(&self, ident: &str) -> VpnResult<i32> {
        let state = self.state.lock().unwrap();
        Ok(state.idents.get(ident).map(|id| 100 + *id as i32).unwrap_or(-1))
    }

    async fn add_uid_rule(&self, net_id: i32, range: UidRange) -> VpnResult<()> {
        self.state.lock().unwrap().rules.push((net_id, range));
        Ok(())
    }

    async fn remove_uid_rule(&self, net_id: i32, range: UidRange) -> VpnResult<()> {
        self.state.lock().unwrap().rules.retain(|r| *r != (net_id, range));
        Ok(())
    }

    async fn broadcast_connectivity(&self, _supplier_id: u32, _connected: bool) -> VpnResult<()> {
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

pub struct Service {
    pub orchestrator: VpnOrchestrator,
    pub stack: Arc<RecordingStack>,
    pub daemon: Arc<RecordingDaemon>,
    pub faults: Arc<FaultLog>,
    pub config: ServiceConfig,
    pub dir: TempDir,
}

/// Orchestrator over in-memory storage and recording fakes
pub fn service() -> Service {
    let dir = TempDir::new().unwrap();
    let config = ServiceConfig::with_root(dir.path());
    config.ensure_directories().unwrap();
    let stack = Arc::new(RecordingStack::default());
    let daemon = Arc::new(RecordingDaemon::default());
    let faults = Arc::new(FaultLog::default());
    let store = ConfigStore::new(
        Arc::new(MemoryBackend::new()),
        CredentialCipher::new(Arc::new(MemoryKeyVault::new())),
    );
    let deps = Collaborators {
        stack: stack.clone(),
        daemon: daemon.clone(),
        faults: faults.clone(),
        apps: Arc::new(AppUidTable::new()),
    };
    Service {
        orchestrator: VpnOrchestrator::new(&config, store, deps),
        stack,
        daemon,
        faults,
        config,
        dir,
    }
}
