//! VPN orchestrator: owns the active tunnels, routes daemon stages to them
//! and serves profile storage for callers.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::error::{result_code, VpnError, VpnResult};
use crate::store::ConfigStore;
use super::allocator::{MultiVpnInfo, TunnelAllocator};
use super::daemon::DaemonBridge;
use super::driver::{create_driver, is_recoverable, DriverContext, TunnelDriver};
use super::events::{ListenerHub, VpnStateEvent, VpnStateListener};
use super::extended::ExtendedVpnCtl;
use super::netstack::{AppUidResolver, NetworkStack};
use super::stage::{StageKind, StageMessage};
use super::telemetry::{FaultEvent, FaultReporter, VpnEventErrorType, VpnEventOperation, VpnEventType};
use super::template::{needs_generation, TemplateProcessor};
use super::types::{SysVpnConfig, SysVpnSummary, VpnConfig, VpnConnectState, VpnFamily, VpnType};

type SharedDriver = Arc<Mutex<Box<dyn TunnelDriver>>>;
type TunnelMap = Arc<RwLock<HashMap<String, SharedDriver>>>;

/// External services the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub stack: Arc<dyn NetworkStack>,
    pub daemon: Arc<dyn DaemonBridge>,
    pub faults: Arc<dyn FaultReporter>,
    pub apps: Arc<dyn AppUidResolver>,
}

/// Answer to `prepare`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareInfo {
    pub is_exist_vpn: bool,
    pub is_run: bool,
    pub package: String,
}

/// VPN orchestrator - owns every active tunnel and the profile store
pub struct VpnOrchestrator {
    /// Active tunnels by vpn id
    tunnels: TunnelMap,
    allocator: Arc<TunnelAllocator>,
    listeners: Arc<ListenerHub>,
    store: ConfigStore,
    ctx: DriverContext,
    vpn_dir: PathBuf,
    stage_timeout: Option<Duration>,
}

impl VpnOrchestrator {
    pub fn new(config: &ServiceConfig, store: ConfigStore, deps: Collaborators) -> Self {
        let allocator = Arc::new(TunnelAllocator::new(config.limits.max_tunnels));
        let listeners = Arc::new(ListenerHub::new(config.limits.max_listeners));
        let ctx = DriverContext {
            allocator: Arc::clone(&allocator),
            stack: deps.stack,
            daemon: deps.daemon,
            faults: deps.faults,
            apps: deps.apps,
            observer: listeners.clone(),
            vpn_dir: config.paths.vpn_dir.clone(),
        };
        Self {
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            allocator,
            listeners,
            store,
            ctx,
            vpn_dir: config.paths.vpn_dir.clone(),
            stage_timeout: config.stage_timeout(),
        }
    }

    /// Orchestrator over the on-disk record store and key directory
    pub fn open(config: &ServiceConfig, deps: Collaborators) -> VpnResult<Self> {
        let store = ConfigStore::open(config)?;
        info!("VPN service using {:?}", config.paths.database_path);
        Ok(Self::new(config, store, deps))
    }

    pub fn allocator(&self) -> &Arc<TunnelAllocator> {
        &self.allocator
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    async fn driver(&self, vpn_id: &str) -> Option<SharedDriver> {
        self.tunnels.read().await.get(vpn_id).cloned()
    }

    /// App tunnel state for `bundle_name`, or the first app tunnel when empty
    pub async fn prepare(&self, bundle_name: &str) -> PrepareInfo {
        let found = self
            .allocator
            .tunnels()
            .into_iter()
            .filter(|t| t.is_vpn_ext_call)
            .find(|t| bundle_name.is_empty() || t.bundle_name == bundle_name);
        match found {
            Some(t) => PrepareInfo {
                is_exist_vpn: true,
                is_run: t.is_connecting,
                package: t.bundle_name,
            },
            None => PrepareInfo::default(),
        }
    }

    /// Bring up an app supplied tunnel and return its generated id
    pub async fn set_up_vpn(
        &self,
        config: VpnConfig,
        bundle_name: &str,
        calling_uid: i32,
        user_id: i32,
    ) -> VpnResult<String> {
        if self
            .allocator
            .tunnels()
            .iter()
            .any(|t| t.is_vpn_ext_call && t.bundle_name == bundle_name)
        {
            warn!("App {} already has an active tunnel", bundle_name);
            return Err(VpnError::AlreadyExists(format!("{} already owns a tunnel", bundle_name)));
        }

        let vpn_id = uuid::Uuid::new_v4().to_string();
        let mut info = self.allocator.register_new(&vpn_id, None, calling_uid, user_id)?;
        self.allocator.set_owner(info.if_name_id, bundle_name, true);
        info.bundle_name = bundle_name.to_string();
        info.is_vpn_ext_call = true;

        let driver: Box<dyn TunnelDriver> = Box::new(ExtendedVpnCtl::new(config, info.clone(), self.ctx.clone()));
        self.start(info, driver).await?;
        Ok(vpn_id)
    }

    pub async fn destroy_vpn(&self, vpn_id: &str) -> VpnResult<()> {
        self.teardown(vpn_id, false).await
    }

    /// Start a system profile. Missing daemon configs are generated first.
    pub async fn set_up_sys_vpn(&self, mut config: SysVpnConfig, calling_uid: i32) -> VpnResult<()> {
        config.validate()?;
        self.reap_stale(&config.vpn_id).await;

        if needs_generation(&config) {
            TemplateProcessor::new(&self.vpn_dir).build(&mut config)?;
        }
        let user_id = config.user_id;
        let info = self
            .allocator
            .register_new(&config.vpn_id, Some(config.vpn_type), calling_uid, user_id)?;

        let driver = match create_driver(config, info.clone(), self.ctx.clone()) {
            Ok(driver) => driver,
            Err(e) => {
                self.allocator.unregister(info.if_name_id);
                return Err(e);
            }
        };
        self.start(info, driver).await
    }

    /// Load a stored profile and start it
    pub async fn connect_stored(&self, vpn_id: &str, calling_uid: i32) -> VpnResult<()> {
        let config = self.store.load(vpn_id).await?;
        self.set_up_sys_vpn(config, calling_uid).await
    }

    pub async fn destroy_sys_vpn(&self, vpn_id: &str) -> VpnResult<()> {
        self.teardown(vpn_id, true).await
    }

    async fn start(&self, info: MultiVpnInfo, driver: Box<dyn TunnelDriver>) -> VpnResult<()> {
        let shared: SharedDriver = Arc::new(Mutex::new(driver));
        self.tunnels.write().await.insert(info.vpn_id.clone(), shared.clone());

        let mut guard = shared.lock().await;
        if let Err(e) = guard.set_up().await {
            error!("Failed to set up tunnel {}: {}", info.vpn_id, e);
            if let Err(destroy_err) = guard.destroy().await {
                warn!("Teardown of {} failed: {}", info.vpn_id, destroy_err);
            }
            drop(guard);
            self.forget(&info.vpn_id, &shared).await;
            return Err(e);
        }
        drop(guard);

        if let Some(timeout) = self.stage_timeout {
            self.spawn_watchdog(info.vpn_id.clone(), shared, timeout);
        }
        Ok(())
    }

    /// Tear down and drop a tunnel. Unknown ids are a no-op.
    async fn teardown(&self, vpn_id: &str, system: bool) -> VpnResult<()> {
        let Some(shared) = self.driver(vpn_id).await else {
            debug!("No active tunnel {}", vpn_id);
            return Ok(());
        };
        let mut driver = shared.lock().await;
        if driver.is_system() != system {
            return Err(VpnError::NotFound(format!(
                "{} tunnel {} not found",
                if system { "system" } else { "app" },
                vpn_id
            )));
        }
        info!("Destroying tunnel {} on {}", vpn_id, driver.tunnel().if_name);
        let result = driver.destroy().await;
        drop(driver);
        self.forget(vpn_id, &shared).await;
        result
    }

    /// Remove `shared` from the tunnel map and the allocator, unless the id
    /// has since been taken by another tunnel
    async fn forget(&self, vpn_id: &str, shared: &SharedDriver) {
        Self::forget_in(&self.tunnels, &self.allocator, vpn_id, shared).await;
    }

    async fn forget_in(tunnels: &TunnelMap, allocator: &TunnelAllocator, vpn_id: &str, shared: &SharedDriver) {
        let mut map = tunnels.write().await;
        if map.get(vpn_id).is_some_and(|current| Arc::ptr_eq(current, shared)) {
            map.remove(vpn_id);
            if let Some(info) = allocator.find_by_vpn_id(vpn_id) {
                allocator.unregister(info.if_name_id);
            }
        }
    }

    /// Drop a previous attempt for `vpn_id` that has already ended
    async fn reap_stale(&self, vpn_id: &str) {
        let Some(shared) = self.driver(vpn_id).await else {
            return;
        };
        let connecting = self.allocator.find_by_vpn_id(vpn_id).is_some_and(|t| t.is_connecting);
        let mut driver = shared.lock().await;
        if connecting || driver.connect_state() == VpnConnectState::Connected {
            return;
        }
        debug!("Reaping finished tunnel {}", vpn_id);
        if let Err(e) = driver.destroy().await {
            warn!("Teardown of {} failed: {}", vpn_id, e);
        }
        drop(driver);
        self.forget(vpn_id, &shared).await;
    }

    fn spawn_watchdog(&self, vpn_id: String, shared: SharedDriver, timeout: Duration) {
        let tunnels = self.tunnels.clone();
        let allocator = Arc::clone(&self.allocator);
        let faults = Arc::clone(&self.ctx.faults);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let still_ours = tunnels
                .read()
                .await
                .get(&vpn_id)
                .is_some_and(|current| Arc::ptr_eq(current, &shared));
            let connecting = allocator.find_by_vpn_id(&vpn_id).is_some_and(|t| t.is_connecting);
            if !still_ours || !connecting {
                return;
            }
            let mut driver = shared.lock().await;
            warn!(
                "Tunnel {} stuck in {} for {:?}, tearing down",
                vpn_id,
                driver.state_name(),
                timeout
            );
            faults.report(FaultEvent::new(
                VpnEventType::Legacy,
                VpnEventOperation::StartSa,
                VpnEventErrorType::DaemonStage,
                format!("no stage progress on {} within {:?}", vpn_id, timeout),
            ));
            if let Err(e) = driver.destroy().await {
                warn!("Teardown of {} failed: {}", vpn_id, e);
            }
            drop(driver);
            Self::forget_in(&tunnels, &allocator, &vpn_id, &shared).await;
        });
    }

    /// System tunnel a daemon notification belongs to: the newest connecting
    /// tunnel of the matching daemon family, else the newest such tunnel
    fn stage_target(&self, openvpn: bool) -> Option<MultiVpnInfo> {
        let candidates: Vec<MultiVpnInfo> = self
            .allocator
            .tunnels()
            .into_iter()
            .filter(|t| match t.vpn_type.map(VpnType::family) {
                Some(VpnFamily::Openvpn) => openvpn,
                Some(VpnFamily::Ipsec) | Some(VpnFamily::L2tp) => !openvpn,
                _ => false,
            })
            .collect();
        candidates
            .iter()
            .rev()
            .find(|t| t.is_connecting)
            .or_else(|| candidates.last())
            .cloned()
    }

    /// Feed a raw daemon notification. Never fails; the outcome is a result code.
    pub async fn notify_connect_stage(&self, raw: &str, result: i32) -> i32 {
        let stage = match StageMessage::parse(raw) {
            Ok(stage) => stage,
            Err(e) => {
                warn!("Dropping malformed stage message: {}", e);
                return e.code();
            }
        };
        let openvpn = matches!(stage.kind, StageKind::Openvpn(_));
        let Some(target) = self.stage_target(openvpn) else {
            warn!("No tunnel waiting for stage {}", stage);
            return VpnError::NotConnected(format!("no tunnel for stage {}", stage)).code();
        };
        result_code(&self.deliver(&target.vpn_id, &stage, result).await)
    }

    /// Feed a stage to a specific tunnel
    pub async fn notify_tunnel_stage(&self, vpn_id: &str, raw: &str, result: i32) -> i32 {
        let outcome = match StageMessage::parse(raw) {
            Ok(stage) => self.deliver(vpn_id, &stage, result).await,
            Err(e) => Err(e),
        };
        result_code(&outcome)
    }

    async fn deliver(&self, vpn_id: &str, stage: &StageMessage, result: i32) -> VpnResult<()> {
        let shared = self
            .driver(vpn_id)
            .await
            .ok_or_else(|| VpnError::NotFound(format!("tunnel {} not found", vpn_id)))?;
        let mut driver = shared.lock().await;
        debug!("Stage {} ({}) for {}", stage, result, vpn_id);
        let outcome = driver.notify_connect_stage(stage, result).await;
        // a stage that tears the tunnel down leaves it idle and disconnected
        let ended = outcome.is_ok()
            && driver.connect_state() == VpnConnectState::Disconnected
            && !self.allocator.find_by_vpn_id(vpn_id).is_some_and(|t| t.is_connecting);
        drop(driver);
        match &outcome {
            Err(e) if !is_recoverable(e) => self.forget(vpn_id, &shared).await,
            Ok(()) if ended => {
                debug!("Tunnel {} ended on stage {}", vpn_id, stage);
                self.forget(vpn_id, &shared).await;
            }
            _ => {}
        }
        outcome
    }

    pub async fn add_sys_vpn_config(&self, mut config: SysVpnConfig) -> VpnResult<String> {
        if config.vpn_id.is_empty() {
            config.vpn_id = uuid::Uuid::new_v4().to_string();
        }
        self.store.save(&config).await?;
        Ok(config.vpn_id)
    }

    pub async fn delete_sys_vpn_config(&self, vpn_id: &str) -> VpnResult<()> {
        if self.driver(vpn_id).await.is_some() {
            warn!("Deleting config of active tunnel {}", vpn_id);
        }
        self.store.delete(vpn_id).await
    }

    pub async fn get_sys_vpn_config(&self, vpn_id: &str) -> VpnResult<SysVpnConfig> {
        self.store.load(vpn_id).await
    }

    pub async fn get_sys_vpn_config_list(&self, user_id: i32) -> VpnResult<Vec<SysVpnSummary>> {
        self.store.load_all(user_id).await
    }

    /// Profile of the newest connected system tunnel
    pub async fn get_connected_sys_vpn_config(&self) -> Option<SysVpnConfig> {
        let drivers: Vec<SharedDriver> = self.tunnels.read().await.values().cloned().collect();
        let mut newest: Option<(u32, SysVpnConfig)> = None;
        for shared in drivers {
            let driver = shared.lock().await;
            if let Some(config) = driver.connected_config() {
                let id = driver.tunnel().if_name_id;
                if newest.as_ref().map_or(true, |(best, _)| id > *best) {
                    newest = Some((id, config.clone()));
                }
            }
        }
        newest.map(|(_, config)| config)
    }

    /// Certificate path or config of the system tunnel currently in setup
    pub async fn get_sys_vpn_cert_uri(&self, cert_type: i32) -> VpnResult<String> {
        let target = self
            .stage_target(false)
            .or_else(|| self.stage_target(true))
            .ok_or_else(|| VpnError::NotConnected("no system tunnel is active".to_string()))?;
        let shared = self
            .driver(&target.vpn_id)
            .await
            .ok_or_else(|| VpnError::NotFound(format!("tunnel {} not found", target.vpn_id)))?;
        let driver = shared.lock().await;
        driver.cert_uri(cert_type)
    }

    pub fn register_listener(&self, listener: Arc<dyn VpnStateListener>) -> VpnResult<()> {
        self.listeners.register(listener)
    }

    pub fn unregister_listener(&self, listener: &Arc<dyn VpnStateListener>) -> VpnResult<()> {
        self.listeners.unregister(listener)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VpnStateEvent> {
        self.listeners.subscribe()
    }

    pub fn is_any_tunnel_connecting(&self) -> bool {
        self.allocator.is_any_tunnel_connecting()
    }

    /// Reinstall uid rules of every bound tunnel after the network stack restarted
    pub async fn on_net_sys_restart(&self) -> usize {
        let drivers: Vec<SharedDriver> = self.tunnels.read().await.values().cloned().collect();
        let mut resumed = 0;
        for shared in drivers {
            let mut driver = shared.lock().await;
            match driver.resume_uids().await {
                Ok(()) => resumed += 1,
                Err(VpnError::NotConnected(_)) => {}
                Err(e) => warn!("Failed to resume uid rules of {}: {}", driver.vpn_id(), e),
            }
        }
        info!("Network stack restarted, resumed {} tunnel(s)", resumed);
        resumed
    }

    /// Human readable state of every tunnel
    pub async fn dump(&self) -> String {
        let mut out = String::from("Net Vpn Info:\n");
        let _ = writeln!(out, "\ttime: {}", chrono::Utc::now().to_rfc3339());
        let drivers: Vec<SharedDriver> = self.tunnels.read().await.values().cloned().collect();
        if drivers.is_empty() {
            out.push_str("\tstate: disconnected\n");
        }
        let mut lines = Vec::new();
        for shared in drivers {
            let driver = shared.lock().await;
            let t = driver.tunnel();
            lines.push((
                t.if_name_id,
                format!(
                    "\t{} interface: {} type: {} package: {} state: {:?} ({})\n",
                    t.vpn_id,
                    t.if_name,
                    t.vpn_type.map_or_else(|| "extended".to_string(), |v| v.to_string()),
                    t.bundle_name,
                    driver.connect_state(),
                    driver.state_name()
                ),
            ));
        }
        lines.sort();
        for (_, line) in lines {
            out.push_str(&line);
        }
        out.push_str("\tend.\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CredentialCipher, MemoryKeyVault};
    use crate::error::SUCCESS;
    use crate::store::MemoryBackend;
    use crate::vpn::common::encode_base64;
    use crate::vpn::daemon::StageCommand;
    use crate::vpn::netstack::AppUidTable;
    use crate::vpn::telemetry::FaultLog;
    use crate::vpn::testutil::{FakeStack, RecordingDaemon};
    use crate::vpn::types::{INetAddr, VpnPayload};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    struct Fixture {
        orchestrator: VpnOrchestrator,
        stack: Arc<FakeStack>,
        daemon: Arc<RecordingDaemon>,
        faults: Arc<FaultLog>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = ServiceConfig::with_root(dir.path());
        std::fs::create_dir_all(&config.paths.vpn_dir).unwrap();
        let stack = Arc::new(FakeStack::default());
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
        Fixture {
            orchestrator: VpnOrchestrator::new(&config, store, deps),
            stack,
            daemon,
            faults,
            _dir: dir,
        }
    }

    fn ipsec_profile(id: &str) -> SysVpnConfig {
        let mut config = SysVpnConfig::new(id, "office", VpnType::Ikev2IpsecPsk);
        config.vpn_address = "203.0.113.10".into();
        if let VpnPayload::Ipsec(ipsec) = &mut config.payload {
            ipsec.swanctl_conf = encode_base64("connections {}\n");
            ipsec.strongswan_conf = encode_base64("charon {}\n");
            ipsec.ipsec_ca_cert_file_path = "/certs/ca.pem".into();
        }
        config
    }

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<bool>>,
    }

    impl VpnStateListener for Recorder {
        fn on_vpn_state_changed(&self, connected: bool) -> VpnResult<()> {
            self.seen.lock().unwrap().push(connected);
            Ok(())
        }

        fn on_multi_vpn_state_changed(&self, _connected: bool, _bundle_name: &str, _vpn_id: &str) -> VpnResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sys_vpn_happy_path() {
        let f = fixture();
        let recorder = Arc::new(Recorder::default());
        f.orchestrator.register_listener(recorder.clone()).unwrap();

        f.orchestrator.set_up_sys_vpn(ipsec_profile("vpn-a"), 1000).await.unwrap();
        assert!(f.orchestrator.is_any_tunnel_connecting());
        assert_eq!(f.orchestrator.notify_connect_stage("ipsec-started", 0).await, SUCCESS);
        assert_eq!(f.orchestrator.notify_connect_stage("swanctl-loaded", 0).await, SUCCESS);
        assert_eq!(f.orchestrator.get_sys_vpn_cert_uri(0).await.unwrap(), "/certs/ca.pem");
        assert_eq!(f.orchestrator.notify_connect_stage("connect", 0).await, SUCCESS);

        assert!(!f.orchestrator.is_any_tunnel_connecting());
        assert_eq!(*recorder.seen.lock().unwrap(), vec![true]);
        let connected = f.orchestrator.get_connected_sys_vpn_config().await.unwrap();
        assert_eq!(connected.vpn_id, "vpn-a");
        assert!(f.orchestrator.dump().await.contains("xfrm-vpn1"));

        f.orchestrator.destroy_sys_vpn("vpn-a").await.unwrap();
        assert!(f.orchestrator.allocator().is_empty());
        assert_eq!(f.stack.registered_suppliers(), 0);
        assert_eq!(*recorder.seen.lock().unwrap(), vec![true, false]);
        assert_eq!(f.daemon.count(&StageCommand::Stop), 1);
        assert!(f.orchestrator.get_connected_sys_vpn_config().await.is_none());
    }

    fn openvpn_profile(id: &str) -> SysVpnConfig {
        let mut config = SysVpnConfig::new(id, "home", VpnType::Openvpn);
        if let VpnPayload::Openvpn(ovpn) = &mut config.payload {
            ovpn.ovpn_config = encode_base64("client\nremote vpn.example.org 1194\n");
        }
        config
    }

    #[tokio::test]
    async fn test_disconnected_openvpn_releases_address() {
        let f = fixture();
        let o = &f.orchestrator;
        let address = r#"openvpn{"config":{"address":"10.8.0.6","netmask":"255.255.255.0","mtu":1500}}"#;

        o.set_up_sys_vpn(openvpn_profile("a"), 1000).await.unwrap();
        assert_eq!(o.notify_tunnel_stage("a", address, 0).await, SUCCESS);
        assert_eq!(o.notify_tunnel_stage("a", r#"openvpn{"updateState":{"state":5}}"#, 0).await, SUCCESS);
        assert!(o.allocator().is_empty());
        assert!(o.driver("a").await.is_none());

        o.set_up_sys_vpn(openvpn_profile("b"), 1000).await.unwrap();
        assert_eq!(o.notify_tunnel_stage("b", address, 0).await, SUCCESS);
        assert_eq!(o.allocator().len(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_listener_hears_nothing() {
        let f = fixture();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn VpnStateListener> = recorder.clone();
        f.orchestrator.register_listener(listener.clone()).unwrap();
        assert!(matches!(
            f.orchestrator.register_listener(listener.clone()),
            Err(VpnError::AlreadyExists(_))
        ));
        f.orchestrator.unregister_listener(&listener).unwrap();
        assert!(matches!(f.orchestrator.unregister_listener(&listener), Err(VpnError::NotFound(_))));

        let network = VpnConfig {
            addresses: vec![INetAddr::new("10.9.0.2", 24)],
            ..Default::default()
        };
        let id = f.orchestrator.set_up_vpn(network, "com.example.vpn", 20_010_001, 100).await.unwrap();
        f.orchestrator.destroy_vpn(&id).await.unwrap();
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_stage_drops_tunnel() {
        let f = fixture();
        f.orchestrator.set_up_sys_vpn(ipsec_profile("vpn-a"), 1000).await.unwrap();
        let code = f.orchestrator.notify_connect_stage("ipsec-started", 1).await;
        assert_eq!(code, VpnError::DaemonStartFailed(String::new()).code());
        assert!(f.orchestrator.allocator().is_empty());
        assert_eq!(f.faults.len(), 1);

        // same id can be started again
        f.orchestrator.set_up_sys_vpn(ipsec_profile("vpn-a"), 1000).await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_stage_is_rejected() {
        let f = fixture();
        f.orchestrator.set_up_sys_vpn(ipsec_profile("vpn-a"), 1000).await.unwrap();
        let code = f.orchestrator.notify_connect_stage("swanctl-loaded", 0).await;
        assert_eq!(code, VpnError::StageProtocolViolation(String::new()).code());
        assert_eq!(f.orchestrator.allocator().len(), 1);
        assert!(f.faults.is_empty());
    }

    #[tokio::test]
    async fn test_stage_without_tunnel() {
        let f = fixture();
        assert_eq!(
            f.orchestrator.notify_connect_stage("connect", 0).await,
            VpnError::NotConnected(String::new()).code()
        );
        assert_eq!(
            f.orchestrator.notify_connect_stage("  ", 0).await,
            VpnError::Parse(String::new()).code()
        );
    }

    #[tokio::test]
    async fn test_duplicate_sys_vpn_rejected() {
        let f = fixture();
        f.orchestrator.set_up_sys_vpn(ipsec_profile("vpn-a"), 1000).await.unwrap();
        assert!(matches!(
            f.orchestrator.set_up_sys_vpn(ipsec_profile("vpn-a"), 1000).await,
            Err(VpnError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_app_tunnel_lifecycle() {
        let f = fixture();
        let network = VpnConfig {
            addresses: vec![INetAddr::new("10.8.0.2", 24)],
            ..Default::default()
        };
        let id = f
            .orchestrator
            .set_up_vpn(network.clone(), "com.example.vpn", 20_010_001, 100)
            .await
            .unwrap();
        let prepared = f.orchestrator.prepare("com.example.vpn").await;
        assert!(prepared.is_exist_vpn);
        assert_eq!(prepared.package, "com.example.vpn");
        assert!(matches!(
            f.orchestrator.set_up_vpn(network, "com.example.vpn", 20_010_001, 100).await,
            Err(VpnError::AlreadyExists(_))
        ));

        assert_eq!(f.orchestrator.on_net_sys_restart().await, 1);
        assert!(matches!(f.orchestrator.destroy_sys_vpn(&id).await, Err(VpnError::NotFound(_))));
        f.orchestrator.destroy_vpn(&id).await.unwrap();
        f.orchestrator.destroy_vpn(&id).await.unwrap();
        assert!(!f.orchestrator.prepare("").await.is_exist_vpn);
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let f = fixture();
        let mut profile = ipsec_profile("");
        profile.user_id = 100;
        profile.password = "hunter2".into();
        let id = f.orchestrator.add_sys_vpn_config(profile).await.unwrap();
        assert!(!id.is_empty());

        let loaded = f.orchestrator.get_sys_vpn_config(&id).await.unwrap();
        assert_eq!(loaded.password, "hunter2");
        assert_eq!(f.orchestrator.get_sys_vpn_config_list(100).await.unwrap().len(), 1);
        assert!(f.orchestrator.get_sys_vpn_config_list(0).await.unwrap().is_empty());

        f.orchestrator.connect_stored(&id, 1000).await.unwrap();
        assert_eq!(f.orchestrator.allocator().len(), 1);

        f.orchestrator.delete_sys_vpn_config(&id).await.unwrap();
        assert!(matches!(
            f.orchestrator.get_sys_vpn_config(&id).await,
            Err(VpnError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_generates_missing_daemon_configs() {
        let f = fixture();
        let mut profile = SysVpnConfig::new("vpn-g", "generated", VpnType::Ikev2IpsecPsk);
        profile.vpn_address = "198.51.100.1".into();
        if let VpnPayload::Ipsec(ipsec) = &mut profile.payload {
            ipsec.ipsec_pre_shared_key = "psk".into();
        }
        f.orchestrator.set_up_sys_vpn(profile, 1000).await.unwrap();
        assert_eq!(f.daemon.commands(), vec![StageCommand::Restart]);
        let swanctl = std::fs::read_to_string(f.orchestrator.vpn_dir.join("swanctl.conf")).unwrap();
        assert!(swanctl.contains("198.51.100.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_tears_down_stuck_tunnel() {
        let mut f = fixture();
        f.orchestrator.stage_timeout = Some(Duration::from_secs(30));
        f.orchestrator.set_up_sys_vpn(ipsec_profile("vpn-a"), 1000).await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(f.orchestrator.allocator().is_empty());
        assert_eq!(f.faults.events()[0].error_type, VpnEventErrorType::DaemonStage);
    }
}
