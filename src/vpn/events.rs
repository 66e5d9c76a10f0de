//! Connect state fan-out
//!
//! Registered [`VpnStateListener`]s are called in registration order; a
//! listener that fails is logged and skipped. Every transition is also sent on
//! a broadcast channel for async subscribers.

use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::allocator::MultiVpnInfo;
use super::driver::StateObserver;
use super::types::VpnConnectState;
use crate::error::{VpnError, VpnResult};

/// Default listener capacity
pub const MAX_LISTENERS: usize = 128;

/// Connect state change of one tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnStateEvent {
    pub vpn_id: String,
    pub bundle_name: String,
    pub if_name: String,
    pub connected: bool,
}

pub trait VpnStateListener: Send + Sync {
    fn on_vpn_state_changed(&self, connected: bool) -> VpnResult<()>;

    fn on_multi_vpn_state_changed(&self, connected: bool, bundle_name: &str, vpn_id: &str) -> VpnResult<()>;
}

fn same_listener(a: &Arc<dyn VpnStateListener>, b: &Arc<dyn VpnStateListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Registered listeners plus the event channel
pub struct ListenerHub {
    listeners: RwLock<Vec<Arc<dyn VpnStateListener>>>,
    max_listeners: usize,
    event_tx: broadcast::Sender<VpnStateEvent>,
}

impl Default for ListenerHub {
    fn default() -> Self {
        Self::new(MAX_LISTENERS)
    }
}

impl ListenerHub {
    pub fn new(max_listeners: usize) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            listeners: RwLock::new(Vec::new()),
            max_listeners,
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VpnStateEvent> {
        self.event_tx.subscribe()
    }

    pub fn register(&self, listener: Arc<dyn VpnStateListener>) -> VpnResult<()> {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            warn!("State listener already registered");
            return Err(VpnError::AlreadyExists("state listener is already registered".to_string()));
        }
        if listeners.len() >= self.max_listeners {
            warn!("State listener limit reached ({})", self.max_listeners);
            return Err(VpnError::CapacityExceeded(format!(
                "at most {} state listeners can be registered",
                self.max_listeners
            )));
        }
        listeners.push(listener);
        debug!("Registered state listener, {} total", listeners.len());
        Ok(())
    }

    pub fn unregister(&self, listener: &Arc<dyn VpnStateListener>) -> VpnResult<()> {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let index = listeners
            .iter()
            .position(|l| same_listener(l, listener))
            .ok_or_else(|| VpnError::NotFound("state listener is not registered".to_string()))?;
        listeners.remove(index);
        debug!("Unregistered state listener, {} left", listeners.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notify every listener, returning how many of them failed
    pub fn publish(&self, event: VpnStateEvent) -> usize {
        info!(
            "Tunnel {} ({}) {}",
            event.vpn_id,
            event.if_name,
            if event.connected { "connected" } else { "disconnected" }
        );
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut failures = 0;
        for listener in &listeners {
            if let Err(e) = listener.on_vpn_state_changed(event.connected) {
                warn!("State listener failed: {}", e);
                failures += 1;
                continue;
            }
            if let Err(e) = listener.on_multi_vpn_state_changed(event.connected, &event.bundle_name, &event.vpn_id) {
                warn!("Multi-tunnel state listener failed: {}", e);
                failures += 1;
            }
        }
        // no receivers is fine
        let _ = self.event_tx.send(event);
        failures
    }
}

impl StateObserver for ListenerHub {
    fn on_connect_state(&self, tunnel: &MultiVpnInfo, state: VpnConnectState) {
        self.publish(VpnStateEvent {
            vpn_id: tunnel.vpn_id.clone(),
            bundle_name: tunnel.bundle_name.clone(),
            if_name: tunnel.if_name.clone(),
            connected: state == VpnConnectState::Connected,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(bool, String)>>,
        fail: bool,
    }

    impl VpnStateListener for Recorder {
        fn on_vpn_state_changed(&self, _connected: bool) -> VpnResult<()> {
            if self.fail {
                return Err(VpnError::Listener("gone".into()));
            }
            Ok(())
        }

        fn on_multi_vpn_state_changed(&self, connected: bool, _bundle_name: &str, vpn_id: &str) -> VpnResult<()> {
            self.seen.lock().unwrap().push((connected, vpn_id.to_string()));
            Ok(())
        }
    }

    fn event(connected: bool) -> VpnStateEvent {
        VpnStateEvent {
            vpn_id: "vpn-1".into(),
            bundle_name: String::new(),
            if_name: "xfrm-vpn1".into(),
            connected,
        }
    }

    #[test]
    fn test_register_rejects_duplicates_and_overflow() {
        let hub = ListenerHub::new(2);
        let a: Arc<dyn VpnStateListener> = Arc::new(Recorder::default());
        let b: Arc<dyn VpnStateListener> = Arc::new(Recorder::default());
        let c: Arc<dyn VpnStateListener> = Arc::new(Recorder::default());

        hub.register(a.clone()).unwrap();
        assert!(matches!(hub.register(a.clone()), Err(VpnError::AlreadyExists(_))));
        hub.register(b.clone()).unwrap();
        assert!(matches!(hub.register(c.clone()), Err(VpnError::CapacityExceeded(_))));

        hub.unregister(&a).unwrap();
        assert!(matches!(hub.unregister(&a), Err(VpnError::NotFound(_))));
        hub.register(c).unwrap();
        assert_eq!(hub.len(), 2);
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let hub = ListenerHub::default();
        let broken = Arc::new(Recorder { fail: true, ..Default::default() });
        let healthy = Arc::new(Recorder::default());
        hub.register(broken.clone()).unwrap();
        hub.register(healthy.clone()).unwrap();

        assert_eq!(hub.publish(event(true)), 1);
        assert_eq!(*healthy.seen.lock().unwrap(), vec![(true, "vpn-1".to_string())]);
        assert!(broken.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let hub = ListenerHub::default();
        let mut rx = hub.subscribe();
        hub.publish(event(true));
        hub.publish(event(false));
        assert!(rx.recv().await.unwrap().connected);
        assert!(!rx.recv().await.unwrap().connected);
    }
}
