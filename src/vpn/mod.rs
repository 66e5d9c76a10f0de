//! VPN tunnel lifecycle
//!
//! This module drives app supplied and system VPN tunnels (OpenVPN, IKEv2 /
//! IPsec, L2TP over IPsec) from setup through the daemon stage handshake to a
//! bound network interface.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │          VpnOrchestrator            │
//! └──────────────┬──────────────────────┘
//!                │ create_driver
//!    ┌───────────┼───────────┬──────────┬──────────┐
//!    ▼           ▼           ▼          ▼          ▼
//! ┌──────┐   ┌───────┐   ┌──────┐   ┌──────┐   ┌─────────┐
//! │ OVPN │   │ IPsec │   │ L2TP │   │ App  │   │ Virtual │  <- TunnelDriver
//! └──┬───┘   └───┬───┘   └──┬───┘   └──┬───┘   └────┬────┘
//!    └───────────┴──────────┴──────────┴────────────┘
//!        TunnelAllocator · DaemonBridge · NetworkBinder
//! ```
//!
//! Each driver implements [`TunnelDriver`]. Interface names, local addresses
//! and shared daemon references come from the one [`TunnelAllocator`]; kernel
//! registration goes through a per-tunnel [`NetworkBinder`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use libnetvpn::config::ServiceConfig;
//! use libnetvpn::vpn::{Collaborators, VpnOrchestrator};
//!
//! # async fn run(deps: Collaborators) -> libnetvpn::error::VpnResult<()> {
//! let orchestrator = VpnOrchestrator::open(&ServiceConfig::default(), deps)?;
//! orchestrator.connect_stored("office", 1000).await?;
//! orchestrator.notify_connect_stage("ipsec-started", 0).await;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod binder;
pub mod common;
pub mod daemon;
pub mod driver;
pub mod events;
pub mod extended;
pub mod ipsec;
pub mod l2tp;
pub mod manager;
pub mod netstack;
pub mod openvpn;
pub mod stage;
pub mod telemetry;
pub mod template;
pub mod types;
pub mod virtual_vpn;

#[cfg(test)]
pub(crate) mod testutil;

pub use allocator::{MultiVpnInfo, SharedDaemon, SharedDaemonGuard, TunnelAllocator};
pub use binder::{BindState, NetworkBinder};
pub use daemon::{DaemonBridge, ProcessDaemonBridge, StageCommand};
pub use driver::{create_driver, DriverContext, StateObserver, TunnelDriver};
pub use events::{ListenerHub, VpnStateEvent, VpnStateListener};
pub use manager::{Collaborators, PrepareInfo, VpnOrchestrator};
pub use netstack::{AppUidResolver, AppUidTable, NetworkStack, UidRange};
pub use stage::{StageKind, StageMessage};
pub use telemetry::{FaultEvent, FaultLog, FaultReporter};
pub use types::{SysVpnConfig, SysVpnSummary, VpnConfig, VpnConnectState, VpnPayload, VpnType};
