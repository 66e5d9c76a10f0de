//! netvpn - VPN tunnel lifecycle library
//!
//! Async VPN subsystem providing:
//! - System VPN state machines (OpenVPN, IKEv2 / IPsec, L2TP over IPsec)
//! - App supplied and virtual tunnels
//! - Multi-tunnel interface and address allocation
//! - Network stack binding with per-uid routing
//! - Encrypted profile storage
//!
//! Native daemons and the kernel network stack sit behind traits so the
//! tunnel logic can run against real tools or test doubles.

pub mod config;
pub mod crypto;
pub mod error;
pub mod store;
pub mod vpn;

// Re-export commonly used types
pub use config::ServiceConfig;
pub use crypto::{CredentialCipher, EncryptedData, FileKeyVault, KeyVault, MemoryKeyVault};
pub use error::{VpnError, VpnResult};
pub use store::{ConfigStore, JsonFileBackend, MemoryBackend, RecordBackend, VpnRecord};
pub use vpn::{
    Collaborators, SysVpnConfig, TunnelAllocator, TunnelDriver, VpnConfig, VpnConnectState,
    VpnOrchestrator, VpnType,
};
