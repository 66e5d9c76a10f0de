//! Error types for netvpn

use std::fmt;
use std::io;
use thiserror::Error;

/// Step of the network binding sequence that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStep {
    SupplierRegistration,
    SupplierInfoUpdate,
    LinkInfoUpdate,
    NetIdResolution,
    UidRule,
}

impl fmt::Display for BindStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BindStep::SupplierRegistration => "supplier registration",
            BindStep::SupplierInfoUpdate => "supplier info update",
            BindStep::LinkInfoUpdate => "link info update",
            BindStep::NetIdResolution => "net id resolution",
            BindStep::UidRule => "uid rule",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum VpnError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Missing or malformed configuration
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    /// Local tunnel address already held by another tunnel
    #[error("Address collision: {0} is already in use")]
    AddressCollision(String),
    /// Native daemon could not be started or reported a failed stage
    #[error("Daemon start failed: {0}")]
    DaemonStartFailed(String),
    /// Stage tag not valid for the current state
    #[error("Stage protocol violation: {0}")]
    StageProtocolViolation(String),
    /// Kernel network registration failed
    #[error("Network bind failed at {step}: {reason}")]
    NetworkBindFailed { step: BindStep, reason: String },
    /// Operation needs a bound tunnel
    #[error("Not connected: {0}")]
    NotConnected(String),
    /// Registry or store is full
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    /// Key management, encryption or decryption failure
    #[error("Crypto error: {0}")]
    Crypto(String),
    /// Persistence failure
    #[error("Store error: {0}")]
    Store(String),
    #[error("Parse error: {0}")]
    Parse(String),
    /// A state listener rejected a notification
    #[error("Listener error: {0}")]
    Listener(String),
}

/// Result code returned for successful operations
pub const SUCCESS: i32 = 0;

impl VpnError {
    /// Stable integer code for callers that only see result codes
    pub fn code(&self) -> i32 {
        match self {
            VpnError::Io(_) => 2_200_001,
            VpnError::InvalidConfig(_) => 2_200_002,
            VpnError::Parse(_) => 2_200_003,
            VpnError::Listener(_) => 2_200_004,
            VpnError::NotFound(_) => 2_200_005,
            VpnError::AlreadyExists(_) => 2_200_006,
            VpnError::CapacityExceeded(_) => 2_200_007,
            VpnError::AddressCollision(_) => 2_200_008,
            VpnError::DaemonStartFailed(_) => 2_200_009,
            VpnError::StageProtocolViolation(_) => 2_200_010,
            VpnError::NetworkBindFailed { .. } => 2_200_011,
            VpnError::NotConnected(_) => 2_200_012,
            VpnError::Crypto(_) => 2_200_013,
            VpnError::Store(_) => 2_200_014,
        }
    }

    pub(crate) fn bind(step: BindStep, reason: impl Into<String>) -> Self {
        VpnError::NetworkBindFailed { step, reason: reason.into() }
    }
}

impl From<serde_json::Error> for VpnError {
    fn from(error: serde_json::Error) -> Self {
        VpnError::Parse(error.to_string())
    }
}

pub type VpnResult<T> = Result<T, VpnError>;

/// Collapse a result into the integer code used at callback boundaries
pub fn result_code<T>(result: &VpnResult<T>) -> i32 {
    match result {
        Ok(_) => SUCCESS,
        Err(e) => e.code(),
    }
}
