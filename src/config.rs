//! Service configuration for netvpn

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::{VpnError, VpnResult};

/// Main service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// File system locations
    #[serde(default)]
    pub paths: ServicePaths,
    /// Resource limits
    #[serde(default)]
    pub limits: ServiceLimits,
    /// Seconds a tunnel may wait on one daemon stage before it is torn down.
    /// Zero disables the watchdog.
    #[serde(default)]
    pub stage_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePaths {
    /// Directory holding generated daemon configuration files
    #[serde(default = "default_vpn_dir")]
    pub vpn_dir: PathBuf,
    /// Record store file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Directory holding per-user credential keys
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceLimits {
    /// Concurrently registered tunnels
    #[serde(default = "default_max_tunnels")]
    pub max_tunnels: usize,
    /// Persisted configuration records
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    /// Registered state listeners
    #[serde(default = "default_max_listeners")]
    pub max_listeners: usize,
}

fn default_vpn_dir() -> PathBuf {
    PathBuf::from("/data/service/el1/public/vpn")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/data/service/el1/public/netmanager/vpn_data.json")
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("/data/service/el1/public/netmanager/vpn_keys")
}

fn default_max_tunnels() -> usize {
    20
}

fn default_max_records() -> usize {
    128
}

fn default_max_listeners() -> usize {
    128
}

impl Default for ServicePaths {
    fn default() -> Self {
        Self {
            vpn_dir: default_vpn_dir(),
            database_path: default_database_path(),
            key_dir: default_key_dir(),
        }
    }
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            max_tunnels: default_max_tunnels(),
            max_records: default_max_records(),
            max_listeners: default_max_listeners(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            paths: ServicePaths::default(),
            limits: ServiceLimits::default(),
            stage_timeout_secs: 0,
        }
    }
}

impl ServiceConfig {
    /// Configuration rooted in a single directory, used by tools and tests
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            paths: ServicePaths {
                vpn_dir: root.join("vpn"),
                database_path: root.join("vpn_data.json"),
                key_dir: root.join("keys"),
            },
            ..Self::default()
        }
    }

    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> VpnResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| VpnError::InvalidConfig(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| VpnError::InvalidConfig(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> VpnResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| VpnError::InvalidConfig(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| VpnError::InvalidConfig(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Ensure all directories exist
    pub fn ensure_directories(&self) -> VpnResult<()> {
        let db_dir = self.paths.database_path.parent().map(Path::to_path_buf);
        for dir in [Some(self.paths.vpn_dir.clone()), Some(self.paths.key_dir.clone()), db_dir]
            .into_iter()
            .flatten()
        {
            std::fs::create_dir_all(&dir)
                .map_err(|e| VpnError::InvalidConfig(format!("Failed to create directory {:?}: {}", dir, e)))?;
        }
        Ok(())
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        match self.stage_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
