//! Encrypted store of system VPN profiles

mod backend;
mod record;

pub use backend::{JsonFileBackend, MemoryBackend, RecordBackend};
pub use record::VpnRecord;

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::crypto::{CredentialCipher, FileKeyVault};
use crate::error::{VpnError, VpnResult};
use crate::vpn::types::{SysVpnConfig, SysVpnSummary};

/// Default record capacity
pub const MAX_RECORDS: usize = 128;

/// Persists profiles, sealing secret fields with [`CredentialCipher`]
pub struct ConfigStore {
    backend: Arc<dyn RecordBackend>,
    cipher: CredentialCipher,
    max_records: usize,
}

impl ConfigStore {
    pub fn new(backend: Arc<dyn RecordBackend>, cipher: CredentialCipher) -> Self {
        Self { backend, cipher, max_records: MAX_RECORDS }
    }

    /// Store over the record file and key directory named in `config`
    pub fn open(config: &ServiceConfig) -> VpnResult<Self> {
        config.ensure_directories()?;
        let backend = Arc::new(JsonFileBackend::new(&config.paths.database_path));
        let cipher = CredentialCipher::new(Arc::new(FileKeyVault::new(&config.paths.key_dir)));
        debug!("Opened VPN record store {:?}", config.paths.database_path);
        Ok(Self::new(backend, cipher).with_capacity(config.limits.max_records))
    }

    pub fn with_capacity(mut self, max_records: usize) -> Self {
        self.max_records = max_records;
        self
    }

    /// Insert or update by vpn id
    pub async fn save(&self, config: &SysVpnConfig) -> VpnResult<()> {
        config.validate()?;
        let mut record = VpnRecord::from(config);
        for field in record.secret_fields_mut() {
            *field = self.cipher.seal_field(config.user_id, field)?;
        }

        let replaced = match self.backend.upsert_bounded(record, self.max_records).await {
            Ok(replaced) => replaced,
            Err(e) => {
                if matches!(e, VpnError::CapacityExceeded(_)) {
                    warn!("VPN record store is full ({} records)", self.max_records);
                }
                return Err(e);
            }
        };
        if replaced {
            info!("Updated VPN config {}", config.vpn_id);
        } else {
            info!("Inserted VPN config {}", config.vpn_id);
        }
        Ok(())
    }

    /// Fetch and decrypt a profile. Any field that fails to decrypt fails the load.
    pub async fn load(&self, vpn_id: &str) -> VpnResult<SysVpnConfig> {
        let mut record = self
            .backend
            .get(vpn_id)
            .await?
            .ok_or_else(|| VpnError::NotFound(format!("VPN config {} not found", vpn_id)))?;

        let user_id = record.user_id;
        for field in record.secret_fields_mut() {
            *field = self.cipher.open_field(user_id, field).map_err(|e| {
                warn!("Failed to decrypt VPN config {}: {}", vpn_id, e);
                e
            })?;
        }
        debug!("Loaded VPN config {}", vpn_id);
        SysVpnConfig::try_from(&record)
    }

    /// Id, name and type of every profile owned by `user_id`
    pub async fn load_all(&self, user_id: i32) -> VpnResult<Vec<SysVpnSummary>> {
        let mut summaries = Vec::new();
        for record in self.backend.all().await? {
            if record.user_id != user_id {
                continue;
            }
            match record.summary() {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!("Skipping unreadable VPN record: {}", e),
            }
        }
        Ok(summaries)
    }

    pub async fn delete(&self, vpn_id: &str) -> VpnResult<()> {
        if !self.backend.remove(vpn_id).await? {
            return Err(VpnError::NotFound(format!("VPN config {} not found", vpn_id)));
        }
        info!("Deleted VPN config {}", vpn_id);
        Ok(())
    }

    /// Raw row, secrets still sealed
    pub async fn raw(&self, vpn_id: &str) -> VpnResult<Option<VpnRecord>> {
        self.backend.get(vpn_id).await
    }
}
