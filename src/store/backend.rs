//! Persistence backends for VPN records

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::record::VpnRecord;
use crate::error::{VpnError, VpnResult};

/// Key-value persistence contract for records keyed by vpn id
#[async_trait]
pub trait RecordBackend: Send + Sync {
    async fn get(&self, vpn_id: &str) -> VpnResult<Option<VpnRecord>>;

    /// Insert or replace. Returns true when a record was replaced.
    async fn put(&self, record: VpnRecord) -> VpnResult<bool>;

    /// Insert or replace in one step, refusing a new record once
    /// `max_records` are stored. Returns true when a record was replaced.
    async fn upsert_bounded(&self, record: VpnRecord, max_records: usize) -> VpnResult<bool>;

    /// Returns true when a record was removed
    async fn remove(&self, vpn_id: &str) -> VpnResult<bool>;

    async fn all(&self) -> VpnResult<Vec<VpnRecord>>;

    async fn count(&self) -> VpnResult<usize>;
}

/// Records kept in memory only
#[derive(Default)]
pub struct MemoryBackend {
    rows: Mutex<BTreeMap<String, VpnRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordBackend for MemoryBackend {
    async fn get(&self, vpn_id: &str) -> VpnResult<Option<VpnRecord>> {
        Ok(self.rows.lock().await.get(vpn_id).cloned())
    }

    async fn put(&self, record: VpnRecord) -> VpnResult<bool> {
        let mut rows = self.rows.lock().await;
        Ok(rows.insert(record.vpn_id.clone(), record).is_some())
    }

    async fn upsert_bounded(&self, record: VpnRecord, max_records: usize) -> VpnResult<bool> {
        let mut rows = self.rows.lock().await;
        check_capacity(&rows, &record.vpn_id, max_records)?;
        Ok(rows.insert(record.vpn_id.clone(), record).is_some())
    }

    async fn remove(&self, vpn_id: &str) -> VpnResult<bool> {
        Ok(self.rows.lock().await.remove(vpn_id).is_some())
    }

    async fn all(&self) -> VpnResult<Vec<VpnRecord>> {
        Ok(self.rows.lock().await.values().cloned().collect())
    }

    async fn count(&self) -> VpnResult<usize> {
        Ok(self.rows.lock().await.len())
    }
}

fn check_capacity(rows: &BTreeMap<String, VpnRecord>, vpn_id: &str, max_records: usize) -> VpnResult<()> {
    if !rows.contains_key(vpn_id) && rows.len() >= max_records {
        return Err(VpnError::CapacityExceeded(format!(
            "at most {} VPN configs can be stored",
            max_records
        )));
    }
    Ok(())
}

const TABLE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct TableFile {
    version: u32,
    records: Vec<VpnRecord>,
}

/// Records persisted to one JSON file.
///
/// The table is read once, lazily, on first access. Every mutation rewrites the
/// file through a temporary sibling and a rename, so a crash never leaves a
/// half-written table behind.
pub struct JsonFileBackend {
    path: PathBuf,
    rows: Mutex<Option<BTreeMap<String, VpnRecord>>>,
}

impl JsonFileBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            rows: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_table(&self) -> VpnResult<BTreeMap<String, VpnRecord>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            info!("Creating VPN record table at {:?}", self.path);
            let empty = BTreeMap::new();
            self.write_table(&empty).await?;
            return Ok(empty);
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| VpnError::Store(format!("Failed to read {:?}: {}", self.path, e)))?;
        let table: TableFile = serde_json::from_str(&content)
            .map_err(|e| VpnError::Store(format!("Failed to parse {:?}: {}", self.path, e)))?;
        if table.version != TABLE_VERSION {
            return Err(VpnError::Store(format!("Unsupported table version {}", table.version)));
        }

        debug!("Loaded {} VPN records from {:?}", table.records.len(), self.path);
        Ok(table.records.into_iter().map(|r| (r.vpn_id.clone(), r)).collect())
    }

    async fn write_table(&self, rows: &BTreeMap<String, VpnRecord>) -> VpnResult<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| VpnError::Store(format!("Failed to create {:?}: {}", parent, e)))?;
        }

        let table = TableFile {
            version: TABLE_VERSION,
            records: rows.values().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&table)?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| VpnError::Store(format!("Failed to write {:?}: {}", tmp, e)))?;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| VpnError::Store(format!("Failed to set permissions on {:?}: {}", tmp, e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| VpnError::Store(format!("Failed to replace {:?}: {}", self.path, e)))?;
        Ok(())
    }

    async fn with_rows<T>(
        &self,
        op: impl FnOnce(&mut BTreeMap<String, VpnRecord>) -> (T, bool),
    ) -> VpnResult<T> {
        let mut guard = self.rows.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_table().await?);
        }
        let Some(rows) = guard.as_mut() else {
            return Err(VpnError::Store("record table unavailable".to_string()));
        };

        let mut staged = rows.clone();
        let (out, dirty) = op(&mut staged);
        if dirty {
            self.write_table(&staged).await?;
            *rows = staged;
        }
        Ok(out)
    }
}

#[async_trait]
impl RecordBackend for JsonFileBackend {
    async fn get(&self, vpn_id: &str) -> VpnResult<Option<VpnRecord>> {
        self.with_rows(|rows| (rows.get(vpn_id).cloned(), false)).await
    }

    async fn put(&self, record: VpnRecord) -> VpnResult<bool> {
        self.with_rows(|rows| (rows.insert(record.vpn_id.clone(), record).is_some(), true))
            .await
    }

    async fn upsert_bounded(&self, record: VpnRecord, max_records: usize) -> VpnResult<bool> {
        self.with_rows(|rows| match check_capacity(rows, &record.vpn_id, max_records) {
            Ok(()) => (Ok(rows.insert(record.vpn_id.clone(), record).is_some()), true),
            Err(e) => (Err(e), false),
        })
        .await?
    }

    async fn remove(&self, vpn_id: &str) -> VpnResult<bool> {
        self.with_rows(|rows| {
            let removed = rows.remove(vpn_id).is_some();
            (removed, removed)
        })
        .await
    }

    async fn all(&self) -> VpnResult<Vec<VpnRecord>> {
        self.with_rows(|rows| (rows.values().cloned().collect(), false)).await
    }

    async fn count(&self) -> VpnResult<usize> {
        self.with_rows(|rows| (rows.len(), false)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str) -> VpnRecord {
        VpnRecord { vpn_id: id.to_string(), vpn_name: format!("name-{}", id), vpn_type: 9, ..Default::default() }
    }

    #[tokio::test]
    async fn test_file_created_lazily() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db").join("vpn_data.json");
        let backend = JsonFileBackend::new(&path);
        assert!(!path.exists());

        assert_eq!(backend.count().await.unwrap(), 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_file_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vpn_data.json");
        {
            let backend = JsonFileBackend::new(&path);
            assert!(!backend.put(record("a")).await.unwrap());
            assert!(backend.put(record("a")).await.unwrap());
            backend.put(record("b")).await.unwrap();
            assert!(backend.remove("b").await.unwrap());
            assert!(!backend.remove("b").await.unwrap());
        }

        let reopened = JsonFileBackend::new(&path);
        let all = reopened.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].vpn_name, "name-a");
        assert!(reopened.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_store_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vpn_data.json");
        std::fs::write(&path, "{ not json").unwrap();
        let backend = JsonFileBackend::new(&path);
        assert!(matches!(backend.all().await, Err(VpnError::Store(_))));
    }

    #[tokio::test]
    async fn test_upsert_bounded() {
        let dir = TempDir::new().unwrap();
        let file = JsonFileBackend::new(dir.path().join("vpn_data.json"));
        let memory = MemoryBackend::new();
        let backends: [&dyn RecordBackend; 2] = [&file, &memory];
        for backend in backends {
            assert!(!backend.upsert_bounded(record("a"), 1).await.unwrap());
            assert!(matches!(
                backend.upsert_bounded(record("b"), 1).await,
                Err(VpnError::CapacityExceeded(_))
            ));
            // replacing at capacity is fine
            assert!(backend.upsert_bounded(record("a"), 1).await.unwrap());
            assert_eq!(backend.count().await.unwrap(), 1);
        }
        assert!(JsonFileBackend::new(dir.path().join("vpn_data.json")).get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_backend() {
        let backend = MemoryBackend::new();
        backend.put(record("x")).await.unwrap();
        assert_eq!(backend.count().await.unwrap(), 1);
        assert_eq!(backend.get("x").await.unwrap().unwrap().vpn_type, 9);
    }
}
