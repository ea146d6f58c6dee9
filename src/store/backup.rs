//! Backup sinks for record snapshots

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{StoreError, StoreResult};
use crate::snapshot::Snapshot;

const LATEST_FILE: &str = "latest.json";

/// Receives a full snapshot after every store write
#[async_trait]
pub trait BackupSink: Send + Sync {
    async fn write(&self, snapshot: &Snapshot) -> StoreResult<()>;
}

/// Writes `latest.json` in a directory, replacing it atomically
#[derive(Debug, Clone)]
pub struct FileBackup {
    dir: PathBuf,
}

impl FileBackup {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_FILE)
    }

    /// Read the most recent backup, if any
    pub async fn read_latest(&self) -> StoreResult<Option<Snapshot>> {
        match tokio::fs::read(self.latest_path()).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

async fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> StoreResult<()> {
    tokio::fs::create_dir_all(dir).await?;
    let tmp = dir.join(format!(
        ".{}.{}.tmp",
        LATEST_FILE,
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, target).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(StoreError::Io(e));
    }
    Ok(())
}

#[async_trait]
impl BackupSink for FileBackup {
    async fn write(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let target = self.latest_path();
        write_atomic(&self.dir, &target, &bytes).await?;
        debug!(path = %target.display(), count = snapshot.count, "Backup written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordStore;
    use crate::record::{DeploymentConfig, DeploymentRecord, DeploymentRequest};
    use alloy::primitives::Address;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn record() -> DeploymentRecord {
        DeploymentRecord::new(
            "0x01".to_string(),
            DeploymentRequest {
                requester: Address::repeat_byte(1),
                config: DeploymentConfig::NewCollection {
                    chains: vec![1, 10],
                    name: "A".to_string(),
                    symbol: "A".to_string(),
                },
                security: None,
            },
        )
    }

    #[tokio::test]
    async fn test_file_backup_writes_latest() {
        let dir = TempDir::new().unwrap();
        let sink = FileBackup::new(dir.path().join("backups"));
        assert!(sink.read_latest().await.unwrap().is_none());

        sink.write(&Snapshot::new(vec![record()])).await.unwrap();
        let latest = sink.read_latest().await.unwrap().unwrap();
        assert_eq!(latest.count, 1);
        assert_eq!(latest.deployments[0].id, "0x01");
    }

    #[tokio::test]
    async fn test_store_put_triggers_backup() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(FileBackup::new(dir.path()));
        let store = RecordStore::in_memory().await.unwrap().with_backup(sink.clone());
        store.put(&record()).await.unwrap();

        let mut found = None;
        for _ in 0..50 {
            if let Some(snapshot) = sink.read_latest().await.unwrap() {
                found = Some(snapshot);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(found.unwrap().count, 1);
    }

    struct FailingSink;

    #[async_trait]
    impl BackupSink for FailingSink {
        async fn write(&self, _: &Snapshot) -> StoreResult<()> {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            )))
        }
    }

    #[tokio::test]
    async fn test_backup_failure_does_not_fail_put() {
        let store = RecordStore::in_memory()
            .await
            .unwrap()
            .with_backup(Arc::new(FailingSink));
        assert!(store.put(&record()).await.is_ok());
        assert!(store.get("0x01").await.unwrap().is_some());
    }
}
