//! Durable storage of deployment records
//!
//! - `memory` - in-process backend for tests and dry runs
//! - `sqlite` - sqlx/SQLite backend
//! - `backup` - snapshot sinks fed after every write
//!
//! [`RecordStore`] wraps a backend with the retention cap and the
//! best-effort backup that follow every `put`.

pub mod backup;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::record::DeploymentRecord;
use crate::snapshot::Snapshot;

pub use backup::{BackupSink, FileBackup};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Records kept after each write, newest by `created_at` first
pub const DEFAULT_MAX_RECORDS: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store is not open")]
    NotOpen,
    #[error("failed to encode record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Key-value persistence of records by id
#[async_trait]
pub trait RecordBackend: Send + Sync {
    async fn open(&self) -> StoreResult<()>;

    async fn close(&self) -> StoreResult<()>;

    /// Insert or replace by id
    async fn put(&self, record: &DeploymentRecord) -> StoreResult<()>;

    async fn get(&self, id: &str) -> StoreResult<Option<DeploymentRecord>>;

    async fn list_all(&self) -> StoreResult<Vec<DeploymentRecord>>;

    /// Returns whether a record was removed
    async fn remove(&self, id: &str) -> StoreResult<bool>;
}

/// Backend plus retention and backup
#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn RecordBackend>,
    backup: Option<Arc<dyn BackupSink>>,
    max_records: usize,
    write_lock: Arc<Mutex<()>>,
    /// Held across list and write so snapshots land in write order
    backup_lock: Arc<Mutex<()>>,
}

impl RecordStore {
    pub fn new(backend: Arc<dyn RecordBackend>) -> Self {
        Self {
            backend,
            backup: None,
            max_records: DEFAULT_MAX_RECORDS,
            write_lock: Arc::new(Mutex::new(())),
            backup_lock: Arc::new(Mutex::new(())),
        }
    }

    /// In-memory store, opened
    pub async fn in_memory() -> StoreResult<Self> {
        let store = Self::new(Arc::new(MemoryBackend::new()));
        store.open().await?;
        Ok(store)
    }

    pub fn with_backup(mut self, sink: Arc<dyn BackupSink>) -> Self {
        self.backup = Some(sink);
        self
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.max(1);
        self
    }

    pub async fn open(&self) -> StoreResult<()> {
        self.backend.open().await
    }

    pub async fn close(&self) -> StoreResult<()> {
        self.backend.close().await
    }

    /// Write a record, prune to the retention cap, and schedule a backup.
    pub async fn put(&self, record: &DeploymentRecord) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        self.backend.put(record).await?;
        self.prune().await?;
        self.schedule_backup();
        Ok(())
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<DeploymentRecord>> {
        self.backend.get(id).await
    }

    /// All records, newest first
    pub async fn list_all(&self) -> StoreResult<Vec<DeploymentRecord>> {
        let mut records = self.backend.list_all().await?;
        sort_newest_first(&mut records);
        Ok(records)
    }

    pub async fn remove(&self, id: &str) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let removed = self.backend.remove(id).await?;
        if removed {
            self.schedule_backup();
        }
        Ok(removed)
    }

    async fn prune(&self) -> StoreResult<()> {
        let mut records = self.backend.list_all().await?;
        if records.len() <= self.max_records {
            return Ok(());
        }
        sort_newest_first(&mut records);
        for stale in &records[self.max_records..] {
            debug!(id = %stale.id, created_at = %stale.created_at, "Pruning old deployment record");
            self.backend.remove(&stale.id).await?;
        }
        Ok(())
    }

    fn schedule_backup(&self) {
        let Some(sink) = self.backup.clone() else {
            return;
        };
        let backend = self.backend.clone();
        let backup_lock = self.backup_lock.clone();
        tokio::spawn(async move {
            // Whichever task writes last also listed last
            let _guard = backup_lock.lock().await;
            let records = match backend.list_all().await {
                Ok(mut records) => {
                    sort_newest_first(&mut records);
                    records
                }
                Err(e) => {
                    warn!(error = %e, "Backup skipped, could not list records");
                    return;
                }
            };
            if let Err(e) = sink.write(&Snapshot::new(records)).await {
                warn!(error = %e, "Backup write failed");
            }
        });
    }
}

fn sort_newest_first(records: &mut [DeploymentRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}
