//! In-memory record backend

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::{RecordBackend, StoreError, StoreResult};
use crate::record::DeploymentRecord;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<String, DeploymentRecord>>,
    open: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::NotOpen)
        }
    }
}

#[async_trait]
impl RecordBackend for MemoryBackend {
    async fn open(&self) -> StoreResult<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn put(&self, record: &DeploymentRecord) -> StoreResult<()> {
        self.ensure_open()?;
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<DeploymentRecord>> {
        self.ensure_open()?;
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list_all(&self) -> StoreResult<Vec<DeploymentRecord>> {
        self.ensure_open()?;
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn remove(&self, id: &str) -> StoreResult<bool> {
        self.ensure_open()?;
        Ok(self.records.write().await.remove(id).is_some())
    }
}
