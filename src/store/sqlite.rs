//! SQLite record backend
//!
//! Records are stored as JSON text keyed by id, with a few columns lifted
//! out for ordering and ad hoc inspection.

use async_trait::async_trait;
use chrono::SecondsFormat;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{RecordBackend, StoreError, StoreResult};
use crate::record::DeploymentRecord;

pub struct SqliteBackend {
    options: SqliteConnectOptions,
    max_connections: u32,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteBackend {
    /// Backend for a `sqlite:` URL, e.g. `sqlite://deployments.db` or `sqlite::memory:`
    pub fn new(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        // Every in-memory connection is a separate database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        Ok(Self {
            options,
            max_connections,
            pool: RwLock::new(None),
        })
    }

    pub fn from_path(path: &Path) -> Self {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        Self {
            options,
            max_connections: 5,
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> StoreResult<SqlitePool> {
        self.pool.read().await.clone().ok_or(StoreError::NotOpen)
    }

    fn decode(raw: &str) -> StoreResult<DeploymentRecord> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[async_trait]
impl RecordBackend for SqliteBackend {
    async fn open(&self) -> StoreResult<()> {
        let mut slot = self.pool.write().await;
        if slot.is_some() {
            return Ok(());
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .connect_with(self.options.clone())
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(filename = %self.options.get_filename().display(), "Opened deployment database");
        *slot = Some(pool);
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            debug!("Closed deployment database");
        }
        Ok(())
    }

    async fn put(&self, record: &DeploymentRecord) -> StoreResult<()> {
        let pool = self.pool().await?;
        let json = serde_json::to_string(record)?;
        sqlx::query(
            r#"
            INSERT INTO deployments (id, kind, requester, status, created_at, updated_at, record)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                requester = excluded.requester,
                status = excluded.status,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                record = excluded.record
            "#,
        )
        .bind(&record.id)
        .bind(record.kind.as_str())
        .bind(record.requester.to_string())
        .bind(format!("{:?}", record.status))
        .bind(record.created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(record.updated_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(json)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<DeploymentRecord>> {
        let pool = self.pool().await?;
        let row = sqlx::query("SELECT record FROM deployments WHERE id = ?1")
            .bind(id)
            .fetch_optional(&pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Self::decode(&row.try_get::<String, _>("record")?)?)),
            None => Ok(None),
        }
    }

    async fn list_all(&self) -> StoreResult<Vec<DeploymentRecord>> {
        let pool = self.pool().await?;
        let rows = sqlx::query("SELECT record FROM deployments ORDER BY created_at DESC")
            .fetch_all(&pool)
            .await?;
        rows.iter()
            .map(|row| Self::decode(&row.try_get::<String, _>("record")?))
            .collect()
    }

    async fn remove(&self, id: &str) -> StoreResult<bool> {
        let pool = self.pool().await?;
        let result = sqlx::query("DELETE FROM deployments WHERE id = ?1")
            .bind(id)
            .execute(&pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DeploymentConfig, DeploymentRequest};
    use crate::steps::StepId;
    use alloy::primitives::{Address, B256};
    use chrono::Utc;
    use tempfile::TempDir;

    fn record() -> DeploymentRecord {
        let request = DeploymentRequest {
            requester: Address::repeat_byte(1),
            config: DeploymentConfig::Adapter {
                source_chain: 1,
                token: Address::repeat_byte(2),
                destination_chains: vec![56],
                name: "Token".to_string(),
                symbol: "TKN".to_string(),
            },
            security: None,
        };
        let mut record = DeploymentRecord::new("0xfeed".to_string(), request);
        record.record_step(
            &StepId::deploy_source_adapter(),
            crate::record::CompletedStep {
                tx_hash: Some(B256::repeat_byte(3)),
                chain_id: 1,
                contract_address: Some(Address::repeat_byte(4)),
                block_number: 12,
                timestamp: Utc::now(),
            },
        );
        record
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deployments.db");

        let backend = SqliteBackend::from_path(&path);
        backend.open().await.unwrap();
        let r = record();
        backend.put(&r).await.unwrap();
        backend.close().await.unwrap();

        let reopened = SqliteBackend::from_path(&path);
        reopened.open().await.unwrap();
        assert_eq!(reopened.get(&r.id).await.unwrap(), Some(r.clone()));
        assert_eq!(reopened.list_all().await.unwrap().len(), 1);
        assert!(reopened.remove(&r.id).await.unwrap());
        assert_eq!(reopened.get(&r.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_memory_url_upserts() {
        let backend = SqliteBackend::new("sqlite::memory:").unwrap();
        backend.open().await.unwrap();
        let mut r = record();
        backend.put(&r).await.unwrap();
        r.status = crate::record::DeploymentState::Completed;
        backend.put(&r).await.unwrap();
        let all = backend.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, crate::record::DeploymentState::Completed);
    }

    #[tokio::test]
    async fn test_sqlite_requires_open() {
        let backend = SqliteBackend::new("sqlite::memory:").unwrap();
        assert!(matches!(backend.get("x").await, Err(StoreError::NotOpen)));
    }
}
