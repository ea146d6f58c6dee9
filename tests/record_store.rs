//! Integration tests for the durable record store
//!
//! Uses a SQLite file in a temp directory; no chain access.

use alloy::primitives::Address;
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tempfile::TempDir;

use bridge_deployer::config::StoreConfig;
use bridge_deployer::deployer::open_store;
use bridge_deployer::snapshot::{export_all, import_all};
use bridge_deployer::store::FileBackup;
use bridge_deployer::{deployment_id, DeploymentConfig, DeploymentRecord, DeploymentRequest};

fn request(n: u8) -> DeploymentRequest {
    DeploymentRequest {
        requester: Address::repeat_byte(n),
        config: DeploymentConfig::NewCollection {
            chains: vec![1, 56],
            name: format!("Token {}", n),
            symbol: "TKN".to_string(),
        },
        security: None,
    }
}

fn record(n: u8, age_secs: i64) -> DeploymentRecord {
    let request = request(n);
    let mut record = DeploymentRecord::new(deployment_id(&request).unwrap(), request);
    record.created_at = Utc::now() - ChronoDuration::seconds(age_secs);
    record
}

fn store_config(dir: &TempDir, max_records: usize) -> StoreConfig {
    StoreConfig {
        database_url: format!("sqlite://{}", dir.path().join("deployments.db").display()),
        backup_dir: Some(dir.path().join("backups")),
        max_records,
    }
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let config = store_config(&dir, 50);

    let first = record(1, 0);
    {
        let store = open_store(&config).await.unwrap();
        store.put(&first).await.unwrap();
        store.close().await.unwrap();
    }

    let store = open_store(&config).await.unwrap();
    let loaded = store.get(&first.id).await.unwrap().unwrap();
    assert_eq!(loaded, first);
}

#[tokio::test]
async fn test_retention_keeps_newest() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&store_config(&dir, 2)).await.unwrap();

    let oldest = record(1, 300);
    let middle = record(2, 200);
    let newest = record(3, 100);
    for r in [&oldest, &middle, &newest] {
        store.put(r).await.unwrap();
    }

    let ids: Vec<String> = store
        .list_all()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![newest.id.clone(), middle.id.clone()]);
    assert!(store.get(&oldest.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_backup_follows_writes() {
    let dir = TempDir::new().unwrap();
    let config = store_config(&dir, 50);
    let store = open_store(&config).await.unwrap();
    store.put(&record(1, 0)).await.unwrap();

    let backup = FileBackup::new(config.backup_dir.clone().unwrap());
    let mut latest = None;
    for _ in 0..50 {
        latest = backup.read_latest().await.unwrap();
        if latest.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let latest = latest.expect("backup was never written");
    assert_eq!(latest.count, 1);
}

#[tokio::test]
async fn test_snapshot_moves_between_databases() {
    let source_dir = TempDir::new().unwrap();
    let target_dir = TempDir::new().unwrap();
    let source = open_store(&store_config(&source_dir, 50)).await.unwrap();
    let target = open_store(&store_config(&target_dir, 50)).await.unwrap();

    source.put(&record(1, 10)).await.unwrap();
    source.put(&record(2, 0)).await.unwrap();

    // Existing ids in the target are left exactly as they were
    let mut local = record(1, 10);
    local.status = bridge_deployer::record::DeploymentState::Failed;
    target.put(&local).await.unwrap();

    let snapshot = export_all(&source).await.unwrap();
    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["count"], 2);
    assert!(json["exportDate"].is_string());

    let report = import_all(&target, &snapshot).await.unwrap();
    assert_eq!(report.imported, 1);
    assert_eq!(report.skipped, 1);
    assert!(report.errors.is_empty());
    assert_eq!(target.get(&local.id).await.unwrap().unwrap(), local);
    assert_eq!(target.list_all().await.unwrap().len(), 2);
}
