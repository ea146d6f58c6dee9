//! Export and import of all deployment records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::hash::deployment_id;
use crate::record::{DeploymentRecord, RECORD_VERSION};
use crate::store::{RecordStore, StoreResult};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Portable dump of the record store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub export_date: DateTime<Utc>,
    pub count: usize,
    pub deployments: Vec<DeploymentRecord>,
}

impl Snapshot {
    pub fn new(deployments: Vec<DeploymentRecord>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            export_date: Utc::now(),
            count: deployments.len(),
            deployments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportError {
    pub id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<ImportError>,
}

/// Snapshot of every record, newest first
pub async fn export_all(store: &RecordStore) -> StoreResult<Snapshot> {
    let records = store.list_all().await?;
    info!(count = records.len(), "Exporting deployment records");
    Ok(Snapshot::new(records))
}

fn check_importable(record: &DeploymentRecord) -> Result<(), String> {
    if record.version > RECORD_VERSION {
        return Err(format!(
            "record version {} is newer than supported version {}",
            record.version, RECORD_VERSION
        ));
    }
    let expected = deployment_id(&record.request).map_err(|e| e.to_string())?;
    if expected != record.id {
        return Err(format!("id does not match request (expected {})", expected));
    }
    Ok(())
}

/// Import records, never touching ids that already exist
pub async fn import_all(store: &RecordStore, snapshot: &Snapshot) -> StoreResult<ImportReport> {
    let mut report = ImportReport::default();

    if snapshot.version > SNAPSHOT_VERSION {
        report.errors.push(ImportError {
            id: String::new(),
            message: format!(
                "snapshot version {} is newer than supported version {}",
                snapshot.version, SNAPSHOT_VERSION
            ),
        });
        return Ok(report);
    }

    for record in &snapshot.deployments {
        if let Err(message) = check_importable(record) {
            warn!(id = %record.id, error = %message, "Skipping invalid record on import");
            report.errors.push(ImportError {
                id: record.id.clone(),
                message,
            });
            continue;
        }
        if store.get(&record.id).await?.is_some() {
            report.skipped += 1;
            continue;
        }
        store.put(record).await?;
        report.imported += 1;
    }

    info!(
        imported = report.imported,
        skipped = report.skipped,
        errors = report.errors.len(),
        "Import finished"
    );
    Ok(report)
}
