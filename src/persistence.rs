/// Snapshot persistence for the durable store.
///
/// The mediator writes one snapshot at shutdown and restores it at the
/// next `start`; nothing here runs on the hot path. A snapshot is a
/// single JSON document (format version, capture time, every record
/// with tombstones kept) so it stays inspectable with `jq`.
use crate::error::{StratumError, StratumResult};
use crate::store::MemoryStore;
use crate::types::MemoryRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// On-disk snapshot envelope.
#[derive(Debug, Serialize, Deserialize)]
struct StoreSnapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    records: Vec<MemoryRecord>,
}

const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot the store to `path`.
///
/// The document lands at a `.tmp` sibling first and is renamed into
/// place, so a crash mid-write leaves the previous snapshot intact
/// rather than a truncated one.
pub async fn save(store: &MemoryStore, path: &Path) -> StratumResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StratumError::Storage(format!("snapshot directory: {e}")))?;
    }

    let snapshot = StoreSnapshot {
        version: SNAPSHOT_VERSION,
        saved_at: Utc::now(),
        records: store.export(),
    };

    let bytes = serde_json::to_vec(&snapshot)
        .map_err(|e| StratumError::Storage(format!("snapshot encode: {e}")))?;

    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, &bytes)
        .await
        .map_err(|e| StratumError::Storage(format!("snapshot write: {e}")))?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| StratumError::Storage(format!("snapshot rename: {e}")))?;

    Ok(())
}

/// Rebuild a store from the snapshot at `path`.
///
/// Fails with `StratumError::Storage` when the file is missing,
/// unparseable, or carries a format version this build does not speak.
pub async fn load(path: &Path) -> StratumResult<MemoryStore> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| StratumError::Storage(format!("snapshot read: {e}")))?;

    let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)
        .map_err(|e| StratumError::Storage(format!("snapshot decode: {e}")))?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(StratumError::Storage(format!(
            "snapshot format v{} is not supported (this build speaks v{})",
            snapshot.version, SNAPSHOT_VERSION
        )));
    }

    let store = MemoryStore::new();
    store.import(snapshot.records);
    Ok(store)
}

/// Whether a snapshot has been written at `path`.
pub async fn exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}
