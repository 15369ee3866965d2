/// Durable store tier: the authoritative, queryable record of truth.
///
/// All committed writes land here via the persistence worker; reads fall
/// back here on cache misses. Version checks are enforced at this layer
/// so concurrent writers serialize correctly no matter which path
/// (caller or worker) applies them.
use crate::error::{StratumError, StratumResult};
use crate::query::{Cursor, Filter, Page};
use crate::types::{MemoryRecord, MemoryType, RecordKey};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Durable store statistics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub records: usize,
    pub live_records: usize,
    pub writes: u64,
    pub reads: u64,
}

/// The durable tier seam.
///
/// Like [`CacheTier`](crate::cache::CacheTier), this is a swappable
/// strategy; the in-memory backend below is the default and doubles as
/// the snapshot source for disk persistence.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Apply a record at `expected_version` (0 = create).
    ///
    /// Returns the committed version on success. Fails with
    /// [`StratumError::Conflict`] when the stored version differs from
    /// `expected_version`.
    async fn put(&self, record: MemoryRecord, expected_version: u64) -> StratumResult<u64>;

    /// Fetch a record by key, including soft-deleted records.
    async fn get(&self, key: &RecordKey) -> StratumResult<Option<MemoryRecord>>;

    /// Query records in a tenant, newest filters applied in-store.
    ///
    /// Soft-deleted records are excluded. Results are ordered by record
    /// id so cursor pagination is stable across interleaved writes.
    async fn query(
        &self,
        tenant: &str,
        record_type: Option<MemoryType>,
        filters: &[Filter],
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> StratumResult<Page>;

    /// Reachability probe.
    async fn ping(&self) -> StratumResult<()>;

    /// Statistics snapshot.
    fn stats(&self) -> StoreStats;
}

/// In-memory durable store backed by a concurrent map.
///
/// "Durable" here means authoritative within the process; actual disk
/// durability comes from the snapshot layer in
/// [`persistence`](crate::persistence).
pub struct MemoryStore {
    records: DashMap<RecordKey, MemoryRecord>,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        }
    }

    /// Version-checked insert. Runs under the map's entry lock so the
    /// check-and-bump is atomic per key.
    fn apply(&self, mut record: MemoryRecord, expected_version: u64) -> StratumResult<u64> {
        let key = record.key();
        match self.records.entry(key) {
            Entry::Occupied(mut occupied) => {
                let found = occupied.get().version;
                if found != expected_version {
                    return Err(StratumError::Conflict {
                        expected: expected_version,
                        found,
                    });
                }
                record.version = found + 1;
                let version = record.version;
                occupied.insert(record);
                Ok(version)
            }
            Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Err(StratumError::Conflict {
                        expected: expected_version,
                        found: 0,
                    });
                }
                record.version = 1;
                vacant.insert(record);
                Ok(1)
            }
        }
    }

    /// All records, including soft-deleted, for snapshotting.
    pub fn export(&self) -> Vec<MemoryRecord> {
        self.records
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Load records wholesale, replacing any existing state. Used when
    /// restoring from a snapshot at startup.
    pub fn import(&self, records: Vec<MemoryRecord>) {
        self.records.clear();
        for record in records {
            self.records.insert(record.key(), record);
        }
    }

    /// Total record count, soft-deleted included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn put(&self, record: MemoryRecord, expected_version: u64) -> StratumResult<u64> {
        let version = self.apply(record, expected_version)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(version)
    }

    async fn get(&self, key: &RecordKey) -> StratumResult<Option<MemoryRecord>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    async fn query(
        &self,
        tenant: &str,
        record_type: Option<MemoryType>,
        filters: &[Filter],
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> StratumResult<Page> {
        if limit == 0 {
            return Ok(Page::empty());
        }
        self.reads.fetch_add(1, Ordering::Relaxed);

        let mut matched: Vec<MemoryRecord> = self
            .records
            .iter()
            .filter(|entry| {
                let record = entry.value();
                record.tenant == tenant
                    && !record.is_deleted()
                    && record_type.is_none_or(|t| record.record_type == t)
                    && filters.iter().all(|f| f.matches(record))
            })
            .map(|entry| entry.value().clone())
            .collect();

        matched.sort_by(|a, b| a.id.cmp(&b.id));

        let start = match cursor {
            Some(cursor) => matched
                .iter()
                .position(|r| r.id.as_str() > cursor.last_id.as_str())
                .unwrap_or(matched.len()),
            None => 0,
        };

        let page: Vec<MemoryRecord> = matched.into_iter().skip(start).take(limit + 1).collect();
        let has_more = page.len() > limit;
        let records: Vec<MemoryRecord> = page.into_iter().take(limit).collect();
        let next_cursor = if has_more {
            records.last().map(|r| Cursor::after(&r.id))
        } else {
            None
        };

        Ok(Page {
            records,
            next_cursor,
        })
    }

    async fn ping(&self) -> StratumResult<()> {
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        let live_records = self
            .records
            .iter()
            .filter(|entry| !entry.value().is_deleted())
            .count();
        StoreStats {
            records: self.records.len(),
            live_records,
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;

    fn record(id: &str, tenant: &str) -> MemoryRecord {
        MemoryRecord::new(
            id,
            MemoryType::Chat,
            1,
            json!({"text": format!("hello from {id}")}),
            HashMap::new(),
            "alice",
            tenant,
        )
    }

    #[tokio::test]
    async fn test_create_starts_at_version_one() {
        let store = MemoryStore::new();
        let version = store.put(record("m1", "acme"), 0).await.unwrap();
        assert_eq!(version, 1);

        let fetched = store
            .get(&RecordKey::new("acme", "m1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn test_update_requires_current_version() {
        let store = MemoryStore::new();
        store.put(record("m1", "acme"), 0).await.unwrap();

        let version = store.put(record("m1", "acme"), 1).await.unwrap();
        assert_eq!(version, 2);

        // Re-applying at the old version conflicts.
        let err = store.put(record("m1", "acme"), 1).await.unwrap_err();
        assert!(matches!(
            err,
            StratumError::Conflict {
                expected: 1,
                found: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_create_against_existing_conflicts() {
        let store = MemoryStore::new();
        store.put(record("m1", "acme"), 0).await.unwrap();

        let err = store.put(record("m1", "acme"), 0).await.unwrap_err();
        assert!(matches!(
            err,
            StratumError::Conflict {
                expected: 0,
                found: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_update_missing_record_conflicts_with_found_zero() {
        let store = MemoryStore::new();
        let err = store.put(record("ghost", "acme"), 3).await.unwrap_err();
        assert!(matches!(err, StratumError::Conflict { found: 0, .. }));
    }

    #[tokio::test]
    async fn test_concurrent_creates_admit_exactly_one() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(
                async move { store.put(record("m1", "acme"), 0).await },
            ));
        }

        let mut won = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                won += 1;
            }
        }
        assert_eq!(won, 1);
    }

    #[tokio::test]
    async fn test_query_scopes_to_tenant_and_type() {
        let store = MemoryStore::new();
        store.put(record("m1", "acme"), 0).await.unwrap();
        store.put(record("m2", "globex"), 0).await.unwrap();

        let mut insight = record("m3", "acme");
        insight.record_type = MemoryType::Insight;
        store.put(insight, 0).await.unwrap();

        let page = store
            .query("acme", Some(MemoryType::Chat), &[], None, 10)
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id, "m1");

        let page = store.query("acme", None, &[], None, 10).await.unwrap();
        assert_eq!(page.records.len(), 2);
    }

    #[tokio::test]
    async fn test_query_excludes_soft_deleted() {
        let store = MemoryStore::new();
        store.put(record("m1", "acme"), 0).await.unwrap();

        let mut tombstone = record("m1", "acme");
        tombstone.mark_deleted(Utc::now());
        store.put(tombstone, 1).await.unwrap();

        let page = store.query("acme", None, &[], None, 10).await.unwrap();
        assert!(page.records.is_empty());

        // Direct get still sees the tombstone.
        let fetched = store
            .get(&RecordKey::new("acme", "m1"))
            .await
            .unwrap()
            .unwrap();
        assert!(fetched.is_deleted());
    }

    #[tokio::test]
    async fn test_query_applies_filters() {
        let store = MemoryStore::new();
        store.put(record("m1", "acme"), 0).await.unwrap();
        store.put(record("m2", "acme"), 0).await.unwrap();

        let page = store
            .query(
                "acme",
                None,
                &[Filter::payload_contains("text", "m2")],
                None,
                10,
            )
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id, "m2");
    }

    #[tokio::test]
    async fn test_cursor_pagination_is_stable() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.put(record(&format!("m{i}"), "acme"), 0).await.unwrap();
        }

        let first = store.query("acme", None, &[], None, 2).await.unwrap();
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.records[0].id, "m0");
        let cursor = first.next_cursor.expect("more pages");

        // A write landing between pages must not shift the window.
        store.put(record("a0", "acme"), 0).await.unwrap();

        let second = store
            .query("acme", None, &[], Some(&cursor), 2)
            .await
            .unwrap();
        assert_eq!(second.records[0].id, "m2");
        assert_eq!(second.records[1].id, "m3");

        let cursor = second.next_cursor.expect("more pages");
        let third = store
            .query("acme", None, &[], Some(&cursor), 2)
            .await
            .unwrap();
        assert_eq!(third.records.len(), 1);
        assert_eq!(third.records[0].id, "m4");
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let store = MemoryStore::new();
        store.put(record("m1", "acme"), 0).await.unwrap();
        store.put(record("m2", "globex"), 0).await.unwrap();

        let exported = store.export();
        let restored = MemoryStore::new();
        restored.import(exported);

        assert_eq!(restored.len(), 2);
        let fetched = restored
            .get(&RecordKey::new("acme", "m1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.version, 1);
    }
}
