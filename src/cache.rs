/// Cache tier: bounded, TTL-aware hot store keyed by record id.
///
/// The in-memory backend keeps entries in a DashMap for lock-free
/// concurrent access, with a separate recency deque for LRU eviction.
/// Inserts serialize on the recency lock so the entry count never
/// exceeds the configured capacity; reads on other keys stay lock-free.
///
/// Expiry is lazy on access plus a proactive sweep driven by the mediator;
/// `get_stale` exists solely for the durable-outage degradation path,
/// where an expired entry beats no answer at all.
use crate::error::{StratumError, StratumResult};
use crate::types::{MemoryRecord, RecordKey};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

/// Cache statistics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Calculate hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// The cache tier seam.
///
/// Backends are swappable strategies selected at mediator construction;
/// the in-memory backend below is the default. Methods are fallible so
/// remote backends can surface `CacheUnavailable` and let the mediator
/// degrade to durable-only operation.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Get a live (unexpired) entry. Expired entries count as misses and
    /// are removed on the way out.
    async fn get(&self, key: &RecordKey) -> StratumResult<Option<MemoryRecord>>;

    /// Get an entry ignoring expiry. Used only when the durable store is
    /// unreachable and a stale answer is better than none.
    async fn get_stale(&self, key: &RecordKey) -> StratumResult<Option<MemoryRecord>>;

    /// Insert or replace an entry with the given time-to-live
    /// (None = no expiry).
    async fn put(
        &self,
        key: RecordKey,
        record: MemoryRecord,
        ttl: Option<Duration>,
    ) -> StratumResult<()>;

    /// Remove an entry.
    async fn invalidate(&self, key: &RecordKey) -> StratumResult<()>;

    /// Proactively remove expired entries, returning how many went.
    async fn sweep_expired(&self) -> StratumResult<usize>;

    /// Reachability probe.
    async fn ping(&self) -> StratumResult<()>;

    /// Current entry count.
    fn len(&self) -> usize;

    /// Whether the cache is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Statistics snapshot.
    fn stats(&self) -> CacheStats;
}

struct CacheEntry {
    record: MemoryRecord,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// In-memory LRU cache with per-entry TTL, bounded by entry count.
pub struct InMemoryCache {
    capacity: usize,
    entries: DashMap<RecordKey, CacheEntry>,
    /// Recency order (front = most recent)
    recency: Mutex<VecDeque<RecordKey>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl InMemoryCache {
    /// Create a cache bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: DashMap::with_capacity(capacity),
            recency: Mutex::new(VecDeque::with_capacity(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live lookup. Expired entries read as misses but are left in place:
    /// the sweeper reclaims them, and until then `peek_stale` can still
    /// serve them on the degraded read path.
    fn lookup(&self, key: &RecordKey) -> Option<MemoryRecord> {
        let now = Instant::now();

        match self.entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => {
                let record = entry.record.clone();
                drop(entry);
                self.touch(key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(record)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn peek_stale(&self, key: &RecordKey) -> Option<MemoryRecord> {
        self.entries.get(key).map(|entry| entry.record.clone())
    }

    fn insert(&self, key: RecordKey, record: MemoryRecord, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let entry = CacheEntry { record, expires_at };

        // The recency lock is held across the capacity check and the map
        // update, so concurrent inserts cannot race past the budget.
        let Ok(mut order) = self.recency.lock() else {
            self.entries.insert(key, entry);
            return;
        };

        // Replacing an existing key never needs an eviction.
        let replacing = self.entries.contains_key(&key);
        if !replacing && self.entries.len() >= self.capacity {
            if let Some(victim) = order.pop_back() {
                if self.entries.remove(&victim).is_some() {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.entries.insert(key.clone(), entry);
        order.retain(|k| *k != key);
        order.push_front(key);
    }

    fn remove(&self, key: &RecordKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            if let Ok(mut order) = self.recency.lock() {
                order.retain(|k| k != key);
            }
        }
        removed
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<RecordKey> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = 0;
        for key in expired {
            if self.remove(&key) {
                swept += 1;
            }
        }
        self.expirations.fetch_add(swept as u64, Ordering::Relaxed);
        swept
    }

    /// Move a key to the most-recent position.
    fn touch(&self, key: &RecordKey) {
        if let Ok(mut order) = self.recency.lock() {
            order.retain(|k| k != key);
            order.push_front(key.clone());
        }
    }

    fn snapshot_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            size: self.entries.len(),
            capacity: self.capacity,
        }
    }
}

#[async_trait]
impl CacheTier for InMemoryCache {
    async fn get(&self, key: &RecordKey) -> StratumResult<Option<MemoryRecord>> {
        Ok(self.lookup(key))
    }

    async fn get_stale(&self, key: &RecordKey) -> StratumResult<Option<MemoryRecord>> {
        Ok(self.peek_stale(key))
    }

    async fn put(
        &self,
        key: RecordKey,
        record: MemoryRecord,
        ttl: Option<Duration>,
    ) -> StratumResult<()> {
        self.insert(key, record, ttl);
        Ok(())
    }

    async fn invalidate(&self, key: &RecordKey) -> StratumResult<()> {
        self.remove(key);
        Ok(())
    }

    async fn sweep_expired(&self) -> StratumResult<usize> {
        Ok(self.sweep())
    }

    async fn ping(&self) -> StratumResult<()> {
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn stats(&self) -> CacheStats {
        self.snapshot_stats()
    }
}

/// Per-key deduplication of concurrent in-flight durable fetches.
///
/// The first caller for a key becomes the leader and runs the fetch;
/// callers arriving while the fetch is in flight await the same cell and
/// share the leader's result. `None` (not found) is shared just like a
/// record, so a miss storm produces a single durable read either way.
#[derive(Default)]
pub struct SingleFlight {
    flights: DashMap<RecordKey, Arc<OnceCell<Option<MemoryRecord>>>>,
}

impl SingleFlight {
    /// Create an empty flight table.
    pub fn new() -> Self {
        Self {
            flights: DashMap::new(),
        }
    }

    /// Run `load` for `key`, collapsing concurrent callers onto one fetch.
    ///
    /// If the leader's load fails, its waiters observe the error and the
    /// next caller starts a fresh flight.
    pub async fn fetch<F, Fut>(
        &self,
        key: &RecordKey,
        load: F,
    ) -> StratumResult<Option<MemoryRecord>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StratumResult<Option<MemoryRecord>>>,
    {
        let cell = self
            .flights
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell.get_or_try_init(load).await.map(|v| v.clone());

        // Retire this flight so later misses fetch fresh data. Only the
        // cell we actually flew on is removed; a racing replacement stays.
        self.flights.remove_if(key, |_, v| Arc::ptr_eq(v, &cell));

        result
    }

    /// Number of in-flight fetches (diagnostic).
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemoryType;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn record(id: &str) -> MemoryRecord {
        MemoryRecord::new(
            id,
            MemoryType::Chat,
            1,
            json!({"text": id}),
            HashMap::new(),
            "alice",
            "acme",
        )
    }

    fn key(id: &str) -> RecordKey {
        RecordKey::new("acme", id)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let cache = InMemoryCache::new(8);
        cache.put(key("m1"), record("m1"), None).await.unwrap();

        let hit = cache.get(&key("m1")).await.unwrap().unwrap();
        assert_eq!(hit.id, "m1");
        assert!(cache.get(&key("m2")).await.unwrap().is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_expired_entries_miss_but_linger_until_swept() {
        let cache = InMemoryCache::new(8);
        cache
            .put(key("m1"), record("m1"), Some(Duration::from_millis(20)))
            .await
            .unwrap();

        assert!(cache.get(&key("m1")).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Misses, but stays resident for the stale path until the sweep.
        assert!(cache.get(&key("m1")).await.unwrap().is_none());
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.sweep_expired().await.unwrap(), 1);
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test]
    async fn test_get_stale_ignores_expiry() {
        let cache = InMemoryCache::new(8);
        cache
            .put(key("m1"), record("m1"), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Live read misses, stale read still answers.
        let stale = cache.get_stale(&key("m1")).await.unwrap();
        assert!(stale.is_some());
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = InMemoryCache::new(2);
        cache.put(key("m1"), record("m1"), None).await.unwrap();
        cache.put(key("m2"), record("m2"), None).await.unwrap();

        // Touch m1 so m2 is the LRU victim.
        cache.get(&key("m1")).await.unwrap();
        cache.put(key("m3"), record("m3"), None).await.unwrap();

        assert!(cache.get(&key("m1")).await.unwrap().is_some());
        assert!(cache.get(&key("m2")).await.unwrap().is_none());
        assert!(cache.get(&key("m3")).await.unwrap().is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_replace_does_not_evict() {
        let cache = InMemoryCache::new(2);
        cache.put(key("m1"), record("m1"), None).await.unwrap();
        cache.put(key("m2"), record("m2"), None).await.unwrap();
        cache.put(key("m1"), record("m1"), None).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = InMemoryCache::new(8);
        cache.put(key("m1"), record("m1"), None).await.unwrap();
        cache.invalidate(&key("m1")).await.unwrap();

        assert!(cache.get(&key("m1")).await.unwrap().is_none());
        assert!(cache.get_stale(&key("m1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let cache = InMemoryCache::new(8);
        cache
            .put(key("m1"), record("m1"), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        cache
            .put(key("m2"), record("m2"), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        cache.put(key("m3"), record("m3"), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let swept = cache.sweep_expired().await.unwrap();

        assert_eq!(swept, 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("m3")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_single_flight_collapses_concurrent_fetches() {
        let flights = Arc::new(SingleFlight::new());
        let loads = Arc::new(AtomicUsize::new(0));
        let k = key("m1");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let flights = Arc::clone(&flights);
            let loads = Arc::clone(&loads);
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .fetch(&k, || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Some(record("m1")))
                    })
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.unwrap().id, "m1");
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_single_flight_shares_not_found() {
        let flights = SingleFlight::new();
        let result = flights.fetch(&key("ghost"), || async { Ok(None) }).await;
        assert!(result.unwrap().is_none());
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_single_flight_propagates_errors_and_clears() {
        let flights = SingleFlight::new();
        let result = flights
            .fetch(&key("m1"), || async {
                Err(StratumError::DurableUnavailable("down".into()))
            })
            .await;
        assert!(matches!(result, Err(StratumError::DurableUnavailable(_))));
        assert_eq!(flights.in_flight(), 0);

        // Next caller starts fresh and can succeed.
        let result = flights
            .fetch(&key("m1"), || async { Ok(Some(record("m1"))) })
            .await
            .unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn test_concurrent_inserts_never_exceed_capacity() {
        let cache = InMemoryCache::new(8);
        std::thread::scope(|scope| {
            for w in 0..4 {
                let cache = &cache;
                scope.spawn(move || {
                    for i in 0..64 {
                        let id = format!("w{w}-m{i}");
                        cache.insert(key(&id), record(&id), None);
                        assert!(cache.entries.len() <= cache.capacity());
                    }
                });
            }
        });
        assert_eq!(cache.entries.len(), 8);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn cache_never_exceeds_capacity(
                capacity in 1usize..16,
                ids in prop::collection::vec("[a-f][0-9]{1,2}", 1..128),
            ) {
                let cache = InMemoryCache::new(capacity);
                for id in &ids {
                    cache.insert(key(id), record(id), None);
                    prop_assert!(cache.entries.len() <= capacity);
                }
            }
        }
    }
}
