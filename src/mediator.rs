/// The memory mediator: one façade over both tiers.
///
/// Callers talk to `MemoryMediator` only. Every operation runs the same
/// pipeline: schema validation, role-based authorization, then the tier
/// dance (write-through cache plus asynchronous durable commit on the
/// write path, cache-aside with single-flight durable fallback on the
/// read path).
///
/// The mediator is cheaply cloneable; clones share every tier through
/// `Arc`, so one instance can serve many tasks.
use crate::access::AccessControl;
use crate::cache::{CacheStats, CacheTier, InMemoryCache, SingleFlight};
use crate::error::{StratumError, StratumResult};
use crate::persistence;
use crate::query::{Cursor, Filter, Page};
use crate::queue::{CommitJob, CommitQueue, DeadLetterStore};
use crate::schema::{Schema, SchemaRegistry};
use crate::store::{DurableStore, MemoryStore, StoreStats};
use crate::types::{MemoryRecord, MemoryType, Operation, Principal, RecordKey};
use crate::worker::{self, RetryPolicy, WorkerHandle};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How one memory type relates to the cache tier.
#[derive(Debug, Clone)]
pub struct TierPolicy {
    /// Cache time-to-live; `None` means entries never expire.
    pub ttl: Option<Duration>,
    /// Whether records of this type enter the cache at all.
    pub cache_eligible: bool,
}

impl TierPolicy {
    /// Cached with the given time-to-live.
    pub fn cached(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            cache_eligible: true,
        }
    }

    /// Never cached; every read goes to the durable store.
    pub fn durable_only() -> Self {
        Self {
            ttl: None,
            cache_eligible: false,
        }
    }
}

/// Mediator configuration.
#[derive(Debug, Clone)]
pub struct MediatorConfig {
    /// Cache tier capacity in entries.
    pub cache_capacity: usize,
    /// Commit queue partitions. Writes to one record always land on the
    /// same partition.
    pub partitions: usize,
    /// Bounded capacity of each queue partition.
    pub queue_capacity: usize,
    /// Persistence worker retry schedule.
    pub retry: RetryPolicy,
    /// How often the background sweeper evicts expired cache entries.
    pub sweep_interval: Duration,
    /// Upper bound on the synchronous portion of `store` and `retrieve`.
    /// `None` disables the bound. Enqueued commits are never cancelled.
    pub op_timeout: Option<Duration>,
    /// Where to persist and restore durable-store snapshots. `None`
    /// keeps everything in memory.
    pub snapshot_path: Option<PathBuf>,
    /// Per-type cache policy.
    pub tier_policies: HashMap<MemoryType, TierPolicy>,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        let mut tier_policies = HashMap::new();
        tier_policies.insert(
            MemoryType::Chat,
            TierPolicy::cached(Duration::from_secs(5 * 60)),
        );
        tier_policies.insert(
            MemoryType::Event,
            TierPolicy::cached(Duration::from_secs(6 * 60 * 60)),
        );
        tier_policies.insert(
            MemoryType::Insight,
            TierPolicy::cached(Duration::from_secs(7 * 24 * 60 * 60)),
        );
        // Decisions are the record of record: durable tier only.
        tier_policies.insert(MemoryType::Decision, TierPolicy::durable_only());

        Self {
            cache_capacity: 1024,
            partitions: 4,
            queue_capacity: 1024,
            retry: RetryPolicy::default(),
            sweep_interval: Duration::from_secs(30),
            op_timeout: None,
            snapshot_path: None,
            tier_policies,
        }
    }
}

impl MediatorConfig {
    /// Cache time-to-live for a type. Types without a policy get no expiry.
    pub fn ttl_for(&self, record_type: MemoryType) -> Option<Duration> {
        self.tier_policies
            .get(&record_type)
            .and_then(|policy| policy.ttl)
    }

    /// Whether records of a type enter the cache. Types without a policy
    /// are eligible.
    pub fn is_cache_eligible(&self, record_type: MemoryType) -> bool {
        self.tier_policies
            .get(&record_type)
            .map(|policy| policy.cache_eligible)
            .unwrap_or(true)
    }
}

/// A write request. `id: None` asks the mediator to mint one.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub id: Option<String>,
    pub record_type: MemoryType,
    pub schema_version: u32,
    pub payload: JsonValue,
    pub metadata: HashMap<String, JsonValue>,
    /// Caller-side optimistic concurrency. `None` means "whatever version
    /// is current"; `Some(0)` insists on a create.
    pub expected_version: Option<u64>,
}

impl StoreRequest {
    pub fn new(record_type: MemoryType, schema_version: u32, payload: JsonValue) -> Self {
        Self {
            id: None,
            record_type,
            schema_version,
            payload,
            metadata: HashMap::new(),
            expected_version: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, JsonValue>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Raw ingestion request: like [`StoreRequest`] but with a provenance
/// `source` that gets folded into metadata.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub record_type: MemoryType,
    pub schema_version: u32,
    pub payload: JsonValue,
    pub metadata: HashMap<String, JsonValue>,
    /// Where this memory came from ("slack", "crm-webhook", ...).
    pub source: Option<String>,
}

impl SubmitRequest {
    pub fn new(record_type: MemoryType, schema_version: u32, payload: JsonValue) -> Self {
        Self {
            record_type,
            schema_version,
            payload,
            metadata: HashMap::new(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, JsonValue>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// What a successful write hands back.
#[derive(Debug, Clone)]
pub struct StoreReceipt {
    pub key: RecordKey,
    /// The provisional version the write will commit at.
    pub version: u64,
    /// True when this write created the record (including revival of a
    /// soft-deleted one).
    pub created: bool,
}

/// Operational counters across both tiers and the queue.
#[derive(Debug, Clone, Serialize)]
pub struct MediatorStats {
    pub cache: CacheStats,
    pub store: StoreStats,
    pub queue_depth: usize,
    pub dead_letters: usize,
    pub registered_schemas: usize,
}

/// Tier reachability report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub cache_ok: bool,
    pub durable_ok: bool,
    pub queue_depth: usize,
    pub dead_letters: usize,
}

impl HealthReport {
    /// Fully healthy means both tiers answer and nothing is dead-lettered.
    pub fn is_healthy(&self) -> bool {
        self.cache_ok && self.durable_ok && self.dead_letters == 0
    }
}

/// The mediator façade. See the module docs for the tier protocol.
#[derive(Clone)]
pub struct MemoryMediator {
    cache: Arc<dyn CacheTier>,
    store: Arc<dyn DurableStore>,
    schemas: Arc<SchemaRegistry>,
    access: AccessControl,
    flights: Arc<SingleFlight>,
    /// Sender side of the commit queue. `shutdown` takes it out, which
    /// closes the channels and lets the workers drain.
    queue: Arc<Mutex<Option<CommitQueue>>>,
    /// Latest accepted state per key, kept while the durable commit is
    /// still in flight. Version resolution reads this before the durable
    /// store so back-to-back writes see their predecessors; entries
    /// retire once the durable tier catches up.
    pending: Arc<DashMap<RecordKey, MemoryRecord>>,
    dead_letters: Arc<DeadLetterStore>,
    worker: Arc<Mutex<Option<WorkerHandle>>>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
    sweeper_stop: Arc<watch::Sender<bool>>,
    /// Concrete store handle for snapshotting; only set by `start`.
    snapshot_store: Option<Arc<MemoryStore>>,
    config: Arc<MediatorConfig>,
}

impl MemoryMediator {
    /// Start a mediator on the default in-memory tiers.
    ///
    /// When `config.snapshot_path` points at an existing snapshot, the
    /// durable store is restored from it before anything else runs.
    pub async fn start(config: MediatorConfig) -> StratumResult<Self> {
        let mut store = None;
        if let Some(path) = &config.snapshot_path {
            if persistence::exists(path).await {
                let restored = persistence::load(path).await?;
                info!(records = restored.len(), "restored durable store from snapshot");
                store = Some(Arc::new(restored));
            }
        }
        let store = store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let cache = Arc::new(InMemoryCache::new(config.cache_capacity));

        Ok(Self::wire(
            config,
            cache,
            Arc::clone(&store) as Arc<dyn DurableStore>,
            Some(store),
        ))
    }

    /// Start a mediator on injected tier backends.
    ///
    /// Snapshot persistence is skipped here: the mediator cannot export
    /// records through the `DurableStore` seam.
    pub async fn start_with_tiers(
        config: MediatorConfig,
        cache: Arc<dyn CacheTier>,
        store: Arc<dyn DurableStore>,
    ) -> StratumResult<Self> {
        Ok(Self::wire(config, cache, store, None))
    }

    fn wire(
        config: MediatorConfig,
        cache: Arc<dyn CacheTier>,
        store: Arc<dyn DurableStore>,
        snapshot_store: Option<Arc<MemoryStore>>,
    ) -> Self {
        let (queue, receivers) = CommitQueue::new(config.partitions, config.queue_capacity);
        let dead_letters = Arc::new(DeadLetterStore::new());
        let worker = worker::spawn(
            receivers,
            Arc::clone(&store),
            Arc::clone(&dead_letters),
            config.retry.clone(),
        );

        let pending: Arc<DashMap<RecordKey, MemoryRecord>> = Arc::new(DashMap::new());

        let (stop_tx, stop_rx) = watch::channel(false);
        let sweeper = spawn_sweeper(
            Arc::clone(&cache),
            Arc::clone(&store),
            Arc::clone(&pending),
            config.sweep_interval,
            stop_rx,
        );

        info!(
            partitions = config.partitions,
            cache_capacity = config.cache_capacity,
            "memory mediator started"
        );

        Self {
            cache,
            store,
            schemas: Arc::new(SchemaRegistry::new()),
            access: AccessControl::new(),
            flights: Arc::new(SingleFlight::new()),
            queue: Arc::new(Mutex::new(Some(queue))),
            pending,
            dead_letters,
            worker: Arc::new(Mutex::new(Some(worker))),
            sweeper: Arc::new(Mutex::new(Some(sweeper))),
            sweeper_stop: Arc::new(stop_tx),
            snapshot_store,
            config: Arc::new(config),
        }
    }

    /// Register a payload schema for a `(type, version)` pair.
    pub fn register_schema(
        &self,
        record_type: MemoryType,
        version: u32,
        schema: Schema,
    ) -> StratumResult<()> {
        self.schemas.register(record_type, version, schema)
    }

    /// Write a memory record (create or update) into the principal's
    /// tenant.
    ///
    /// The cache sees the write immediately; the durable commit happens
    /// asynchronously through the queue. The receipt's version is the
    /// version the commit will land at barring a concurrent writer.
    pub async fn store(
        &self,
        principal: &Principal,
        request: StoreRequest,
    ) -> StratumResult<StoreReceipt> {
        self.bounded("store", self.store_inner(principal, request))
            .await
    }

    async fn store_inner(
        &self,
        principal: &Principal,
        request: StoreRequest,
    ) -> StratumResult<StoreReceipt> {
        self.schemas.validate(
            request.record_type,
            request.schema_version,
            &request.payload,
        )?;

        let id = request
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let key = RecordKey::new(principal.tenant.clone(), id.clone());

        // Updates are authorized against the record's current owner, so
        // the existing record is loaded before the role check.
        let existing = self.current(&key).await?;
        let owner = existing
            .as_ref()
            .map(|record| record.owner.as_str())
            .unwrap_or(principal.id.as_str());
        self.access.authorize(
            principal,
            &principal.tenant,
            Some(request.record_type),
            Operation::Write,
            Some(owner),
        )?;

        let current_version = existing.as_ref().map(|record| record.version).unwrap_or(0);
        let expected = match request.expected_version {
            Some(expected) if expected != current_version => {
                return Err(StratumError::Conflict {
                    expected,
                    found: current_version,
                });
            }
            Some(expected) => expected,
            None => current_version,
        };

        let mut record = MemoryRecord::new(
            id,
            request.record_type,
            request.schema_version,
            request.payload,
            request.metadata,
            owner,
            principal.tenant.clone(),
        );
        let created = match &existing {
            Some(prior) if !prior.is_deleted() => {
                record.created_at = prior.created_at;
                false
            }
            // Storing over a tombstone revives the record.
            _ => true,
        };
        record.version = expected + 1;

        let eligible = self.config.is_cache_eligible(record.record_type);
        if eligible {
            let ttl = self.config.ttl_for(record.record_type);
            if let Err(err) = self.cache.put(key.clone(), record.clone(), ttl).await {
                warn!(key = %key, %err, "cache write-through failed, continuing durable-only");
            }
        }

        if let Err(err) = self.enqueue(CommitJob::new(record.clone(), expected)) {
            // The durable commit never happened; the fresh cache entry
            // must not outlive it.
            if eligible {
                let _ = self.cache.invalidate(&key).await;
            }
            return Err(err);
        }
        self.pending.insert(key.clone(), record.clone());
        debug!(key = %key, version = record.version, created, "write accepted");

        Ok(StoreReceipt {
            key,
            version: record.version,
            created,
        })
    }

    /// Read a record by id.
    ///
    /// Soft-deleted records are returned with `deleted_at` set so callers
    /// can audit tombstones. Concurrent misses for the same key collapse
    /// onto one durable fetch.
    pub async fn retrieve(
        &self,
        principal: &Principal,
        tenant: &str,
        id: &str,
    ) -> StratumResult<MemoryRecord> {
        self.bounded("retrieve", self.retrieve_inner(principal, tenant, id))
            .await
    }

    async fn retrieve_inner(
        &self,
        principal: &Principal,
        tenant: &str,
        id: &str,
    ) -> StratumResult<MemoryRecord> {
        // Tenant boundary before any lookup.
        self.access
            .authorize(principal, tenant, None, Operation::Read, None)?;

        let key = RecordKey::new(tenant, id);

        match self.cache.get(&key).await {
            Ok(Some(record)) => {
                self.access.authorize(
                    principal,
                    tenant,
                    Some(record.record_type),
                    Operation::Read,
                    Some(&record.owner),
                )?;
                return Ok(record);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(key = %key, %err, "cache unavailable on read, falling through");
            }
        }

        let fetch_key = key.clone();
        let fetched = self
            .flights
            .fetch(&key, || async move { self.current(&fetch_key).await })
            .await;

        let record = match fetched {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(StratumError::NotFound {
                    tenant: tenant.to_string(),
                    id: id.to_string(),
                });
            }
            Err(err) if err.is_retryable() => {
                // Durable outage: a stale cache entry beats an error.
                if let Ok(Some(stale)) = self.cache.get_stale(&key).await {
                    self.access.authorize(
                        principal,
                        tenant,
                        Some(stale.record_type),
                        Operation::Read,
                        Some(&stale.owner),
                    )?;
                    warn!(key = %key, "serving stale cache entry during durable outage");
                    return Ok(stale);
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        self.access.authorize(
            principal,
            tenant,
            Some(record.record_type),
            Operation::Read,
            Some(&record.owner),
        )?;

        // Tombstones and ineligible types stay out of the cache.
        if !record.is_deleted() && self.config.is_cache_eligible(record.record_type) {
            let ttl = self.config.ttl_for(record.record_type);
            if let Err(err) = self
                .cache
                .put(key.clone(), record.clone(), ttl)
                .await
            {
                warn!(key = %key, %err, "cache repopulation failed");
            }
        }

        Ok(record)
    }

    /// Search records in a tenant.
    ///
    /// Members only ever see their own records; soft-deleted records
    /// never appear. Cache-eligible hits are warmed into the cache.
    pub async fn search(
        &self,
        principal: &Principal,
        tenant: &str,
        record_type: Option<MemoryType>,
        filters: &[Filter],
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> StratumResult<Page> {
        self.access
            .authorize(principal, tenant, record_type, Operation::Search, None)?;

        let mut page = self
            .store
            .query(tenant, record_type, filters, cursor, limit)
            .await?;

        if principal.is_member() {
            page.records.retain(|record| record.owner == principal.id);
        }

        for record in &page.records {
            if self.config.is_cache_eligible(record.record_type) {
                let ttl = self.config.ttl_for(record.record_type);
                if self
                    .cache
                    .put(record.key(), record.clone(), ttl)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }

        Ok(page)
    }

    /// Soft-delete a record, returning the version the tombstone will
    /// commit at.
    ///
    /// The record stays readable by id with `deleted_at` set; search and
    /// the cache stop seeing it immediately. Deleting a record that is
    /// already deleted is a no-op.
    pub async fn delete(
        &self,
        principal: &Principal,
        tenant: &str,
        id: &str,
    ) -> StratumResult<u64> {
        self.access
            .authorize(principal, tenant, None, Operation::Delete, None)?;

        let key = RecordKey::new(tenant, id);
        let Some(mut record) = self.current(&key).await? else {
            return Err(StratumError::NotFound {
                tenant: tenant.to_string(),
                id: id.to_string(),
            });
        };

        self.access.authorize(
            principal,
            tenant,
            Some(record.record_type),
            Operation::Delete,
            Some(&record.owner),
        )?;

        if record.is_deleted() {
            return Ok(record.version);
        }

        let expected = record.version;
        record.mark_deleted(chrono::Utc::now());
        record.version = expected + 1;

        if let Err(err) = self.cache.invalidate(&key).await {
            warn!(key = %key, %err, "cache invalidation failed on delete");
        }
        self.enqueue(CommitJob::new(record.clone(), expected))?;
        self.pending.insert(key.clone(), record.clone());
        debug!(key = %key, version = record.version, "soft delete accepted");

        Ok(record.version)
    }

    /// Ingest raw input into the principal's tenant.
    ///
    /// The one entry point external feeds use: provenance lands in
    /// metadata under `"source"`, then the write follows the normal
    /// `store` pipeline.
    pub async fn submit(
        &self,
        principal: &Principal,
        request: SubmitRequest,
    ) -> StratumResult<StoreReceipt> {
        let mut metadata = request.metadata;
        if let Some(source) = request.source {
            metadata.insert("source".to_string(), JsonValue::String(source));
        }
        let store_request = StoreRequest {
            id: None,
            record_type: request.record_type,
            schema_version: request.schema_version,
            payload: request.payload,
            metadata,
            expected_version: None,
        };
        self.store(principal, store_request).await
    }

    /// Operational counters across both tiers and the queue.
    pub fn stats(&self) -> MediatorStats {
        MediatorStats {
            cache: self.cache.stats(),
            store: self.store.stats(),
            queue_depth: self.queue_depth(),
            dead_letters: self.dead_letters.len(),
            registered_schemas: self.schemas.len(),
        }
    }

    /// Probe both tiers.
    pub async fn health(&self) -> HealthReport {
        HealthReport {
            cache_ok: self.cache.ping().await.is_ok(),
            durable_ok: self.store.ping().await.is_ok(),
            queue_depth: self.queue_depth(),
            dead_letters: self.dead_letters.len(),
        }
    }

    /// Take everything out of the dead-letter store for inspection or
    /// out-of-band replay.
    pub fn drain_dead_letters(&self) -> Vec<crate::queue::DeadLetter> {
        self.dead_letters.drain()
    }

    /// Stop the mediator: halt the sweeper, close the queue, wait for
    /// the workers to drain every pending commit, then snapshot to disk
    /// when configured. Idempotent; later operations that need the queue
    /// fail with a storage error.
    pub async fn shutdown(&self) -> StratumResult<()> {
        let _ = self.sweeper_stop.send(true);
        let sweeper = self.sweeper.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }

        // Dropping the senders closes the channels; the workers drain
        // what is buffered and exit.
        if let Ok(mut slot) = self.queue.lock() {
            slot.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = worker {
            handle.join().await;
        }

        if let (Some(path), Some(store)) = (&self.config.snapshot_path, &self.snapshot_store) {
            persistence::save(store, path).await?;
            info!(path = %path.display(), "durable store snapshot written");
        }

        info!("memory mediator stopped");
        Ok(())
    }

    /// The freshest known state of a record.
    ///
    /// An accepted write whose commit is still in flight wins over the
    /// durable tier; once the durable version has caught up the pending
    /// entry is retired. The `remove_if` guard keeps a racing newer
    /// acceptance alive.
    async fn current(&self, key: &RecordKey) -> StratumResult<Option<MemoryRecord>> {
        let durable = self.store.get(key).await?;

        if let Some(entry) = self.pending.get(key) {
            let accepted = entry.value().clone();
            drop(entry);
            match &durable {
                Some(stored) if stored.version >= accepted.version => {
                    self.pending
                        .remove_if(key, |_, record| record.version <= stored.version);
                }
                _ => return Ok(Some(accepted)),
            }
        }

        Ok(durable)
    }

    fn enqueue(&self, job: CommitJob) -> StratumResult<()> {
        let queue = self.queue.lock().map_err(|_| {
            StratumError::Storage("commit queue lock poisoned".to_string())
        })?;
        match queue.as_ref() {
            Some(queue) => queue.enqueue(job),
            None => Err(StratumError::Storage(
                "mediator is shut down".to_string(),
            )),
        }
    }

    fn queue_depth(&self) -> usize {
        self.queue
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|queue| queue.depth()))
            .unwrap_or(0)
    }

    /// Apply the configured operation timeout to a future.
    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = StratumResult<T>>,
    ) -> StratumResult<T> {
        match self.config.op_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(StratumError::Timeout {
                    operation: operation.to_string(),
                    millis: limit.as_millis() as u64,
                }),
            },
            None => fut.await,
        }
    }
}

fn spawn_sweeper(
    cache: Arc<dyn CacheTier>,
    store: Arc<dyn DurableStore>,
    pending: Arc<DashMap<RecordKey, MemoryRecord>>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match cache.sweep_expired().await {
                        Ok(0) => {}
                        Ok(swept) => debug!(swept, "cache sweep removed expired entries"),
                        Err(err) => warn!(%err, "cache sweep failed"),
                    }
                    retire_committed(&store, &pending).await;
                }
                _ = stop.changed() => break,
            }
        }
    })
}

/// Drop pending entries whose durable version has caught up. Entries for
/// dead-lettered commits stay until replayed or overwritten.
async fn retire_committed(
    store: &Arc<dyn DurableStore>,
    pending: &DashMap<RecordKey, MemoryRecord>,
) {
    let keys: Vec<RecordKey> = pending.iter().map(|entry| entry.key().clone()).collect();
    for key in keys {
        if let Ok(Some(stored)) = store.get(&key).await {
            pending.remove_if(&key, |_, record| record.version <= stored.version);
        }
    }
}
