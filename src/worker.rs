/// Persistence worker: drains the commit queue into the durable store.
///
/// One task runs per queue partition, so commits to the same record key
/// apply in enqueue order. Transient store failures retry with
/// exponential backoff and jitter; commits that keep failing, and
/// commits that lost a version race they cannot win, land in the
/// dead-letter store.
///
/// Shutdown is cooperative: when every sender side of the queue is
/// dropped, each partition drains its buffered jobs and the task exits.
use crate::error::{StratumError, StratumResult};
use crate::queue::{CommitJob, DeadLetterStore};
use crate::store::DurableStore;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Backoff schedule for transient durable-store failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total delivery attempts before a job is dead-lettered.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): exponential growth
    /// capped at `max_delay`, plus up to 50% jitter so stalled partitions
    /// don't hammer a recovering store in lockstep.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter_ceiling = (exp.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_ceiling);
        exp + Duration::from_millis(jitter)
    }
}

/// How a version conflict resolves once the stored record is in hand.
enum Reconciliation {
    /// The store already holds this exact write (redelivery). Done.
    AlreadyApplied,
    /// Our write is at least as recent; reapply on top of the stored
    /// version.
    Rebase { onto_version: u64 },
    /// A newer write beat us. Applying would clobber it.
    Stale,
}

/// Handle over the per-partition worker tasks.
pub struct WorkerHandle {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Wait for every partition to drain and exit.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Spawn one worker task per queue partition.
pub fn spawn(
    receivers: Vec<mpsc::Receiver<CommitJob>>,
    store: Arc<dyn DurableStore>,
    dead_letters: Arc<DeadLetterStore>,
    policy: RetryPolicy,
) -> WorkerHandle {
    let handles = receivers
        .into_iter()
        .enumerate()
        .map(|(partition, rx)| {
            let store = Arc::clone(&store);
            let dead_letters = Arc::clone(&dead_letters);
            let policy = policy.clone();
            tokio::spawn(run_partition(partition, rx, store, dead_letters, policy))
        })
        .collect();

    WorkerHandle { handles }
}

async fn run_partition(
    partition: usize,
    mut rx: mpsc::Receiver<CommitJob>,
    store: Arc<dyn DurableStore>,
    dead_letters: Arc<DeadLetterStore>,
    policy: RetryPolicy,
) {
    while let Some(job) = rx.recv().await {
        apply_job(job, store.as_ref(), &dead_letters, &policy).await;
    }
    info!(partition, "commit queue closed, partition drained");
}

/// Drive one job to a terminal state: committed or dead-lettered.
async fn apply_job(
    mut job: CommitJob,
    store: &dyn DurableStore,
    dead_letters: &DeadLetterStore,
    policy: &RetryPolicy,
) {
    loop {
        job.attempt += 1;
        match store.put(job.record.clone(), job.expected_version).await {
            Ok(version) => {
                debug!(
                    key = %job.key,
                    version,
                    attempt = job.attempt,
                    "commit applied"
                );
                return;
            }
            Err(StratumError::Conflict { found, .. }) => {
                match reconcile(&job, store).await {
                    Ok(Reconciliation::AlreadyApplied) => {
                        debug!(key = %job.key, "commit already applied, skipping redelivery");
                        return;
                    }
                    Ok(Reconciliation::Rebase { onto_version }) => {
                        if job.attempt >= policy.max_attempts {
                            let err = StratumError::Conflict {
                                expected: job.expected_version,
                                found,
                            };
                            error!(key = %job.key, "rebase attempts exhausted, dead-lettering");
                            dead_letters.push(job, &err);
                            return;
                        }
                        debug!(key = %job.key, onto_version, "rebasing commit onto newer version");
                        job.expected_version = onto_version;
                    }
                    Ok(Reconciliation::Stale) => {
                        let err = StratumError::Conflict {
                            expected: job.expected_version,
                            found,
                        };
                        warn!(key = %job.key, found, "commit superseded by newer write, dead-lettering");
                        dead_letters.push(job, &err);
                        return;
                    }
                    Err(err) => {
                        if !backoff_or_give_up(&mut job, &err, dead_letters, policy).await {
                            return;
                        }
                    }
                }
            }
            Err(err) if err.is_retryable() => {
                if !backoff_or_give_up(&mut job, &err, dead_letters, policy).await {
                    return;
                }
            }
            Err(err) => {
                error!(key = %job.key, %err, "commit rejected, dead-lettering");
                dead_letters.push(job, &err);
                return;
            }
        }
    }
}

/// Sleep out the backoff and report whether the job should retry.
/// Dead-letters the job and returns false when attempts are exhausted.
async fn backoff_or_give_up(
    job: &mut CommitJob,
    err: &StratumError,
    dead_letters: &DeadLetterStore,
    policy: &RetryPolicy,
) -> bool {
    if job.attempt >= policy.max_attempts {
        error!(
            key = %job.key,
            attempts = job.attempt,
            %err,
            "retries exhausted, dead-lettering"
        );
        dead_letters.push(job.clone(), err);
        return false;
    }
    let delay = policy.delay_for(job.attempt - 1);
    warn!(
        key = %job.key,
        attempt = job.attempt,
        delay_ms = delay.as_millis() as u64,
        %err,
        "commit failed, backing off"
    );
    tokio::time::sleep(delay).await;
    true
}

/// Classify a version conflict by inspecting what the store holds now.
async fn reconcile(job: &CommitJob, store: &dyn DurableStore) -> StratumResult<Reconciliation> {
    let Some(stored) = store.get(&job.key).await? else {
        // Conflict against a vacant slot means expected_version > 0 for a
        // record the store never saw. Reapply as a create.
        return Ok(Reconciliation::Rebase { onto_version: 0 });
    };

    // At-least-once delivery: the same job can arrive twice. If the
    // stored record already carries our timestamp, payload and deleted
    // state, the first delivery won.
    if stored.version > job.expected_version
        && stored.updated_at == job.record.updated_at
        && stored.payload == job.record.payload
        && stored.is_deleted() == job.record.is_deleted()
    {
        return Ok(Reconciliation::AlreadyApplied);
    }

    if job.record.updated_at >= stored.updated_at {
        Ok(Reconciliation::Rebase {
            onto_version: stored.version,
        })
    } else {
        Ok(Reconciliation::Stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::CommitQueue;
    use crate::store::MemoryStore;
    use crate::types::{MemoryRecord, MemoryType, RecordKey};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record(id: &str) -> MemoryRecord {
        MemoryRecord::new(
            id,
            MemoryType::Event,
            1,
            json!({"name": "deploy", "at": "noon"}),
            HashMap::new(),
            "alice",
            "acme",
        )
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    /// Store that fails the first `failures` puts with a retryable error.
    struct FlakyStore {
        inner: MemoryStore,
        remaining_failures: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                remaining_failures: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl DurableStore for FlakyStore {
        async fn put(&self, record: MemoryRecord, expected_version: u64) -> StratumResult<u64> {
            if self.remaining_failures.load(Ordering::SeqCst) > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StratumError::DurableUnavailable("flaky".to_string()));
            }
            self.inner.put(record, expected_version).await
        }

        async fn get(
            &self,
            key: &RecordKey,
        ) -> StratumResult<Option<MemoryRecord>> {
            self.inner.get(key).await
        }

        async fn query(
            &self,
            tenant: &str,
            record_type: Option<MemoryType>,
            filters: &[crate::query::Filter],
            cursor: Option<&crate::query::Cursor>,
            limit: usize,
        ) -> StratumResult<crate::query::Page> {
            self.inner.query(tenant, record_type, filters, cursor, limit).await
        }

        async fn ping(&self) -> StratumResult<()> {
            self.inner.ping().await
        }

        fn stats(&self) -> crate::store::StoreStats {
            self.inner.stats()
        }
    }

    #[tokio::test]
    async fn test_commit_applies_to_store() {
        let store = Arc::new(MemoryStore::new());
        let dead_letters = Arc::new(DeadLetterStore::new());
        let (queue, receivers) = CommitQueue::new(2, 8);
        let handle = spawn(
            receivers,
            Arc::clone(&store) as Arc<dyn DurableStore>,
            Arc::clone(&dead_letters),
            fast_policy(),
        );

        queue.enqueue(CommitJob::new(record("m1"), 0)).unwrap();
        drop(queue);
        handle.join().await;

        let stored = store
            .get(&RecordKey::new("acme", "m1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 1);
        assert!(dead_letters.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_retry_and_succeed() {
        let store = Arc::new(FlakyStore::new(2));
        let dead_letters = Arc::new(DeadLetterStore::new());
        let (queue, receivers) = CommitQueue::new(1, 8);
        let handle = spawn(
            receivers,
            Arc::clone(&store) as Arc<dyn DurableStore>,
            Arc::clone(&dead_letters),
            fast_policy(),
        );

        queue.enqueue(CommitJob::new(record("m1"), 0)).unwrap();
        drop(queue);
        handle.join().await;

        assert!(store.inner.get(&RecordKey::new("acme", "m1")).await.unwrap().is_some());
        assert!(dead_letters.is_empty());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_dead_letters() {
        let store = Arc::new(FlakyStore::new(10));
        let dead_letters = Arc::new(DeadLetterStore::new());
        let (queue, receivers) = CommitQueue::new(1, 8);
        let handle = spawn(
            receivers,
            Arc::clone(&store) as Arc<dyn DurableStore>,
            Arc::clone(&dead_letters),
            fast_policy(),
        );

        queue.enqueue(CommitJob::new(record("m1"), 0)).unwrap();
        drop(queue);
        handle.join().await;

        assert_eq!(dead_letters.len(), 1);
        let letters = dead_letters.drain();
        assert_eq!(letters[0].job.attempt, 3);
    }

    #[tokio::test]
    async fn test_redelivered_commit_is_skipped() {
        let store = MemoryStore::new();
        let dead_letters = DeadLetterStore::new();
        let r = record("m1");

        // First delivery commits, second is the redelivery.
        let job = CommitJob::new(r.clone(), 0);
        apply_job(job.clone(), &store, &dead_letters, &fast_policy()).await;
        apply_job(job, &store, &dead_letters, &fast_policy()).await;

        let stored = store
            .get(&RecordKey::new("acme", "m1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 1);
        assert!(dead_letters.is_empty());
    }

    #[tokio::test]
    async fn test_newer_commit_rebases_over_conflict() {
        let store = MemoryStore::new();
        let dead_letters = DeadLetterStore::new();

        // Another writer got version 1 in first.
        let mut earlier = record("m1");
        earlier.updated_at -= ChronoDuration::seconds(60);
        store.put(earlier, 0).await.unwrap();

        // Our job expected to create but carries a newer timestamp.
        apply_job(
            CommitJob::new(record("m1"), 0),
            &store,
            &dead_letters,
            &fast_policy(),
        )
        .await;

        let stored = store
            .get(&RecordKey::new("acme", "m1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 2);
        assert!(dead_letters.is_empty());
    }

    #[tokio::test]
    async fn test_stale_commit_dead_letters_without_clobbering() {
        let store = MemoryStore::new();
        let dead_letters = DeadLetterStore::new();

        let mut stale = record("m1");
        stale.updated_at -= ChronoDuration::seconds(60);
        let stale_job = CommitJob::new(stale, 0);

        // The newer write wins the race into the store.
        let newer = record("m1");
        let newer_at = newer.updated_at;
        store.put(newer, 0).await.unwrap();

        apply_job(stale_job, &store, &dead_letters, &fast_policy()).await;

        let stored = store
            .get(&RecordKey::new("acme", "m1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.updated_at, newer_at);
        assert_eq!(dead_letters.len(), 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        };
        let first = policy.delay_for(0);
        assert!(first >= Duration::from_millis(50));
        assert!(first < Duration::from_millis(100));

        // Capped: exp part never exceeds max_delay, jitter adds at most 50%.
        let late = policy.delay_for(20);
        assert!(late >= Duration::from_secs(1));
        assert!(late < Duration::from_millis(1600));
    }
}
