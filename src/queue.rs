/// Write-ahead commit queue between the mediator and the persistence
/// worker.
///
/// The queue is partitioned by record key so all writes to one record
/// land on one worker and apply in order. Each partition is a bounded
/// channel; when a partition fills up the enqueue fails fast with
/// `QueueSaturated` instead of blocking the caller.
use crate::error::{StratumError, StratumResult};
use crate::types::{MemoryRecord, RecordKey};
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// A pending durable commit.
#[derive(Debug, Clone)]
pub struct CommitJob {
    pub key: RecordKey,
    pub record: MemoryRecord,
    /// Version the record is expected to be at in the durable store
    /// (0 = create).
    pub expected_version: u64,
    /// Delivery attempts so far.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl CommitJob {
    pub fn new(record: MemoryRecord, expected_version: u64) -> Self {
        Self {
            key: record.key(),
            record,
            expected_version,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// Partitioned, bounded commit queue.
///
/// Cloning shares the underlying channels. Dropping every clone closes
/// the senders, which is how workers learn to drain and exit.
#[derive(Clone)]
pub struct CommitQueue {
    senders: Vec<mpsc::Sender<CommitJob>>,
}

impl CommitQueue {
    /// Create a queue with `partitions` channels of `capacity` jobs each.
    ///
    /// Returns the queue and the receiver ends, one per partition, for
    /// the worker to consume.
    pub fn new(partitions: usize, capacity: usize) -> (Self, Vec<mpsc::Receiver<CommitJob>>) {
        let partitions = partitions.max(1);
        let capacity = capacity.max(1);

        let mut senders = Vec::with_capacity(partitions);
        let mut receivers = Vec::with_capacity(partitions);
        for _ in 0..partitions {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            receivers.push(rx);
        }

        (Self { senders }, receivers)
    }

    /// Which partition a key maps to. Stable for the queue's lifetime,
    /// so per-record ordering holds.
    pub fn partition_for(&self, key: &RecordKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.senders.len()
    }

    /// Enqueue a job without blocking.
    ///
    /// Fails with [`StratumError::QueueSaturated`] when the target
    /// partition is full.
    pub fn enqueue(&self, job: CommitJob) -> StratumResult<()> {
        let partition = self.partition_for(&job.key);
        let sender = &self.senders[partition];
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(StratumError::QueueSaturated {
                depth: sender.max_capacity(),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(StratumError::Storage(
                "commit queue is shut down".to_string(),
            )),
        }
    }

    /// Total jobs waiting across all partitions.
    pub fn depth(&self) -> usize {
        self.senders
            .iter()
            .map(|s| s.max_capacity() - s.capacity())
            .sum()
    }

    pub fn partitions(&self) -> usize {
        self.senders.len()
    }
}

/// A commit that permanently failed.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub job: CommitJob,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Holding area for commits the worker gave up on.
///
/// Kept deliberately simple: callers inspect or drain it out of band.
/// Nothing is retried automatically from here.
#[derive(Default)]
pub struct DeadLetterStore {
    letters: Mutex<Vec<DeadLetter>>,
}

impl DeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: CommitJob, error: &StratumError) {
        let letter = DeadLetter {
            job,
            error: error.to_string(),
            failed_at: Utc::now(),
        };
        if let Ok(mut letters) = self.letters.lock() {
            letters.push(letter);
        }
    }

    pub fn len(&self) -> usize {
        self.letters.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take everything out, leaving the store empty.
    pub fn drain(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .map(|mut l| l.drain(..).collect())
            .unwrap_or_default()
    }
}
