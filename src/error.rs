/// Error types for Stratum operations.
///
/// This module provides the error taxonomy for the mediator and both tiers.
/// Validation and permission failures are always caller-visible and rejected
/// synchronously; transient tier failures are retried or degraded internally
/// and only surface here when degradation is impossible.
use thiserror::Error;

/// The main error type for Stratum operations.
///
/// All fallible operations in Stratum return `Result<T, StratumError>`.
/// This provides a unified error handling interface across the entire API.
#[derive(Error, Debug)]
pub enum StratumError {
    /// Payload failed schema validation. Never queued.
    #[error("Validation failed on field '{field}': {reason}")]
    Validation {
        /// The offending field (or pseudo-field such as `schema_version`)
        field: String,
        /// Why validation rejected it
        reason: String,
    },

    /// A schema version was redefined with a different shape.
    #[error("Schema conflict: '{record_type}' version {version} is already registered with a different shape")]
    SchemaConflict {
        /// The record type being registered
        record_type: String,
        /// The conflicting schema version
        version: u32,
    },

    /// RBAC or tenant-boundary violation. Rejected synchronously.
    #[error("Permission denied for principal '{principal}': {reason}")]
    Permission {
        /// The principal that was refused
        principal: String,
        /// Why the operation was refused
        reason: String,
    },

    /// Record absent from the durable store.
    #[error("Record '{id}' not found in tenant '{tenant}'")]
    NotFound {
        /// The tenant that was queried
        tenant: String,
        /// The record id that was not found
        id: String,
    },

    /// Optimistic-concurrency check failed: the stored version does not
    /// match the expected version.
    #[error("Version conflict: expected {expected}, found {found}")]
    Conflict {
        /// The version the writer expected to replace
        expected: u64,
        /// The version actually stored (0 = absent)
        found: u64,
    },

    /// Cache tier unreachable. The mediator degrades to durable-only
    /// operation instead of failing the request.
    #[error("Cache tier unavailable: {0}")]
    CacheUnavailable(String),

    /// Durable store unreachable. Reads fall back to stale cache entries
    /// when one exists.
    #[error("Durable store unavailable: {0}")]
    DurableUnavailable(String),

    /// The write-ahead queue is saturated. Backpressure signal: the caller
    /// should retry later; the write was not silently dropped.
    #[error("Write-ahead queue saturated ({depth} pending jobs)")]
    QueueSaturated {
        /// Queue depth observed at rejection time
        depth: usize,
    },

    /// The synchronous portion of an operation exceeded the configured
    /// timeout. Already-enqueued durable commits are not affected.
    #[error("Operation '{operation}' timed out after {millis}ms")]
    Timeout {
        /// The operation that was aborted
        operation: String,
        /// The configured timeout in milliseconds
        millis: u64,
    },

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from snapshot persistence
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),
}

impl StratumError {
    /// Whether the persistence worker should retry after this error.
    ///
    /// Transient tier failures are retryable; conflicts go through the
    /// reconciliation path instead, and everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StratumError::DurableUnavailable(_) | StratumError::Storage(_) | StratumError::Io(_)
        )
    }
}

/// Result type alias for Stratum operations.
///
/// This is a convenience alias for `Result<T, StratumError>` that makes
/// function signatures more concise throughout the codebase.
pub type StratumResult<T> = Result<T, StratumError>;
