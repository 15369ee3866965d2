//! # Stratum: Tiered Memory Mediator
//!
//! Stratum unifies two memory tiers behind one façade: a bounded,
//! TTL-aware in-memory cache for hot reads, and a durable, queryable
//! store that is the system of record. Callers never touch a tier
//! directly; every read, write, search and delete goes through the
//! [`MemoryMediator`], which enforces payload schemas and role-based
//! access on the way in.
//!
//! ## Quick Start
//!
//! ```ignore
//! use stratum::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mediator = MemoryMediator::start(MediatorConfig::default()).await?;
//!     mediator.register_schema(
//!         MemoryType::Chat,
//!         1,
//!         Schema::new().field(FieldSpec::required("text", FieldType::String)),
//!     )?;
//!
//!     let alice = Principal::new("alice", "acme", Role::Member);
//!
//!     // Write: cached immediately, durably committed in the background
//!     let receipt = mediator
//!         .store(&alice, StoreRequest::new(
//!             MemoryType::Chat,
//!             1,
//!             json!({"text": "ship it"}),
//!         ))
//!         .await?;
//!
//!     // Read-your-writes through the cache
//!     let record = mediator
//!         .retrieve(&alice, "acme", &receipt.key.id)
//!         .await?;
//!     println!("{}", record.payload["text"]);
//!
//!     mediator.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Core API
//!
//! - [`MemoryMediator::start()`] - Wire up both tiers, workers and sweeper
//! - [`MemoryMediator::store()`] - Write-through cache + async durable commit
//! - [`MemoryMediator::retrieve()`] - Cache-aside read with single-flight fallback
//! - [`MemoryMediator::search()`] - Filtered, paginated durable queries
//! - [`MemoryMediator::delete()`] - Soft delete (tombstone, audit-readable)
//! - [`MemoryMediator::submit()`] - Raw ingestion entry point
//!
//! ## Architecture
//!
//! 1. **Mediator** (`mediator`) - Validation, authorization, tier protocol
//! 2. **Cache tier** (`cache`) - Bounded LRU with per-entry TTL
//! 3. **Durable tier** (`store`) - Versioned record store with queries
//! 4. **Commit pipeline** (`queue` + `worker`) - Partitioned write-ahead
//!    queue drained by retrying persistence workers
//!
//! Writes hit the cache synchronously and the durable store
//! asynchronously; a full queue pushes back with `QueueSaturated` rather
//! than dropping anything. Failed commits retry with backoff and land in
//! a dead-letter store when they cannot be applied.
//!
//! ## Thread Safety
//!
//! All operations are thread-safe. `MemoryMediator` clones cheaply and
//! shares every tier through `Arc`:
//!
//! ```ignore
//! let mediator = MemoryMediator::start(MediatorConfig::default()).await?;
//! let handle = mediator.clone();
//!
//! tokio::spawn(async move {
//!     handle.retrieve(&alice, "acme", "m1").await.unwrap();
//! });
//! ```

// Internal modules
mod access;
mod error;
mod types;

// Tier backends (public so embedders can inject their own)
pub mod cache;
pub mod store;

// Schema registry
pub mod schema;

// Query model
pub mod query;

// Commit pipeline
pub mod queue;
pub mod worker;

// Mediator façade
pub mod mediator;

// Snapshot persistence
pub mod persistence;

// Public API exports
pub use access::AccessControl;
pub use error::{StratumError, StratumResult};
pub use types::{MemoryRecord, MemoryType, Operation, Principal, RecordKey, Role};

pub use cache::{CacheStats, CacheTier, InMemoryCache};
pub use mediator::{
    HealthReport, MediatorConfig, MediatorStats, MemoryMediator, StoreReceipt, StoreRequest,
    SubmitRequest, TierPolicy,
};
pub use query::{Cursor, Filter, Page};
pub use queue::{CommitJob, CommitQueue, DeadLetter, DeadLetterStore};
pub use schema::{FieldSpec, FieldType, Schema, SchemaRegistry};
pub use store::{DurableStore, MemoryStore, StoreStats};
pub use worker::RetryPolicy;

// Re-export commonly used external types for convenience
pub use chrono::{DateTime, Utc};
pub use serde_json::{Value as JsonValue, json};

/// Prelude module for convenient imports.
///
/// Import everything you need with:
/// ```ignore
/// use stratum::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{StratumError, StratumResult};
    pub use crate::mediator::{
        HealthReport, MediatorConfig, MediatorStats, MemoryMediator, StoreReceipt, StoreRequest,
        SubmitRequest, TierPolicy,
    };
    pub use crate::query::{Cursor, Filter, Page};
    pub use crate::schema::{FieldSpec, FieldType, Schema};
    pub use crate::types::{MemoryRecord, MemoryType, Operation, Principal, RecordKey, Role};
    pub use chrono::{DateTime, Utc};
    pub use serde_json::{Value as JsonValue, json};
}
