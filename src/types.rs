/// Common types used throughout Stratum.
///
/// This module defines the core data model shared by both tiers: the
/// tenant-scoped record key, the memory record itself, the closed set of
/// memory types, and the principals that operations are authorized against.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// A fully-qualified record key combining tenant and record id.
///
/// Stratum isolates data per tenant; every tier map is keyed on this
/// composite so an id collision across tenants can never alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// The tenant boundary (e.g., "acme")
    pub tenant: String,
    /// The record id within the tenant
    pub id: String,
}

impl RecordKey {
    /// Create a new tenant-scoped record key.
    pub fn new(tenant: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            id: id.into(),
        }
    }

    /// Get a canonical string representation for hashing and partitioning.
    ///
    /// Format: "tenant:id"
    pub fn to_canonical_string(&self) -> String {
        format!("{}:{}", self.tenant, self.id)
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tenant, self.id)
    }
}

/// The closed set of memory record types.
///
/// Payload shapes are governed per type by the schema registry; unknown
/// variants are rejected at the serde boundary, never downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Conversational turns - short-lived, hottest
    Chat,
    /// Things that happened (deploys, meetings, alerts)
    Event,
    /// Distilled observations worth keeping around
    Insight,
    /// Decisions of record - durable-only by default
    Decision,
}

impl MemoryType {
    /// All variants, in declaration order. Useful for config tables.
    pub const ALL: [MemoryType; 4] = [
        MemoryType::Chat,
        MemoryType::Event,
        MemoryType::Insight,
        MemoryType::Decision,
    ];

    /// String form used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Chat => "chat",
            MemoryType::Event => "event",
            MemoryType::Insight => "insight",
            MemoryType::Decision => "decision",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single memory record as stored in both tiers.
///
/// Records are created by `MemoryMediator::store` on first write and only
/// mutated through the mediator (update or soft delete). `id`, `record_type`
/// and `tenant` are immutable after creation; `version` strictly increases
/// per successful durable commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Opaque unique id, caller-supplied or mediator-generated
    pub id: String,
    /// Which variant of the closed type set this record is
    pub record_type: MemoryType,
    /// Which schema registry entry governs `payload`
    pub schema_version: u32,
    /// Structured content, validated against the registered schema
    pub payload: JsonValue,
    /// Tags, source, sentiment-like attributes; insertion order irrelevant
    #[serde(default)]
    pub metadata: HashMap<String, JsonValue>,
    /// The authoring principal
    pub owner: String,
    /// Isolation boundary; all queries are implicitly tenant-scoped
    pub tenant: String,
    /// When this record was first created
    pub created_at: DateTime<Utc>,
    /// Monotonically non-decreasing; bumped on every mutation
    pub updated_at: DateTime<Utc>,
    /// Set by soft delete; soft-deleted records stay readable by id for
    /// audit but are excluded from search and cache warm-up
    pub deleted_at: Option<DateTime<Utc>>,
    /// Monotonically increasing commit counter, used for optimistic
    /// concurrency. 0 means the record has not been durably committed yet.
    pub version: u64,
}

impl MemoryRecord {
    /// Create a new record with fresh timestamps and version 0.
    ///
    /// The mediator assigns the provisional version before enqueueing the
    /// durable commit; the durable store is the authority on the committed
    /// version.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        record_type: MemoryType,
        schema_version: u32,
        payload: JsonValue,
        metadata: HashMap<String, JsonValue>,
        owner: impl Into<String>,
        tenant: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            record_type,
            schema_version,
            payload,
            metadata,
            owner: owner.into(),
            tenant: tenant.into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 0,
        }
    }

    /// The tenant-scoped key for this record.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.tenant.clone(), self.id.clone())
    }

    /// Whether this record has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Mark this record soft-deleted, bumping `updated_at` monotonically.
    pub fn mark_deleted(&mut self, at: DateTime<Utc>) {
        self.deleted_at = Some(at);
        self.updated_at = self.updated_at.max(at);
    }
}

/// Roles recognized by the access control module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Full read/write across the tenant
    Ceo,
    /// Read everything; write and delete insights only
    Manager,
    /// Read/write own records only
    Member,
}

/// Operations subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Write,
    Delete,
    Search,
}

impl Operation {
    /// String form used in logs and permission errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Delete => "delete",
            Operation::Search => "search",
        }
    }
}

/// An authenticated caller: identity, tenant, and role.
///
/// How a principal got authenticated is the embedding application's
/// business; the mediator only evaluates the role matrix against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Principal identity, compared against `MemoryRecord::owner`
    pub id: String,
    /// The tenant this principal belongs to
    pub tenant: String,
    /// Role within the tenant
    pub role: Role,
}

impl Principal {
    /// Create a new principal.
    pub fn new(id: impl Into<String>, tenant: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            tenant: tenant.into(),
            role,
        }
    }

    /// Whether this principal is scoped to their own records.
    pub fn is_member(&self) -> bool {
        self.role == Role::Member
    }
}
