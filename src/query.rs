/// Search filters, cursors, and result pages for the durable store.
///
/// The durable store adapter exposes a deliberately small query surface:
/// attribute filters over payload and metadata, a created-at range, and
/// restartable id-ordered pagination. Anything richer belongs to a real
/// query engine behind the adapter, not to the mediator.
use crate::types::MemoryRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A filter condition evaluated against a memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Payload field (dotted path) equals value.
    PayloadEq { field: String, value: JsonValue },
    /// Payload field contains a substring (strings) or element (arrays).
    PayloadContains { field: String, value: JsonValue },
    /// Metadata attribute equals value.
    MetadataEq { key: String, value: JsonValue },
    /// Record owner equals the given principal id.
    OwnerEq { owner: String },
    /// Record created at or after the given instant.
    CreatedAfter(DateTime<Utc>),
    /// Record created at or before the given instant.
    CreatedBefore(DateTime<Utc>),
    /// Logical AND of multiple filters.
    And(Vec<Filter>),
    /// Logical OR of multiple filters.
    Or(Vec<Filter>),
    /// Logical NOT of a filter.
    Not(Box<Filter>),
}

impl Filter {
    /// Payload field equality.
    pub fn payload_eq(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::PayloadEq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Payload field containment.
    pub fn payload_contains(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::PayloadContains {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Metadata attribute equality.
    pub fn metadata_eq(key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::MetadataEq {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Owner equality.
    pub fn owner_eq(owner: impl Into<String>) -> Self {
        Self::OwnerEq {
            owner: owner.into(),
        }
    }

    /// Created at or after.
    pub fn created_after(at: DateTime<Utc>) -> Self {
        Self::CreatedAfter(at)
    }

    /// Created at or before.
    pub fn created_before(at: DateTime<Utc>) -> Self {
        Self::CreatedBefore(at)
    }

    /// Combine filters with AND.
    pub fn and(filters: Vec<Filter>) -> Self {
        Self::And(filters)
    }

    /// Combine filters with OR.
    pub fn or(filters: Vec<Filter>) -> Self {
        Self::Or(filters)
    }

    /// Negate a filter.
    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Self::Not(Box::new(filter))
    }

    /// Evaluate this filter against a record.
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        match self {
            Filter::PayloadEq { field, value } => {
                get_field(&record.payload, field).is_some_and(|v| &v == value)
            }
            Filter::PayloadContains { field, value } => {
                get_field(&record.payload, field).is_some_and(|v| json_contains(&v, value))
            }
            Filter::MetadataEq { key, value } => {
                record.metadata.get(key).is_some_and(|v| v == value)
            }
            Filter::OwnerEq { owner } => &record.owner == owner,
            Filter::CreatedAfter(at) => record.created_at >= *at,
            Filter::CreatedBefore(at) => record.created_at <= *at,
            Filter::And(filters) => filters.iter().all(|f| f.matches(record)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(record)),
            Filter::Not(filter) => !filter.matches(record),
        }
    }
}

/// Extract a field from a JSON value using a dotted path.
///
/// "a.b.c" navigates nested objects. Returns None if any segment is
/// missing or a non-object is traversed.
fn get_field(value: &JsonValue, path: &str) -> Option<JsonValue> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current.clone())
}

///// Containment check: substring for strings, element for arrays.
fn json_contains(haystack: &JsonValue, needle: &JsonValue) -> bool {
    match haystack {
        JsonValue::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        JsonValue::Array(items) => items.contains(needle),
        _ => false,
    }
}

/// Opaque pagination cursor.
///
/// Pages are ordered by record id; the cursor remembers the last id served
/// so a query can be restarted mid-stream without re-reading earlier pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// The last record id included in the previous page
    pub last_id: String,
}

impl Cursor {
    /// Create a cursor positioned after the given record id.
    pub fn after(last_id: impl Into<String>) -> Self {
        Self {
            last_id: last_id.into(),
        }
    }
}

/// One page of search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    /// Matching records, id-ordered
    pub records: Vec<MemoryRecord>,
    /// Cursor for the next page; None when the result set is exhausted
    pub next_cursor: Option<Cursor>,
}

impl Page {
    /// An empty, exhausted page.
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            next_cursor: None,
        }
    }
}
