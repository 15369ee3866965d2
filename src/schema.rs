/// Versioned schema registry for memory payloads.
///
/// Every memory type carries a `schema_version`; the registry maps
/// `(type, version)` pairs to a payload shape and validates incoming
/// payloads against it at the mediator boundary. Registration is idempotent
/// for identical triples and rejects conflicting redefinition of an
/// existing version.
use crate::error::{StratumError, StratumResult};
use crate::types::MemoryType;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The JSON shape a schema field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    /// Any JSON value, including null
    Any,
}

impl FieldType {
    /// Check a JSON value against this field type.
    pub fn accepts(&self, value: &JsonValue) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }

    fn expected_name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Any => "any",
        }
    }
}

/// A single field in a payload schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Top-level field name in the payload object
    pub name: String,
    /// Required JSON shape
    pub field_type: FieldType,
    /// Whether the field must be present
    pub required: bool,
}

impl FieldSpec {
    /// A field that must be present.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// A field that may be absent but is type-checked when present.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }
}

/// The payload shape for one `(type, version)` pair.
///
/// Validation checks required presence and field types; fields not named
/// by the schema are allowed through (collaborators attach extra context
/// freely, the mediator only guards the contract it knows about).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Field specifications, checked in order
    pub fields: Vec<FieldSpec>,
}

impl Schema {
    /// Create an empty schema (accepts any JSON object).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field specification (builder style).
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }
}

/// Registry of payload schemas, keyed by `(type, version)`.
///
/// Thread-safe via DashMap; registration and validation can run
/// concurrently with mediator traffic.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: DashMap<(MemoryType, u32), Schema>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            schemas: DashMap::new(),
        }
    }

    /// Register a schema for a `(type, version)` pair.
    ///
    /// Idempotent for identical triples. Re-registering an existing version
    /// with a different shape fails with `SchemaConflict` - published
    /// versions are immutable; shape changes get a new version.
    pub fn register(
        &self,
        record_type: MemoryType,
        version: u32,
        schema: Schema,
    ) -> StratumResult<()> {
        match self.schemas.entry((record_type, version)) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                if existing.get() == &schema {
                    Ok(())
                } else {
                    Err(StratumError::SchemaConflict {
                        record_type: record_type.as_str().to_string(),
                        version,
                    })
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(schema);
                Ok(())
            }
        }
    }

    /// Validate a payload against the registered schema for
    /// `(type, version)`.
    ///
    /// Unknown `(type, version)` pairs are a validation error naming
    /// `schema_version`; the type itself is a closed enum, so unknown types
    /// never reach this far. The payload must be a JSON object.
    pub fn validate(
        &self,
        record_type: MemoryType,
        version: u32,
        payload: &JsonValue,
    ) -> StratumResult<()> {
        let schema =
            self.schemas
                .get(&(record_type, version))
                .ok_or_else(|| StratumError::Validation {
                    field: "schema_version".to_string(),
                    reason: format!(
                        "no schema registered for type '{}' version {}",
                        record_type, version
                    ),
                })?;

        let object = payload.as_object().ok_or_else(|| StratumError::Validation {
            field: "payload".to_string(),
            reason: "payload must be a JSON object".to_string(),
        })?;

        for spec in &schema.fields {
            match object.get(&spec.name) {
                Some(value) => {
                    if !spec.field_type.accepts(value) {
                        return Err(StratumError::Validation {
                            field: spec.name.clone(),
                            reason: format!("expected a {}", spec.field_type.expected_name()),
                        });
                    }
                }
                None if spec.required => {
                    return Err(StratumError::Validation {
                        field: spec.name.clone(),
                        reason: "missing required field".to_string(),
                    });
                }
                None => {}
            }
        }

        Ok(())
    }

    /// Whether a schema is registered for this `(type, version)` pair.
    pub fn contains(&self, record_type: MemoryType, version: u32) -> bool {
        self.schemas.contains_key(&(record_type, version))
    }

    /// Number of registered `(type, version)` entries.
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
