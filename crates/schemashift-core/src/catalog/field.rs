//! Field definitions for entities.

use super::types::ScalarType;
use crate::value::{Value, TIMESTAMP_NEVER, TIMESTAMP_NULL};

/// A field definition within an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Semantic type.
    pub scalar: ScalarType,
    /// Whether the field accepts null.
    pub nullable: bool,
    /// Default value used when a row has no source for this field.
    pub default: Option<DefaultValue>,
}

/// Default value for a field.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// String value.
    String(String),
    /// Binary data.
    Bytes(Vec<u8>),
    /// JSON document (empty dictionaries and lists included).
    Json(serde_json::Value),
    /// Timestamp of the migration run.
    CurrentTimestamp,
    /// The "unset" timestamp sentinel.
    NullTimestamp,
    /// The "never" timestamp sentinel.
    NeverTimestamp,
    /// Freshly generated UUID string.
    AutoUuid,
}

impl DefaultValue {
    /// Evaluate the default. `now` is the run timestamp.
    pub fn evaluate(&self, now: i64) -> Value {
        match self {
            DefaultValue::Null => Value::Null,
            DefaultValue::Bool(b) => Value::Bool(*b),
            DefaultValue::Int(i) => Value::Int(*i),
            DefaultValue::String(s) => Value::String(s.clone()),
            DefaultValue::Bytes(b) => Value::Bytes(b.clone()),
            DefaultValue::Json(j) => Value::Json(j.clone()),
            DefaultValue::CurrentTimestamp => Value::Timestamp(now),
            DefaultValue::NullTimestamp => Value::Timestamp(TIMESTAMP_NULL),
            DefaultValue::NeverTimestamp => Value::Timestamp(TIMESTAMP_NEVER),
            DefaultValue::AutoUuid => Value::String(generate_uuid()),
        }
    }

    /// Empty JSON dictionary.
    pub fn empty_dict() -> Self {
        DefaultValue::Json(serde_json::Value::Object(Default::default()))
    }

    /// Empty JSON list.
    pub fn empty_list() -> Self {
        DefaultValue::Json(serde_json::Value::Array(Vec::new()))
    }
}

impl FieldDef {
    /// Create a new non-nullable field.
    pub fn new(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self {
            name: name.into(),
            scalar,
            nullable: false,
            default: None,
        }
    }

    /// Create a nullable field.
    pub fn optional(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self {
            name: name.into(),
            scalar,
            nullable: true,
            default: None,
        }
    }

    /// Set the default value.
    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    /// Check if this field has a default value.
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Value used when nothing else supplies one.
    ///
    /// Nullable fields without an explicit default fall back to null.
    pub fn fallback(&self, now: i64) -> Option<Value> {
        match &self.default {
            Some(default) => Some(default.evaluate(now)),
            None if self.nullable => Some(Value::Null),
            None => None,
        }
    }

    /// Check a value against the declared type and nullability.
    pub fn admits(&self, value: &Value) -> bool {
        if value.is_null() {
            self.nullable
        } else {
            self.scalar.accepts(value)
        }
    }
}

/// Generate a random-looking version 4 UUID string.
///
/// Combines the clock with a process-wide counter, like the id generator of
/// the storage engine, so consecutive calls never collide.
pub(crate) fn generate_uuid() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let now = crate::value::current_timestamp() as u64;
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let mixed = blake3::hash(&[now.to_le_bytes(), counter.to_le_bytes()].concat());

    let mut id = [0u8; 16];
    id.copy_from_slice(&mixed.as_bytes()[..16]);
    id[6] = (id[6] & 0x0f) | 0x40;
    id[8] = (id[8] & 0x3f) | 0x80;

    let hex = hex::encode(id);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
