//! Semantic field types.

use crate::value::Value;

/// Scalar data types a field may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    /// Boolean value.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// 64-bit floating point.
    Float,
    /// UTF-8 string.
    String,
    /// Binary data.
    Bytes,
    /// Timestamp (microseconds since Unix epoch).
    Timestamp,
    /// Structured JSON document.
    Json,
}

impl ScalarType {
    /// Check whether a non-null value is of this type.
    ///
    /// `Null` is never accepted here; nullability is a property of the field.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (ScalarType::Bool, Value::Bool(_))
                | (ScalarType::Int, Value::Int(_))
                | (ScalarType::Float, Value::Float(_))
                | (ScalarType::Float, Value::Int(_))
                | (ScalarType::String, Value::String(_))
                | (ScalarType::Bytes, Value::Bytes(_))
                | (ScalarType::Timestamp, Value::Timestamp(_))
                | (ScalarType::Json, Value::Json(_))
        )
    }

    /// Check if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(self, ScalarType::Int | ScalarType::Float)
    }
}

impl std::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScalarType::Bool => "bool",
            ScalarType::Int => "int",
            ScalarType::Float => "float",
            ScalarType::String => "string",
            ScalarType::Bytes => "bytes",
            ScalarType::Timestamp => "timestamp",
            ScalarType::Json => "json",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts() {
        assert!(ScalarType::Bool.accepts(&Value::Bool(false)));
        assert!(ScalarType::Float.accepts(&Value::Int(1)));
        assert!(!ScalarType::Int.accepts(&Value::Float(1.0)));
        assert!(!ScalarType::String.accepts(&Value::Null));
        assert!(ScalarType::Json.accepts(&Value::Json(serde_json::json!({}))));
    }

    #[test]
    fn test_numeric() {
        assert!(ScalarType::Int.is_numeric());
        assert!(!ScalarType::Timestamp.is_numeric());
    }
}
