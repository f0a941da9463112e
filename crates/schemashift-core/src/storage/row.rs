//! Rows and identity keys.

use crate::error::Error;
use crate::value::Value;
use std::collections::BTreeMap;

/// One entity instance: field name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    fields: BTreeMap<String, Value>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field assignment.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Set a field, returning the previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }

    /// Get a field value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Remove a field.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Check whether a field is present.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Get a string field.
    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Get an integer field.
    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    /// Get a boolean field.
    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the row has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Tag bytes for key components. Ordering between tags only matters for
/// mixed-type keys, which snapshots never declare.
const KEY_BOOL: u8 = 1;
const KEY_INT: u8 = 2;
const KEY_TIMESTAMP: u8 = 3;
const KEY_STRING: u8 = 4;
const KEY_BYTES: u8 = 5;

/// Identity of a row within its entity.
///
/// The encoded form sorts the same way the values do, so scanning a sled
/// tree keyed by [`RowKey::encode`] yields rows in identity order.
#[derive(Debug, Clone, PartialEq)]
pub struct RowKey {
    values: Vec<Value>,
}

impl RowKey {
    /// Create a key from identity values, in identity-field order.
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Identity values.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Encode to order-preserving bytes.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        for value in &self.values {
            match value {
                Value::Bool(b) => {
                    buf.push(KEY_BOOL);
                    buf.push(*b as u8);
                }
                Value::Int(i) => {
                    buf.push(KEY_INT);
                    buf.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
                }
                Value::Timestamp(t) => {
                    buf.push(KEY_TIMESTAMP);
                    buf.extend_from_slice(&((*t as u64) ^ (1 << 63)).to_be_bytes());
                }
                Value::String(s) => {
                    buf.push(KEY_STRING);
                    escape_into(&mut buf, s.as_bytes());
                }
                Value::Bytes(b) => {
                    buf.push(KEY_BYTES);
                    escape_into(&mut buf, b);
                }
                Value::Null | Value::Float(_) | Value::Json(_) => return Err(Error::InvalidKey),
            }
        }
        Ok(buf)
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, ")")
    }
}

/// Escape 0x00 as 0x00 0xFF and terminate with 0x00 0x01, so that a shorter
/// component always sorts before a longer one sharing its prefix.
fn escape_into(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        buf.push(b);
        if b == 0 {
            buf.push(0xFF);
        }
    }
    buf.push(0);
    buf.push(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_builder() {
        let mut row = Row::new().with("id", "a").with("tid", 1).with("new", true);
        assert_eq!(row.str("id"), Some("a"));
        assert_eq!(row.int("tid"), Some(1));
        assert_eq!(row.bool("new"), Some(true));
        assert_eq!(row.len(), 3);

        assert_eq!(row.remove("new"), Some(Value::Bool(true)));
        assert!(!row.contains("new"));
    }

    #[test]
    fn test_key_order_matches_value_order() {
        let keys = [
            RowKey::new(vec![Value::Int(-5)]),
            RowKey::new(vec![Value::Int(0)]),
            RowKey::new(vec![Value::Int(3)]),
            RowKey::new(vec![Value::Int(300)]),
        ];
        let encoded: Vec<_> = keys.iter().map(|k| k.encode().unwrap()).collect();
        assert!(encoded.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_string_prefix_sorts_first() {
        let short = RowKey::new(vec![Value::from("ab"), Value::Int(9)]).encode().unwrap();
        let long = RowKey::new(vec![Value::from("abc"), Value::Int(1)]).encode().unwrap();
        assert!(short < long);
    }

    #[test]
    fn test_unkeyable_values() {
        assert!(RowKey::new(vec![Value::Null]).encode().is_err());
        assert!(RowKey::new(vec![Value::Json(serde_json::json!(1))]).encode().is_err());
    }

    #[test]
    fn test_key_display() {
        let key = RowKey::new(vec![Value::Int(1), Value::from("name")]);
        assert_eq!(key.to_string(), "(1, \"name\")");
    }
}
