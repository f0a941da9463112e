//! Row codec for encoding/decoding rows to/from bytes.
//!
//! Format:
//! - Field count (4 bytes, little-endian)
//! - For each field:
//!   - Field name length (2 bytes, little-endian)
//!   - Field name (UTF-8 bytes)
//!   - Value tag (1 byte)
//!   - Value data (variable length, depends on type)

use super::Row;
use crate::error::Error;
use crate::value::Value;

/// Type tag for encoded values.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueTag {
    Null = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    String = 4,
    Bytes = 5,
    Timestamp = 6,
    Json = 7,
}

impl TryFrom<u8> for ValueTag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ValueTag::Null),
            1 => Ok(ValueTag::Bool),
            2 => Ok(ValueTag::Int),
            3 => Ok(ValueTag::Float),
            4 => Ok(ValueTag::String),
            5 => Ok(ValueTag::Bytes),
            6 => Ok(ValueTag::Timestamp),
            7 => Ok(ValueTag::Json),
            _ => Err(Error::InvalidData(format!("Unknown value tag: {}", value))),
        }
    }
}

/// Encode a row to bytes.
pub fn encode_row(row: &Row) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(row.len() as u32).to_le_bytes());

    for (name, value) in row.iter() {
        let name_bytes = name.as_bytes();
        if name_bytes.len() > u16::MAX as usize {
            return Err(Error::InvalidData("Field name too long".into()));
        }
        buf.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(name_bytes);

        encode_value(&mut buf, value)?;
    }

    Ok(buf)
}

/// Decode bytes back to a row.
pub fn decode_row(data: &[u8]) -> Result<Row, Error> {
    let mut cursor = Cursor { data, pos: 0 };
    let count = cursor.u32("field count")? as usize;
    // Every field takes at least a name length and a tag.
    if count > (data.len() - cursor.pos) / 3 {
        return Err(Error::InvalidData(format!(
            "field count {} exceeds row size {}",
            count,
            data.len()
        )));
    }

    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let name_len = u16::from_le_bytes(cursor.array::<2>("field name length")?) as usize;
        let name = String::from_utf8(cursor.take(name_len, "field name")?.to_vec())
            .map_err(|_| Error::InvalidData("Invalid UTF-8 in field name".into()))?;
        let value = decode_value(&mut cursor)?;
        fields.push((name, value));
    }

    if cursor.pos != data.len() {
        return Err(Error::InvalidData("Trailing bytes after row".into()));
    }

    Ok(fields.into_iter().collect())
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) -> Result<(), Error> {
    match value {
        Value::Null => buf.push(ValueTag::Null as u8),
        Value::Bool(b) => {
            buf.push(ValueTag::Bool as u8);
            buf.push(*b as u8);
        }
        Value::Int(n) => {
            buf.push(ValueTag::Int as u8);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Float(n) => {
            buf.push(ValueTag::Float as u8);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::String(s) => {
            buf.push(ValueTag::String as u8);
            encode_len_prefixed(buf, s.as_bytes())?;
        }
        Value::Bytes(b) => {
            buf.push(ValueTag::Bytes as u8);
            encode_len_prefixed(buf, b)?;
        }
        Value::Timestamp(t) => {
            buf.push(ValueTag::Timestamp as u8);
            buf.extend_from_slice(&t.to_le_bytes());
        }
        Value::Json(j) => {
            buf.push(ValueTag::Json as u8);
            let text = serde_json::to_vec(j).map_err(|e| Error::Serialization(e.to_string()))?;
            encode_len_prefixed(buf, &text)?;
        }
    }
    Ok(())
}

fn encode_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), Error> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::InvalidData("Value too large".into()))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn decode_value(cursor: &mut Cursor<'_>) -> Result<Value, Error> {
    let tag = ValueTag::try_from(cursor.array::<1>("value tag")?[0])?;

    let value = match tag {
        ValueTag::Null => Value::Null,
        ValueTag::Bool => Value::Bool(cursor.array::<1>("bool")?[0] != 0),
        ValueTag::Int => Value::Int(i64::from_le_bytes(cursor.array::<8>("int")?)),
        ValueTag::Float => Value::Float(f64::from_le_bytes(cursor.array::<8>("float")?)),
        ValueTag::Timestamp => Value::Timestamp(i64::from_le_bytes(cursor.array::<8>("timestamp")?)),
        ValueTag::String => {
            let len = cursor.u32("string length")? as usize;
            let bytes = cursor.take(len, "string")?;
            Value::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| Error::InvalidData("Invalid UTF-8 in string".into()))?,
            )
        }
        ValueTag::Bytes => {
            let len = cursor.u32("bytes length")? as usize;
            Value::Bytes(cursor.take(len, "bytes")?.to_vec())
        }
        ValueTag::Json => {
            let len = cursor.u32("json length")? as usize;
            let bytes = cursor.take(len, "json")?;
            Value::Json(
                serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))?,
            )
        }
    };

    Ok(value)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| Error::InvalidData(format!("Data too short for {}", what)))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn u32(&mut self, what: &str) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.array::<4>(what)?))
    }
}
