//! Field values and their type identifiers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifier for the field types a tuple can carry.
///
/// Type IDs prefix every serialized field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeId {
    Null = 0,
    Int64 = 13,
    Float64 = 31,
    /// Opaque comparable variable-length value (strings, binary).
    Bytes = 61,
}

impl TypeId {
    /// Returns the fixed byte size for this type, or None for variable-length types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            TypeId::Null => Some(0),
            TypeId::Int64 | TypeId::Float64 => Some(8),
            TypeId::Bytes => None,
        }
    }

    /// Decodes a type tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TypeId::Null),
            13 => Some(TypeId::Int64),
            31 => Some(TypeId::Float64),
            61 => Some(TypeId::Bytes),
            _ => None,
        }
    }
}

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TypeId::Null => "NULL",
            TypeId::Int64 => "INT64",
            TypeId::Float64 => "FLOAT64",
            TypeId::Bytes => "BYTES",
        };
        write!(f, "{}", name)
    }
}

/// A single typed field of a tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Null,
    Int64(i64),
    Float64(f64),
    Bytes(Bytes),
}

impl Field {
    /// Returns the type identifier of this field.
    pub fn type_id(&self) -> TypeId {
        match self {
            Field::Null => TypeId::Null,
            Field::Int64(_) => TypeId::Int64,
            Field::Float64(_) => TypeId::Float64,
            Field::Bytes(_) => TypeId::Bytes,
        }
    }

    /// Builds a bytes field from a string slice.
    pub fn text(value: &str) -> Self {
        Field::Bytes(Bytes::copy_from_slice(value.as_bytes()))
    }

    /// Returns the integer value, if this is an Int64 field.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Field::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the byte value, if this is a Bytes field.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Field::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the serialized size of this field in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Field::Null => 1,
            Field::Int64(_) | Field::Float64(_) => 1 + 8,
            Field::Bytes(b) => 1 + 2 + b.len(),
        }
    }

    /// Appends the serialized field to `out`.
    ///
    /// Layout: type tag (1 byte), then 8 little-endian bytes for fixed types
    /// or `len:u16` followed by the raw bytes.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.type_id() as u8);
        match self {
            Field::Null => {}
            Field::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Field::Float64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Field::Bytes(b) => {
                out.extend_from_slice(&(b.len() as u16).to_le_bytes());
                out.extend_from_slice(b);
            }
        }
    }

    /// Decodes one field from the front of `buf`.
    ///
    /// Returns the field and the number of bytes consumed, or None if the
    /// buffer is truncated or carries an unknown tag.
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        let tag = TypeId::from_u8(*buf.first()?)?;
        match tag {
            TypeId::Null => Some((Field::Null, 1)),
            TypeId::Int64 | TypeId::Float64 => {
                let raw: [u8; 8] = buf.get(1..9)?.try_into().ok()?;
                let field = if tag == TypeId::Int64 {
                    Field::Int64(i64::from_le_bytes(raw))
                } else {
                    Field::Float64(f64::from_le_bytes(raw))
                };
                Some((field, 9))
            }
            TypeId::Bytes => {
                let len = u16::from_le_bytes([*buf.get(1)?, *buf.get(2)?]) as usize;
                let data = buf.get(3..3 + len)?;
                Some((Field::Bytes(Bytes::copy_from_slice(data)), 3 + len))
            }
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Field::Null => write!(f, "NULL"),
            Field::Int64(v) => write!(f, "{}", v),
            Field::Float64(v) => write!(f, "{}", v),
            Field::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

impl From<i64> for Field {
    fn from(value: i64) -> Self {
        Field::Int64(value)
    }
}

impl From<f64> for Field {
    fn from(value: f64) -> Self {
        Field::Float64(value)
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Field::text(value)
    }
}

impl From<Bytes> for Field {
    fn from(value: Bytes) -> Self {
        Field::Bytes(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_id_fixed_size() {
        assert_eq!(TypeId::Null.fixed_size(), Some(0));
        assert_eq!(TypeId::Int64.fixed_size(), Some(8));
        assert_eq!(TypeId::Float64.fixed_size(), Some(8));
        assert_eq!(TypeId::Bytes.fixed_size(), None);
    }

    #[test]
    fn test_type_id_tags() {
        for type_id in [TypeId::Null, TypeId::Int64, TypeId::Float64, TypeId::Bytes] {
            assert_eq!(TypeId::from_u8(type_id as u8), Some(type_id));
        }
        assert_eq!(TypeId::from_u8(1), None);
        assert_eq!(TypeId::Bytes.to_string(), "BYTES");
    }

    #[test]
    fn test_field_encoding_sizes() {
        let mut out = Vec::new();
        for field in [
            Field::Null,
            Field::Int64(-7),
            Field::Float64(2.5),
            Field::text("hello"),
        ] {
            out.clear();
            field.encode(&mut out);
            assert_eq!(out.len(), field.encoded_len());
            let (decoded, used) = Field::decode(&out).unwrap();
            assert_eq!(decoded, field);
            assert_eq!(used, out.len());
        }
    }

    #[test]
    fn test_field_decode_truncated() {
        let mut out = Vec::new();
        Field::text("abcdef").encode(&mut out);
        assert!(Field::decode(&out[..4]).is_none());
        assert!(Field::decode(&[]).is_none());
        assert!(Field::decode(&[99]).is_none());
    }

    #[test]
    fn test_field_conversions() {
        assert_eq!(Field::from(5i64).as_i64(), Some(5));
        assert_eq!(Field::from("k").as_bytes(), Some(&b"k"[..]));
        assert_eq!(Field::Null.as_i64(), None);
        assert_eq!(Field::from(1.5f64).type_id(), TypeId::Float64);
        assert_eq!(Field::text("v1").to_string(), "v1");
    }
}
